use aws_sdk_dynamodb::types::ConsumedCapacity;
use std::fmt;

use crate::error::ErrorKind;
use crate::table::Item;

/// Store operation behind a physical call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Batch put
    Put,
    /// Batch delete
    Delete,
    /// Batch get
    Get,
    /// Scan page
    Scan,
    /// Query page
    Query,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Get => "get",
            Operation::Scan => "scan",
            Operation::Query => "query",
        };
        f.write_str(name)
    }
}

/// Accounting for one physical store call
#[derive(Clone, Debug, PartialEq)]
pub struct CallMetadata {
    /// Issue order within the operation, starting at 0
    pub seq: usize,
    /// Operation performed
    pub operation: Operation,
    /// Attempt number of the chunk or page this call served, starting at 1
    pub attempt: usize,
    /// Items or keys sent
    pub requested: usize,
    /// Items or keys the store handed back unprocessed
    pub unprocessed: usize,
    /// Capacity reported by the store; empty unless requested
    pub capacity: Vec<ConsumedCapacity>,
    /// Failure class when the call was rejected as a whole
    pub error: Option<ErrorKind>,
}

impl CallMetadata {
    /// Capacity units consumed by this call
    pub fn capacity_units(&self) -> f64 {
        self.capacity
            .iter()
            .filter_map(ConsumedCapacity::capacity_units)
            .sum()
    }
}

/// What one chunk lifecycle (or one page) contributed to an operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkRecord {
    /// Input items that committed, tagged with their input position
    pub succeeded: Vec<(usize, Item)>,
    /// Items returned by reads
    pub retrieved: Vec<Item>,
    /// One entry per physical call
    pub calls: Vec<CallMetadata>,
}

/// Merged view over every [`ChunkRecord`] of an operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregated {
    /// Committed input items in input order
    pub succeeded: Vec<Item>,
    /// Items returned by reads, in completion order
    pub retrieved: Vec<Item>,
    /// Call metadata in issue order
    pub metadata: Vec<CallMetadata>,
}

/// Merge per-chunk records into one result
///
/// Metadata is ordered by call issue sequence (retries included) rather than
/// by logical chunk. Read results keep the order in which records arrived;
/// they have no positional relation to the requested keys.
pub fn merge(records: impl IntoIterator<Item = ChunkRecord>) -> Aggregated {
    let mut succeeded = Vec::new();
    let mut out = Aggregated::default();

    for record in records {
        succeeded.extend(record.succeeded);
        out.retrieved.extend(record.retrieved);
        out.metadata.extend(record.calls);
    }

    succeeded.sort_by_key(|(index, _)| *index);
    out.succeeded = succeeded.into_iter().map(|(_, item)| item).collect();
    out.metadata.sort_by_key(|call| call.seq);
    out
}

/// Total capacity units over a metadata list
pub fn total_capacity_units(metadata: &[CallMetadata]) -> f64 {
    metadata.iter().map(CallMetadata::capacity_units).sum()
}
