//! The narrow RPC boundary between the batch engine and the data store.
//!
//! A [`Store`] executes exactly one physical call per method invocation. It
//! never retries and never splits requests; those are the engine's job.

use aws_sdk_dynamodb::types::{AttributeValue, ConsumedCapacity};
use std::collections::HashMap;
use std::future::Future;

use crate::batch::CapacityMode;
use crate::error::StoreError;
use crate::table::{Item, Key, KeySchema};

mod dynamodb;
pub mod memory;

pub use dynamodb::DynamoDbStore;
pub use memory::MemoryStore;

/// Maximum number of write requests DynamoDB accepts in one BatchWriteItem call
pub const MAX_WRITE_CHUNK: usize = 25;

/// Maximum number of keys DynamoDB accepts in one BatchGetItem call
pub const MAX_READ_CHUNK: usize = 100;

/// Result of one chunk-level call that reached the store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkOutcome {
    /// Items returned by a read; empty for writes
    pub items: Vec<Item>,
    /// Submitted items or keys the store did not process
    pub unprocessed: Vec<Item>,
    /// Capacity consumed by the call, when requested
    pub capacity: Vec<ConsumedCapacity>,
}

/// One page of a scan or query
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Items on this page
    pub items: Vec<Item>,
    /// Continuation cursor; `None` when the traversal is complete
    pub cursor: Option<Key>,
    /// Capacity consumed by the call, when requested
    pub capacity: Option<ConsumedCapacity>,
    /// Number of items after filtering
    pub count: usize,
    /// Number of items evaluated before filtering
    pub scanned_count: usize,
}

/// Condition applied to the sort key of a query
#[derive(Clone, Debug, PartialEq)]
pub enum SortCondition {
    /// Sort key equals the value
    Eq(AttributeValue),
    /// Sort key starts with the string prefix
    BeginsWith(String),
    /// Sort key lies within the inclusive range
    Between(AttributeValue, AttributeValue),
}

/// Structured key condition for a query
#[derive(Clone, Debug, PartialEq)]
pub struct KeyCondition {
    /// Partition key value to match
    pub partition: AttributeValue,
    /// Optional sort key restriction
    pub sort: Option<SortCondition>,
}

/// Which traversal a [`PageRequest`] drives
#[derive(Clone, Debug, PartialEq)]
pub enum PageKind {
    /// Full table (or index) scan, optionally one segment of a parallel scan
    Scan {
        /// `(segment, total_segments)` for parallel scans
        segment: Option<(i32, i32)>,
    },
    /// Query of a single partition
    Query {
        /// Key attributes of the table or index being queried
        key: KeySchema,
        /// Key condition
        condition: KeyCondition,
        /// Ascending sort key order when true
        scan_index_forward: bool,
    },
}

/// Everything a store needs to fetch one page, apart from the cursor
#[derive(Clone, Debug, PartialEq)]
pub struct PageRequest {
    /// Table name
    pub table: String,
    /// Scan or query
    pub kind: PageKind,
    /// Secondary index to read instead of the base table
    pub index_name: Option<String>,
    /// Filter applied after reading
    pub filter_expression: Option<String>,
    /// Placeholder names used by the filter expression
    pub expression_attribute_names: HashMap<String, String>,
    /// Placeholder values used by the filter expression
    pub expression_attribute_values: Item,
    /// Maximum items evaluated per page
    pub limit: Option<i32>,
    /// Strongly consistent read
    pub consistent_read: bool,
    /// Capacity reporting
    pub capacity: CapacityMode,
}

impl PageRequest {
    /// A scan of the whole table
    pub fn scan(table: impl Into<String>) -> Self {
        Self::new(table, PageKind::Scan { segment: None })
    }

    /// A query of one partition
    ///
    /// `key` names the key attributes of the table (or index) queried.
    pub fn query(table: impl Into<String>, key: KeySchema, condition: KeyCondition) -> Self {
        Self::new(
            table,
            PageKind::Query {
                key,
                condition,
                scan_index_forward: true,
            },
        )
    }

    fn new(table: impl Into<String>, kind: PageKind) -> Self {
        Self {
            table: table.into(),
            kind,
            index_name: None,
            filter_expression: None,
            expression_attribute_names: HashMap::new(),
            expression_attribute_values: HashMap::new(),
            limit: None,
            consistent_read: false,
            capacity: CapacityMode::None,
        }
    }
}

/// Chunk-level access to a remote key-value store
///
/// Implementations perform one physical call per invocation. On partial
/// rejection they return the exact rejected items in
/// [`ChunkOutcome::unprocessed`]; a rejection of the whole call is an
/// [`StoreError`] whose kind separates validation from transient failure.
pub trait Store: Send + Sync {
    /// Put up to [`MAX_WRITE_CHUNK`] items
    fn write_chunk(
        &self,
        table: &str,
        items: Vec<Item>,
        capacity: CapacityMode,
    ) -> impl Future<Output = Result<ChunkOutcome, StoreError>> + Send;

    /// Delete up to [`MAX_WRITE_CHUNK`] keys
    fn delete_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        capacity: CapacityMode,
    ) -> impl Future<Output = Result<ChunkOutcome, StoreError>> + Send;

    /// Read up to [`MAX_READ_CHUNK`] keys
    fn read_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        consistent_read: bool,
        capacity: CapacityMode,
    ) -> impl Future<Output = Result<ChunkOutcome, StoreError>> + Send;

    /// Fetch the page following `cursor` (or the first page)
    fn page_fetch(
        &self,
        request: &PageRequest,
        cursor: Option<Key>,
    ) -> impl Future<Output = Result<Page, StoreError>> + Send;
}
