//! The batching engine: chunking, concurrency limiting, retry and
//! aggregation for batch put/delete/get, plus paginated scan/query.

mod aggregate;
mod chunker;
mod dispatcher;
mod limiter;
mod options;
mod paginator;
mod retry;

pub use aggregate::{Aggregated, CallMetadata, ChunkRecord, Operation, merge, total_capacity_units};
pub use chunker::chunk;
pub use dispatcher::{BatchReadOutput, BatchWriteOutput, Batcher};
pub use limiter::{Cancelled, Limiter};
pub use options::{Backoff, BatchConfig, BatchOptions, CapacityMode, QueryOptions, ScanOptions};
pub use paginator::{PageState, Paginator, ScanOutput, ScanPage};
pub use retry::{RetryDecision, RetryPolicy};
