//! Table descriptions and the typed layer over [`Batcher`](crate::Batcher).

mod operations;
mod types;

pub use operations::{
    DynamoTable, batch_delete, batch_get, batch_put, query_items, scan_items,
};
pub use types::{CompositeKey, Item, Key, KeySchema, PartitionKey, SortKey, TableSchema};
