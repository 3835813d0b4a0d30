/// Test helpers and fixtures for batch integration tests
///
/// Every test runs against an in-process `MemoryStore`, so no DynamoDB
/// endpoint is needed.
pub mod fixtures;

pub use aws_sdk_dynamodb::types::AttributeValue;
pub use dynamo_batch::{
    BatchOptions, Batcher, CancellationToken, Error, ErrorKind, Item, Key, KeySchema,
    MemoryStore, ScanOptions, TableSchema,
};
pub use rusty_ulid::generate_ulid_string;
pub use std::collections::HashMap;
pub use std::sync::Arc;
pub use std::time::Duration;

#[allow(unused_imports)]
pub use fixtures::Event;

/// Table used by the untyped tests
pub const TABLE: &str = "batch_items";

/// Schema of [`TABLE`]: string `id`, numeric `range`
pub fn schema() -> TableSchema {
    TableSchema::new(TABLE, KeySchema::composite("id", "range"))
}

/// A valid item with a unique id
pub fn item(range: usize) -> Item {
    HashMap::from([
        ("id".to_string(), AttributeValue::S(generate_ulid_string())),
        ("range".to_string(), AttributeValue::N(range.to_string())),
        (
            "payload".to_string(),
            AttributeValue::S(format!("payload-{range}")),
        ),
    ])
}

/// `count` valid items numbered from zero
pub fn items(count: usize) -> Vec<Item> {
    (0..count).map(item).collect()
}

/// An item carrying none of the table's key attributes
#[allow(dead_code)]
pub fn invalid_item() -> Item {
    HashMap::from([
        ("hash".to_string(), AttributeValue::S("failure".to_string())),
        ("span".to_string(), AttributeValue::N("7".to_string())),
    ])
}

/// Key attributes of each item
pub fn keys(items: &[Item]) -> Vec<Key> {
    let schema = schema();
    items.iter().map(|item| schema.key.key_of(item)).collect()
}

/// Numeric `range` attribute of an item
#[allow(dead_code)]
pub fn range_of(item: &Item) -> usize {
    match item.get("range") {
        Some(AttributeValue::N(n)) => n.parse().unwrap(),
        other => panic!("unexpected range attribute {other:?}"),
    }
}

/// Empty store for [`TABLE`]
pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(schema()))
}

/// Coordinator over `store`
pub fn batcher(store: &Arc<MemoryStore>) -> Batcher<MemoryStore> {
    Batcher::new(Arc::clone(store), schema())
}

/// Number of items a full scan returns
#[allow(dead_code)]
pub async fn scan_count(batcher: &Batcher<MemoryStore>) -> usize {
    batcher
        .scan(&ScanOptions::default())
        .await
        .unwrap()
        .items
        .len()
}
