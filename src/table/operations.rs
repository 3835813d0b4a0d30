use serde::{Serialize, de::DeserializeOwned};
use serde_dynamo::{from_item, to_attribute_value, to_item};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::batch::{BatchOptions, BatchReadOutput, BatchWriteOutput, Batcher, QueryOptions, ScanOptions, ScanOutput};
use crate::error::Error;
use crate::store::{KeyCondition, SortCondition, Store};
use crate::table::types::{CompositeKey, Item, Key, KeySchema, TableSchema};

/// A Rust type stored as items of one DynamoDB table
///
/// Items are converted with `serde_dynamo`, so the serialized form of the
/// key fields must match the table's key attribute types.
///
/// # Example
///
/// ```rust
/// use dynamo_batch::DynamoTable;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Order {
///     customer: String,
///     number: u64,
///     total: f64,
/// }
///
/// impl DynamoTable for Order {
///     type PK = String;
///     type SK = u64;
///
///     const TABLE: &'static str = "orders";
///     const PARTITION_KEY: &'static str = "customer";
///     const SORT_KEY: Option<&'static str> = Some("number");
///
///     fn partition_key(&self) -> Self::PK {
///         self.customer.clone()
///     }
///
///     fn sort_key(&self) -> Option<Self::SK> {
///         Some(self.number)
///     }
/// }
///
/// assert_eq!(Order::table_schema().name, "orders");
/// ```
pub trait DynamoTable: Serialize + DeserializeOwned + Send + Sync {
    /// Associated partition key type
    type PK: Serialize + Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Associated sort key type
    type SK: Serialize + Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Name of the table
    const TABLE: &'static str;

    /// Partition key attribute
    const PARTITION_KEY: &'static str;

    /// Sort key attribute
    const SORT_KEY: Option<&'static str> = None;

    /// Partition key value
    fn partition_key(&self) -> Self::PK;

    /// Sort key value
    fn sort_key(&self) -> Option<Self::SK> {
        None
    }

    /// Partition and sort key together
    fn composite_key(&self) -> CompositeKey<Self::PK, Self::SK> {
        (self.partition_key(), self.sort_key())
    }

    /// Key attribute names
    fn key_schema() -> KeySchema {
        KeySchema {
            partition_key: Self::PARTITION_KEY.to_string(),
            sort_key: Self::SORT_KEY.map(str::to_string),
        }
    }

    /// Table name and key attribute names
    fn table_schema() -> TableSchema {
        TableSchema::new(Self::TABLE, Self::key_schema())
    }

    /// Serialize into a DynamoDB item
    fn to_item(&self) -> Result<Item, Error> {
        Ok(to_item(self)?)
    }

    /// Deserialize from a DynamoDB item
    fn from_item(item: Item) -> Result<Self, Error> {
        Ok(from_item(item)?)
    }

    /// Build the key item addressed by `key`
    fn key_item(key: &CompositeKey<Self::PK, Self::SK>) -> Result<Key, Error> {
        let mut item = HashMap::from([(
            Self::PARTITION_KEY.to_string(),
            to_attribute_value(&key.0)?,
        )]);
        if let (Some(name), Some(sort)) = (Self::SORT_KEY, &key.1) {
            let _ = item.insert(name.to_string(), to_attribute_value(sort)?);
        }
        Ok(item)
    }
}

impl<S: Store> Batcher<S> {
    /// Coordinator over `store` for the table of `T`
    pub fn for_table<T: DynamoTable>(store: Arc<S>) -> Self {
        Self::new(store, T::table_schema())
    }
}

fn check_table<T: DynamoTable, S>(batcher: &Batcher<S>) -> Result<(), Error> {
    if batcher.table.name == T::TABLE {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "batcher targets table {} but items belong to {}",
            batcher.table.name,
            T::TABLE
        )))
    }
}

/// Put typed values
pub async fn batch_put<T, S>(
    batcher: &Batcher<S>,
    values: &[T],
    options: &BatchOptions,
) -> Result<BatchWriteOutput, Error>
where
    T: DynamoTable,
    S: Store,
{
    check_table::<T, S>(batcher)?;
    let items = values.iter().map(T::to_item).collect::<Result<Vec<_>, _>>()?;
    batcher.put_items(items, options).await
}

/// Delete items by key
pub async fn batch_delete<T, S>(
    batcher: &Batcher<S>,
    keys: &[CompositeKey<T::PK, T::SK>],
    options: &BatchOptions,
) -> Result<BatchWriteOutput, Error>
where
    T: DynamoTable,
    S: Store,
{
    check_table::<T, S>(batcher)?;
    let keys = keys.iter().map(T::key_item).collect::<Result<Vec<_>, _>>()?;
    batcher.delete_items(keys, options).await
}

/// Read typed values by key
///
/// Keys with no stored item are absent from the output; see
/// [`DynamoTableMethods::missing_keys`](crate::DynamoTableMethods::missing_keys).
pub async fn batch_get<T, S>(
    batcher: &Batcher<S>,
    keys: &[CompositeKey<T::PK, T::SK>],
    options: &BatchOptions,
) -> Result<BatchReadOutput<T>, Error>
where
    T: DynamoTable,
    S: Store,
{
    check_table::<T, S>(batcher)?;
    let keys = keys.iter().map(T::key_item).collect::<Result<Vec<_>, _>>()?;
    batcher.get_items(keys, options).await?.try_map(T::from_item)
}

/// Scan the table into typed values
pub async fn scan_items<T, S>(
    batcher: &Batcher<S>,
    options: &ScanOptions,
) -> Result<ScanOutput<T>, Error>
where
    T: DynamoTable,
    S: Store,
{
    check_table::<T, S>(batcher)?;
    batcher.scan(options).await?.try_map(T::from_item)
}

/// Query one partition into typed values
pub async fn query_items<T, S>(
    batcher: &Batcher<S>,
    partition_key: &T::PK,
    sort: Option<SortCondition>,
    options: &QueryOptions,
) -> Result<ScanOutput<T>, Error>
where
    T: DynamoTable,
    S: Store,
{
    check_table::<T, S>(batcher)?;
    let condition = KeyCondition {
        partition: to_attribute_value(partition_key)?,
        sort,
    };
    batcher.query(condition, options).await?.try_map(T::from_item)
}
