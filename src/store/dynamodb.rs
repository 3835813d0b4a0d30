use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, KeysAndAttributes, PutRequest, WriteRequest,
};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use tracing::debug;

use crate::batch::CapacityMode;
use crate::error::{ErrorKind, StoreError};
use crate::store::{ChunkOutcome, KeyCondition, Page, PageKind, PageRequest, SortCondition, Store};
use crate::table::{Item, Key, KeySchema};

/// Service error codes that mean "try again later"
const RETRYABLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionInProgressException",
];

/// [`Store`] backed by the AWS SDK DynamoDB client
#[derive(Clone, Debug)]
pub struct DynamoDbStore {
    client: Client,
}

impl DynamoDbStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Use the process-wide client, initialising it with defaults if needed
    pub async fn global() -> Self {
        Self::new(crate::dynamodb_client().await.clone())
    }

    /// Underlying SDK client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Map a DynamoDB service error code onto an [`ErrorKind`]
pub(crate) fn classify_code(code: Option<&str>) -> ErrorKind {
    match code {
        Some(code) if RETRYABLE_CODES.contains(&code) => ErrorKind::Throttling,
        Some(_) => ErrorKind::Validation,
        None => ErrorKind::Transport,
    }
}

fn from_sdk<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: fmt::Debug,
{
    let kind = match &err {
        SdkError::ServiceError(service) => classify_code(service.err().code()),
        SdkError::ConstructionFailure(_) => ErrorKind::Validation,
        _ => ErrorKind::Transport,
    };
    let message = match err.message() {
        Some(message) => message.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    StoreError { kind, message }
}

fn from_build(err: BuildError) -> StoreError {
    StoreError::validation(err.to_string())
}

fn non_empty<K, V>(map: &HashMap<K, V>) -> Option<HashMap<K, V>>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone,
{
    (!map.is_empty()).then(|| map.clone())
}

fn count(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Put and delete requests handed back by BatchWriteItem, as items or keys
fn unprocessed_writes(
    unprocessed: Option<HashMap<String, Vec<WriteRequest>>>,
    table: &str,
) -> Vec<Item> {
    unprocessed
        .and_then(|mut tables| tables.remove(table))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|request| match (request.put_request, request.delete_request) {
            (Some(put), _) => Some(put.item),
            (None, Some(delete)) => Some(delete.key),
            (None, None) => None,
        })
        .collect()
}

/// Renders a structured key condition into an expression with its placeholders
#[derive(Debug, Default)]
struct KeyConditionBuilder {
    expression: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl KeyConditionBuilder {
    fn with_partition_key(mut self, field: &str, value: AttributeValue) -> Self {
        self.expression = "#kc_pk = :kc_pk".to_string();
        let _ = self.names.insert("#kc_pk".to_string(), field.to_string());
        let _ = self.values.insert(":kc_pk".to_string(), value);
        self
    }

    fn with_sort_condition(mut self, field: &str, condition: &SortCondition) -> Self {
        let _ = self.names.insert("#kc_sk".to_string(), field.to_string());
        let clause = match condition {
            SortCondition::Eq(value) => {
                let _ = self.values.insert(":kc_sk".to_string(), value.clone());
                "#kc_sk = :kc_sk"
            }
            SortCondition::BeginsWith(prefix) => {
                let _ = self
                    .values
                    .insert(":kc_sk".to_string(), AttributeValue::S(prefix.clone()));
                "begins_with(#kc_sk, :kc_sk)"
            }
            SortCondition::Between(low, high) => {
                let _ = self.values.insert(":kc_sk".to_string(), low.clone());
                let _ = self.values.insert(":kc_sk_end".to_string(), high.clone());
                "#kc_sk BETWEEN :kc_sk AND :kc_sk_end"
            }
        };
        self.expression.push_str(" AND ");
        self.expression.push_str(clause);
        self
    }

    fn build(self) -> (String, HashMap<String, String>, HashMap<String, AttributeValue>) {
        (self.expression, self.names, self.values)
    }
}

/// Render a [`KeyCondition`] against the key attributes of the table or index
pub(crate) fn key_condition(
    condition: &KeyCondition,
    key: &KeySchema,
) -> Result<(String, HashMap<String, String>, HashMap<String, AttributeValue>), StoreError> {
    let builder = KeyConditionBuilder::default()
        .with_partition_key(&key.partition_key, condition.partition.clone());
    let builder = match (&condition.sort, key.sort_key.as_deref()) {
        (Some(sort), Some(field)) => builder.with_sort_condition(field, sort),
        (Some(_), None) => {
            return Err(StoreError::validation(
                "sort key condition given for a table without a sort key",
            ));
        }
        (None, _) => builder,
    };
    Ok(builder.build())
}

impl DynamoDbStore {
    async fn write_requests(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .return_consumed_capacity(capacity.into())
            .send()
            .await
            .map_err(from_sdk)?;

        Ok(ChunkOutcome {
            items: Vec::new(),
            unprocessed: unprocessed_writes(output.unprocessed_items, table),
            capacity: output.consumed_capacity.unwrap_or_default(),
        })
    }
}

impl Store for DynamoDbStore {
    async fn write_chunk(
        &self,
        table: &str,
        items: Vec<Item>,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let requests = items
            .into_iter()
            .map(|item| {
                let put = PutRequest::builder().set_item(Some(item)).build()?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>, BuildError>>()
            .map_err(from_build)?;
        self.write_requests(table, requests, capacity).await
    }

    async fn delete_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let requests = keys
            .into_iter()
            .map(|key| {
                let delete = DeleteRequest::builder().set_key(Some(key)).build()?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<Result<Vec<_>, BuildError>>()
            .map_err(from_build)?;
        self.write_requests(table, requests, capacity).await
    }

    async fn read_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        consistent_read: bool,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let request = KeysAndAttributes::builder()
            .set_keys(Some(keys))
            .consistent_read(consistent_read)
            .build()
            .map_err(from_build)?;

        let output = self
            .client
            .batch_get_item()
            .request_items(table, request)
            .return_consumed_capacity(capacity.into())
            .send()
            .await
            .map_err(from_sdk)?;

        let items = output
            .responses
            .and_then(|mut responses| responses.remove(table))
            .unwrap_or_default();
        let unprocessed = output
            .unprocessed_keys
            .and_then(|mut tables| tables.remove(table))
            .map(|pending| pending.keys)
            .unwrap_or_default();

        Ok(ChunkOutcome {
            items,
            unprocessed,
            capacity: output.consumed_capacity.unwrap_or_default(),
        })
    }

    async fn page_fetch(
        &self,
        request: &PageRequest,
        cursor: Option<Key>,
    ) -> Result<Page, StoreError> {
        match &request.kind {
            PageKind::Scan { segment } => {
                let (segment, total_segments) = segment.unzip();
                let output = self
                    .client
                    .scan()
                    .table_name(&request.table)
                    .set_index_name(request.index_name.clone())
                    .set_exclusive_start_key(cursor)
                    .set_limit(request.limit)
                    .set_filter_expression(request.filter_expression.clone())
                    .set_expression_attribute_names(non_empty(&request.expression_attribute_names))
                    .set_expression_attribute_values(non_empty(
                        &request.expression_attribute_values,
                    ))
                    .set_segment(segment)
                    .set_total_segments(total_segments)
                    .consistent_read(request.consistent_read)
                    .return_consumed_capacity(request.capacity.into())
                    .send()
                    .await
                    .map_err(from_sdk)?;

                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    cursor: output.last_evaluated_key,
                    capacity: output.consumed_capacity,
                    count: count(output.count),
                    scanned_count: count(output.scanned_count),
                })
            }
            PageKind::Query {
                key,
                condition,
                scan_index_forward,
            } => {
                let (expression, mut names, mut values) = key_condition(condition, key)?;
                names.extend(request.expression_attribute_names.clone());
                values.extend(request.expression_attribute_values.clone());
                debug!(table = %request.table, %expression, "query key condition");

                let output = self
                    .client
                    .query()
                    .table_name(&request.table)
                    .set_index_name(request.index_name.clone())
                    .key_condition_expression(expression)
                    .set_expression_attribute_names(Some(names))
                    .set_expression_attribute_values(Some(values))
                    .set_filter_expression(request.filter_expression.clone())
                    .set_exclusive_start_key(cursor)
                    .set_limit(request.limit)
                    .scan_index_forward(*scan_index_forward)
                    .consistent_read(request.consistent_read)
                    .return_consumed_capacity(request.capacity.into())
                    .send()
                    .await
                    .map_err(from_sdk)?;

                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    cursor: output.last_evaluated_key,
                    capacity: output.consumed_capacity,
                    count: count(output.count),
                    scanned_count: count(output.scanned_count),
                })
            }
        }
    }
}
