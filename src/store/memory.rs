//! In-process [`Store`] with DynamoDB-like limits and validation.
//!
//! Useful as a test double: calls can be slowed down, failed on demand or
//! made to hand back a chosen subset as unprocessed, and the store records
//! how many calls it served and how many overlapped.

use aws_sdk_dynamodb::types::{AttributeValue, ConsumedCapacity};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::batch::CapacityMode;
use crate::error::{ErrorKind, StoreError};
use crate::store::{
    ChunkOutcome, KeyCondition, MAX_READ_CHUNK, MAX_WRITE_CHUNK, Page, PageKind, PageRequest,
    SortCondition, Store,
};
use crate::table::{Item, Key, TableSchema};

/// Default number of items evaluated per scan or query page
pub const DEFAULT_PAGE_SIZE: usize = 100;

type Rejection = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// In-memory single-table store
pub struct MemoryStore {
    table: TableSchema,
    rows: Mutex<BTreeMap<String, Item>>,
    page_size: usize,
    latency: Duration,
    faults: Mutex<VecDeque<ErrorKind>>,
    rejection: Option<Rejection>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("table", &self.table)
            .field("rows", &self.rows.lock().len())
            .field("page_size", &self.page_size)
            .field("latency", &self.latency)
            .field("calls", &self.call_count())
            .finish()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn invalid(reason: impl fmt::Display) -> StoreError {
    StoreError::validation(format!(
        "One or more parameter values were invalid: {reason}"
    ))
}

impl MemoryStore {
    /// Empty store for `table`
    pub fn new(table: TableSchema) -> Self {
        Self {
            table,
            rows: Mutex::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
            faults: Mutex::new(VecDeque::new()),
            rejection: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Items evaluated per page when the request sets no limit
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Always hand back items (or keys) matching `predicate` as unprocessed
    pub fn with_rejection<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Item) -> bool + Send + Sync + 'static,
    {
        self.rejection = Some(Arc::new(predicate));
        self
    }

    /// Fail the next `count` calls as a whole with `kind`
    pub fn fail_next(&self, kind: ErrorKind, count: usize) {
        self.faults
            .lock()
            .extend(std::iter::repeat_n(kind, count));
    }

    /// Table served by this store
    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    /// Store an item directly, bypassing limits and instrumentation
    pub fn insert(&self, item: Item) {
        let fingerprint = self.table.key.fingerprint(&item);
        let _ = self.rows.lock().insert(fingerprint, item);
    }

    /// Stored item with the same key as `key`
    pub fn get(&self, key: &Key) -> Option<Item> {
        self.rows
            .lock()
            .get(&self.table.key.fingerprint(key))
            .cloned()
    }

    /// All stored items in scan order
    pub fn items(&self) -> Vec<Item> {
        self.rows.lock().values().cloned().collect()
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no items
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Calls served so far, failed ones included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Highest number of calls observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    async fn enter(&self) -> Result<InFlight<'_>, StoreError> {
        let _ = self.calls.fetch_add(1, Ordering::AcqRel);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.faults.lock().pop_front() {
            Some(ErrorKind::Validation) => Err(StoreError::validation("injected validation failure")),
            Some(ErrorKind::Throttling) => Err(StoreError::throttling(
                "The level of configured provisioned throughput for the table was exceeded",
            )),
            Some(ErrorKind::Transport) => Err(StoreError::transport("connection reset by peer")),
            None => Ok(guard),
        }
    }

    fn check_table(&self, table: &str) -> Result<(), StoreError> {
        if table == self.table.name {
            Ok(())
        } else {
            Err(StoreError::validation(format!(
                "Requested resource not found: table {table}"
            )))
        }
    }

    fn check_batch(&self, requests: &[Item], max: usize, keys_only: bool) -> Result<(), StoreError> {
        if requests.is_empty() || requests.len() > max {
            return Err(invalid(format!(
                "batch must contain between 1 and {max} requests, got {}",
                requests.len()
            )));
        }

        let mut seen = HashSet::with_capacity(requests.len());
        for request in requests {
            let checked = if keys_only {
                self.table.key.check_key(request)
            } else {
                self.table.key.check(request)
            };
            checked.map_err(invalid)?;
            if !seen.insert(self.table.key.fingerprint(request)) {
                return Err(invalid("Provided list of item keys contains duplicates"));
            }
        }
        Ok(())
    }

    fn split_rejected(&self, requests: Vec<Item>) -> (Vec<Item>, Vec<Item>) {
        match &self.rejection {
            Some(rejects) => requests.into_iter().partition(|item| !rejects(item)),
            None => (requests, Vec::new()),
        }
    }

    fn capacity(&self, mode: CapacityMode, units: f64) -> Option<ConsumedCapacity> {
        mode.is_enabled().then(|| {
            ConsumedCapacity::builder()
                .table_name(&self.table.name)
                .capacity_units(units)
                .build()
        })
    }

    fn sort_value<'a>(&self, item: &'a Item) -> Option<&'a AttributeValue> {
        self.table
            .key
            .sort_key
            .as_deref()
            .and_then(|name| item.get(name))
    }

    fn matches(&self, item: &Item, condition: &KeyCondition) -> bool {
        if item.get(&self.table.key.partition_key) != Some(&condition.partition) {
            return false;
        }
        let Some(sort) = &condition.sort else {
            return true;
        };
        let Some(value) = self.sort_value(item) else {
            return false;
        };
        match sort {
            SortCondition::Eq(expected) => value == expected,
            SortCondition::BeginsWith(prefix) => {
                matches!(value, AttributeValue::S(s) if s.starts_with(prefix.as_str()))
            }
            SortCondition::Between(low, high) => {
                matches!(
                    compare(value, low),
                    Some(CmpOrdering::Greater | CmpOrdering::Equal)
                ) && matches!(
                    compare(value, high),
                    Some(CmpOrdering::Less | CmpOrdering::Equal)
                )
            }
        }
    }

    fn scan_rows(&self, segment: Option<(i32, i32)>, cursor: Option<&Key>) -> Vec<Item> {
        let rows = self.rows.lock();
        let start = match cursor {
            Some(key) => Bound::Excluded(self.table.key.fingerprint(key)),
            None => Bound::Unbounded,
        };
        rows.range((start, Bound::Unbounded))
            .filter(|(fingerprint, _)| match segment {
                Some((segment, total)) => segment_of(fingerprint, total) == segment,
                None => true,
            })
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn query_rows(
        &self,
        condition: &KeyCondition,
        forward: bool,
        cursor: Option<&Key>,
    ) -> Result<Vec<Item>, StoreError> {
        if condition.sort.is_some() && self.table.key.sort_key.is_none() {
            return Err(invalid("sort key condition on a table without a sort key"));
        }

        let mut rows: Vec<Item> = self
            .rows
            .lock()
            .values()
            .filter(|item| self.matches(item, condition))
            .cloned()
            .collect();
        rows.sort_by(|a, b| self.query_order(a, b));
        if !forward {
            rows.reverse();
        }

        // The cursor item may be gone; resume from its position in key order.
        if let Some(cursor) = cursor {
            let past = if forward {
                CmpOrdering::Greater
            } else {
                CmpOrdering::Less
            };
            rows.retain(|item| self.query_order(item, cursor) == past);
        }
        Ok(rows)
    }

    /// Ascending query order: sort key value, then key fingerprint
    fn query_order(&self, left: &Item, right: &Item) -> CmpOrdering {
        let by_sort = match (self.sort_value(left), self.sort_value(right)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(CmpOrdering::Equal),
            _ => CmpOrdering::Equal,
        };
        by_sort.then_with(|| {
            self.table
                .key
                .fingerprint(left)
                .cmp(&self.table.key.fingerprint(right))
        })
    }
}

fn segment_of(fingerprint: &str, total: i32) -> i32 {
    let hash = fingerprint
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    let total = u32::try_from(total.max(1)).unwrap_or(1);
    i32::try_from(hash % total).unwrap_or(0)
}

fn compare(left: &AttributeValue, right: &AttributeValue) -> Option<CmpOrdering> {
    match (left, right) {
        (AttributeValue::S(a), AttributeValue::S(b)) => Some(a.cmp(b)),
        (AttributeValue::N(a), AttributeValue::N(b)) => {
            let a: f64 = a.parse().ok()?;
            let b: f64 = b.parse().ok()?;
            a.partial_cmp(&b)
        }
        (AttributeValue::B(a), AttributeValue::B(b)) => Some(a.as_ref().cmp(b.as_ref())),
        _ => None,
    }
}

impl Store for MemoryStore {
    async fn write_chunk(
        &self,
        table: &str,
        items: Vec<Item>,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let _call = self.enter().await?;
        self.check_table(table)?;
        self.check_batch(&items, MAX_WRITE_CHUNK, false)?;

        let (accepted, unprocessed) = self.split_rejected(items);
        let written = accepted.len();
        {
            let mut rows = self.rows.lock();
            for item in accepted {
                let _ = rows.insert(self.table.key.fingerprint(&item), item);
            }
        }

        Ok(ChunkOutcome {
            items: Vec::new(),
            unprocessed,
            capacity: self.capacity(capacity, written as f64).into_iter().collect(),
        })
    }

    async fn delete_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let _call = self.enter().await?;
        self.check_table(table)?;
        self.check_batch(&keys, MAX_WRITE_CHUNK, true)?;

        let (accepted, unprocessed) = self.split_rejected(keys);
        let deleted = accepted.len();
        {
            let mut rows = self.rows.lock();
            for key in &accepted {
                let _ = rows.remove(&self.table.key.fingerprint(key));
            }
        }

        Ok(ChunkOutcome {
            items: Vec::new(),
            unprocessed,
            capacity: self.capacity(capacity, deleted as f64).into_iter().collect(),
        })
    }

    async fn read_chunk(
        &self,
        table: &str,
        keys: Vec<Key>,
        consistent_read: bool,
        capacity: CapacityMode,
    ) -> Result<ChunkOutcome, StoreError> {
        let _call = self.enter().await?;
        self.check_table(table)?;
        self.check_batch(&keys, MAX_READ_CHUNK, true)?;

        let (accepted, unprocessed) = self.split_rejected(keys);
        let items: Vec<Item> = {
            let rows = self.rows.lock();
            accepted
                .iter()
                .filter_map(|key| rows.get(&self.table.key.fingerprint(key)).cloned())
                .collect()
        };
        let per_read = if consistent_read { 1.0 } else { 0.5 };
        let units = accepted.len() as f64 * per_read;

        Ok(ChunkOutcome {
            items,
            unprocessed,
            capacity: self.capacity(capacity, units).into_iter().collect(),
        })
    }

    async fn page_fetch(
        &self,
        request: &PageRequest,
        cursor: Option<Key>,
    ) -> Result<Page, StoreError> {
        let _call = self.enter().await?;
        self.check_table(&request.table)?;
        if request.index_name.is_some() || request.filter_expression.is_some() {
            return Err(invalid("indexes and filter expressions are not supported in memory"));
        }

        let limit = match request.limit {
            Some(limit) => usize::try_from(limit)
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| invalid("Limit must be greater than or equal to 1"))?,
            None => self.page_size,
        };

        let rows = match &request.kind {
            PageKind::Scan { segment } => self.scan_rows(*segment, cursor.as_ref()),
            PageKind::Query {
                key,
                condition,
                scan_index_forward,
            } => {
                if *key != self.table.key {
                    return Err(invalid("query key schema does not match the table"));
                }
                self.query_rows(condition, *scan_index_forward, cursor.as_ref())?
            }
        };

        let more = rows.len() > limit;
        let items: Vec<Item> = rows.into_iter().take(limit).collect();
        let next = if more {
            items.last().map(|item| self.table.key.key_of(item))
        } else {
            None
        };
        let per_read = if request.consistent_read { 1.0 } else { 0.5 };
        let units = items.len() as f64 * per_read;

        Ok(Page {
            count: items.len(),
            scanned_count: items.len(),
            capacity: self.capacity(request.capacity, units),
            cursor: next,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::KeySchema;
    use std::collections::HashMap;

    fn schema() -> KeySchema {
        KeySchema::composite("id", "range")
    }

    fn store() -> MemoryStore {
        MemoryStore::new(TableSchema::new("t", schema()))
    }

    fn partition(id: &str) -> KeyCondition {
        KeyCondition {
            partition: AttributeValue::S(id.to_string()),
            sort: None,
        }
    }

    fn item(id: &str, range: i64) -> Item {
        HashMap::from([
            ("id".to_string(), AttributeValue::S(id.to_string())),
            ("range".to_string(), AttributeValue::N(range.to_string())),
            ("data".to_string(), AttributeValue::S("x".to_string())),
        ])
    }

    fn key(id: &str, range: i64) -> Key {
        store().table.key.key_of(&item(id, range))
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = store();
        let outcome = store
            .write_chunk("t", vec![item("a", 1), item("b", 2)], CapacityMode::Total)
            .await
            .unwrap();
        assert!(outcome.unprocessed.is_empty());
        assert_eq!(outcome.capacity.len(), 1);
        assert_eq!(store.len(), 2);

        let read = store
            .read_chunk("t", vec![key("a", 1), key("zz", 9)], false, CapacityMode::None)
            .await
            .unwrap();
        assert_eq!(read.items, vec![item("a", 1)]);
        assert!(read.capacity.is_empty());

        let _ = store
            .delete_chunk("t", vec![key("a", 1)], CapacityMode::None)
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.call_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_key_rejects_whole_call() {
        let store = store();
        let bad = HashMap::from([
            ("hash".to_string(), AttributeValue::S("failure".to_string())),
            ("span".to_string(), AttributeValue::N("7".to_string())),
        ]);
        let err = store
            .write_chunk("t", vec![item("a", 1), bad], CapacityMode::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_limits_and_duplicates() {
        let store = store();
        let too_many: Vec<Item> = (0..26).map(|i| item("a", i)).collect();
        assert!(store.write_chunk("t", too_many, CapacityMode::None).await.is_err());

        let dupes = vec![item("a", 1), item("a", 1)];
        let err = store.write_chunk("t", dupes, CapacityMode::None).await.unwrap_err();
        assert!(err.message.contains("duplicates"));

        let extra = vec![item("a", 1)];
        assert!(store.delete_chunk("t", extra, CapacityMode::None).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_and_rejection() {
        let store = store().with_rejection(|item| {
            item.get("id") == Some(&AttributeValue::S("reject".to_string()))
        });
        store.fail_next(ErrorKind::Throttling, 1);

        let err = store
            .write_chunk("t", vec![item("a", 1)], CapacityMode::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Throttling);

        let outcome = store
            .write_chunk("t", vec![item("a", 1), item("reject", 1)], CapacityMode::None)
            .await
            .unwrap();
        assert_eq!(outcome.unprocessed, vec![item("reject", 1)]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_pages_follow_cursor() {
        let store = store().with_page_size(4);
        for i in 0..10 {
            store.insert(item(&format!("p{i:02}"), i));
        }

        let request = PageRequest::scan("t");
        let mut cursor = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = store.page_fetch(&request, cursor).await.unwrap();
            seen += page.items.len();
            pages += 1;
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(seen, 10);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn test_query_sort_conditions() {
        let store = store();
        for i in 0..10 {
            store.insert(item("p", i));
        }
        store.insert(item("other", 1));

        let between = KeyCondition {
            partition: AttributeValue::S("p".to_string()),
            sort: Some(SortCondition::Between(
                AttributeValue::N("2".to_string()),
                AttributeValue::N("5".to_string()),
            )),
        };
        let page = store
            .page_fetch(&PageRequest::query("t", schema(), between), None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 4);
        assert_eq!(page.items[0], item("p", 2));

        let mut reverse = PageRequest::query("t", schema(), partition("p"));
        reverse.kind = PageKind::Query {
            key: schema(),
            condition: partition("p"),
            scan_index_forward: false,
        };
        let page = store.page_fetch(&reverse, None).await.unwrap();
        assert_eq!(page.items.first(), Some(&item("p", 9)));

        let foreign = PageRequest::query("t", KeySchema::hash("id"), partition("p"));
        let err = store.page_fetch(&foreign, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_query_resumes_after_deleted_cursor() {
        let store = store().with_page_size(3);
        for i in 0..10 {
            store.insert(item("p", i));
        }
        let request = PageRequest::query("t", schema(), partition("p"));

        let first = store.page_fetch(&request, None).await.unwrap();
        let cursor = first.cursor.unwrap();
        assert_eq!(cursor, key("p", 2));
        let _ = store
            .delete_chunk("t", vec![cursor.clone()], CapacityMode::None)
            .await
            .unwrap();

        let second = store.page_fetch(&request, Some(cursor)).await.unwrap();
        assert_eq!(second.items, vec![item("p", 3), item("p", 4), item("p", 5)]);
        assert_eq!(second.cursor, Some(key("p", 5)));

        let mut reverse = request.clone();
        reverse.kind = PageKind::Query {
            key: schema(),
            condition: partition("p"),
            scan_index_forward: false,
        };
        let page = store
            .page_fetch(&reverse, Some(key("p", 2)))
            .await
            .unwrap();
        assert_eq!(page.items, vec![item("p", 1), item("p", 0)]);
        assert!(page.cursor.is_none());
    }

    #[tokio::test]
    async fn test_parallel_segments_partition_the_table() {
        let store = store();
        for i in 0..50 {
            store.insert(item(&format!("s{i}"), i));
        }
        let mut total = 0;
        for segment in 0..3 {
            let mut request = PageRequest::scan("t");
            request.kind = PageKind::Scan {
                segment: Some((segment, 3)),
            };
            total += store.page_fetch(&request, None).await.unwrap().items.len();
        }
        assert_eq!(total, 50);
    }
}
