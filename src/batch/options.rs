use aws_sdk_dynamodb::types::ReturnConsumedCapacity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::store::{MAX_READ_CHUNK, MAX_WRITE_CHUNK};
use crate::table::{Item, KeySchema};

/// Capacity reporting requested from the store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapacityMode {
    /// Do not report consumed capacity
    #[default]
    None,
    /// Report the total per table
    Total,
    /// Report per table and per index
    Indexes,
}

impl CapacityMode {
    /// Whether any capacity should be reported
    pub fn is_enabled(self) -> bool {
        !matches!(self, CapacityMode::None)
    }
}

impl From<CapacityMode> for ReturnConsumedCapacity {
    fn from(mode: CapacityMode) -> Self {
        match mode {
            CapacityMode::None => ReturnConsumedCapacity::None,
            CapacityMode::Total => ReturnConsumedCapacity::Total,
            CapacityMode::Indexes => ReturnConsumedCapacity::Indexes,
        }
    }
}

/// Exponential backoff between resubmissions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first resubmission
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomise each delay within the upper half of its range
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

/// Batch engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum simultaneous store calls per operation
    pub concurrency: usize,
    /// Maximum store calls made for any one chunk (first try included)
    pub batch_attempts: usize,
    /// Items per put/delete call
    pub write_chunk_size: usize,
    /// Keys per get call
    pub read_chunk_size: usize,
    /// Capacity reporting
    pub capacity: CapacityMode,
    /// Check key attributes locally before any store call
    pub prevalidate: bool,
    /// Strongly consistent reads for get, scan and query
    pub consistent_read: bool,
    /// Delay curve between attempts
    pub backoff: Backoff,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_attempts: 10,
            write_chunk_size: MAX_WRITE_CHUNK,
            read_chunk_size: MAX_READ_CHUNK,
            capacity: CapacityMode::None,
            prevalidate: false,
            consistent_read: false,
            backoff: Backoff::default(),
        }
    }
}

impl BatchConfig {
    /// Reject values the engine cannot honour
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.batch_attempts == 0 {
            return Err(Error::InvalidConfig("batch_attempts must be at least 1".into()));
        }
        if !(1..=MAX_WRITE_CHUNK).contains(&self.write_chunk_size) {
            return Err(Error::InvalidConfig(format!(
                "write_chunk_size must be between 1 and {MAX_WRITE_CHUNK}"
            )));
        }
        if !(1..=MAX_READ_CHUNK).contains(&self.read_chunk_size) {
            return Err(Error::InvalidConfig(format!(
                "read_chunk_size must be between 1 and {MAX_READ_CHUNK}"
            )));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(Error::InvalidConfig(
                "backoff base_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Per-call overrides for a batch operation
#[derive(Clone, Debug, Default)]
pub struct BatchOptions {
    /// Capacity reporting override
    pub capacity: Option<CapacityMode>,
    /// Concurrency override
    pub concurrency: Option<usize>,
    /// Attempt ceiling override
    pub batch_attempts: Option<usize>,
    /// Local key validation override
    pub prevalidate: Option<bool>,
    /// Consistent read override
    pub consistent_read: Option<bool>,
    /// Token that stops queued chunks from being dispatched
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    /// Request capacity reporting
    pub fn capacity(mut self, mode: CapacityMode) -> Self {
        self.capacity = Some(mode);
        self
    }

    /// Cap simultaneous store calls
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Cap store calls per chunk
    pub fn batch_attempts(mut self, attempts: usize) -> Self {
        self.batch_attempts = Some(attempts);
        self
    }

    /// Check key attributes before calling the store
    pub fn prevalidate(mut self, enabled: bool) -> Self {
        self.prevalidate = Some(enabled);
        self
    }

    /// Use strongly consistent reads
    pub fn consistent_read(mut self, enabled: bool) -> Self {
        self.consistent_read = Some(enabled);
        self
    }

    /// Attach a cancellation token
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Merge these overrides over `config`
    pub(crate) fn resolve(&self, config: &BatchConfig) -> Result<Resolved, Error> {
        let merged = BatchConfig {
            concurrency: self.concurrency.unwrap_or(config.concurrency),
            batch_attempts: self.batch_attempts.unwrap_or(config.batch_attempts),
            capacity: self.capacity.unwrap_or(config.capacity),
            prevalidate: self.prevalidate.unwrap_or(config.prevalidate),
            consistent_read: self.consistent_read.unwrap_or(config.consistent_read),
            ..config.clone()
        };
        merged.validate()?;
        Ok(Resolved {
            config: merged,
            cancel: self.cancel.clone().unwrap_or_default(),
        })
    }
}

/// Configuration in effect for one call
#[derive(Clone, Debug)]
pub(crate) struct Resolved {
    pub(crate) config: BatchConfig,
    pub(crate) cancel: CancellationToken,
}

/// Options for scan traversals
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Page fetch ceiling per segment; 0 means unlimited
    pub pages: usize,
    /// Maximum items evaluated per page
    pub limit: Option<i32>,
    /// Secondary index to scan
    pub index_name: Option<String>,
    /// Filter expression applied by the store
    pub filter_expression: Option<String>,
    /// Placeholder names for the filter expression
    pub expression_attribute_names: HashMap<String, String>,
    /// Placeholder values for the filter expression
    pub expression_attribute_values: Item,
    /// Number of parallel scan segments; 0 and 1 both mean a serial scan
    pub segments: u32,
    /// Capacity, concurrency, attempts and cancellation
    pub batch: BatchOptions,
}

impl ScanOptions {
    /// Stop after `pages` page fetches (0 = unlimited)
    pub fn pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    /// Items evaluated per page
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Scan an index instead of the base table
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    /// Filter expression evaluated by the store
    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filter_expression = Some(expression.into());
        self
    }

    /// Split the scan into parallel segments
    pub fn segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    /// Shared batch options
    pub fn batch(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }
}

/// Options for query traversals
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Page fetch ceiling; 0 means unlimited
    pub pages: usize,
    /// Maximum items evaluated per page
    pub limit: Option<i32>,
    /// Secondary index to query, with its key attributes
    pub index: Option<(String, KeySchema)>,
    /// Ascending sort key order when true
    pub scan_index_forward: bool,
    /// Filter expression applied by the store
    pub filter_expression: Option<String>,
    /// Placeholder names for the filter expression
    pub expression_attribute_names: HashMap<String, String>,
    /// Placeholder values for the filter expression
    pub expression_attribute_values: Item,
    /// Capacity, concurrency, attempts and cancellation
    pub batch: BatchOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            pages: 0,
            limit: None,
            index: None,
            scan_index_forward: true,
            filter_expression: None,
            expression_attribute_names: HashMap::new(),
            expression_attribute_values: HashMap::new(),
            batch: BatchOptions::default(),
        }
    }
}

impl QueryOptions {
    /// Stop after `pages` page fetches (0 = unlimited)
    pub fn pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    /// Items evaluated per page
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Descending sort key order
    pub fn reverse(mut self) -> Self {
        self.scan_index_forward = false;
        self
    }

    /// Query an index instead of the base table
    ///
    /// `key` names the index's partition and sort key attributes.
    pub fn index(mut self, name: impl Into<String>, key: KeySchema) -> Self {
        self.index = Some((name.into(), key));
        self
    }

    /// Shared batch options
    pub fn batch(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.batch_attempts, 10);
        assert_eq!(config.write_chunk_size, 25);
        assert_eq!(config.read_chunk_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_are_validated() {
        let config = BatchConfig::default();
        let err = BatchOptions::default()
            .concurrency(0)
            .resolve(&config)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let resolved = BatchOptions::default()
            .concurrency(1)
            .batch_attempts(1)
            .capacity(CapacityMode::Total)
            .resolve(&config)
            .unwrap();
        assert_eq!(resolved.config.concurrency, 1);
        assert_eq!(resolved.config.batch_attempts, 1);
        assert_eq!(resolved.config.capacity, CapacityMode::Total);
        assert!(!resolved.cancel.is_cancelled());
    }

    #[test]
    fn test_chunk_size_above_store_ceiling() {
        let config = BatchConfig {
            write_chunk_size: 26,
            ..BatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capacity_mode_conversion() {
        assert_eq!(
            ReturnConsumedCapacity::from(CapacityMode::Total),
            ReturnConsumedCapacity::Total
        );
        assert!(!CapacityMode::None.is_enabled());
    }
}
