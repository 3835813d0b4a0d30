use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::batch::aggregate::{self, Aggregated, CallMetadata, ChunkRecord, Operation};
use crate::batch::chunker::chunk;
use crate::batch::limiter::Limiter;
use crate::batch::options::{BatchConfig, BatchOptions, Resolved};
use crate::batch::retry::{RetryDecision, RetryPolicy};
use crate::error::{Error, ErrorKind, StoreError, Unprocessed};
use crate::store::{ChunkOutcome, Store};
use crate::table::{Item, Key, KeySchema, TableSchema};

/// Batch write output
///
/// Returned only when every item committed.
#[must_use = "batch write results carry per-call metadata"]
#[derive(Clone, Debug)]
pub struct BatchWriteOutput {
    /// Items (or keys) written, in input order
    pub processed: Vec<Item>,
    /// One entry per physical store call, in issue order
    pub metadata: Vec<CallMetadata>,
    /// Highest attempt number any chunk needed
    pub attempts: usize,
    /// Total execution time including all retries
    pub total_duration: Duration,
}

impl BatchWriteOutput {
    /// Number of physical store calls made
    pub fn call_count(&self) -> usize {
        self.metadata.len()
    }

    /// Capacity units reported across all calls
    pub fn consumed_capacity_units(&self) -> f64 {
        aggregate::total_capacity_units(&self.metadata)
    }
}

/// Batch read output
#[must_use = "batch read results contain the retrieved items"]
#[derive(Clone, Debug)]
pub struct BatchReadOutput<T = Item> {
    /// Items found; order bears no relation to the requested keys
    pub items: Vec<T>,
    /// One entry per physical store call, in issue order
    pub metadata: Vec<CallMetadata>,
    /// Highest attempt number any chunk needed
    pub attempts: usize,
    /// Total execution time including all retries
    pub total_duration: Duration,
}

impl<T> BatchReadOutput<T> {
    /// Convert every item, keeping the call metadata
    pub fn try_map<U, E>(self, convert: impl FnMut(T) -> Result<U, E>) -> Result<BatchReadOutput<U>, E> {
        Ok(BatchReadOutput {
            items: self.items.into_iter().map(convert).collect::<Result<_, E>>()?,
            metadata: self.metadata,
            attempts: self.attempts,
            total_duration: self.total_duration,
        })
    }

    /// Number of physical store calls made
    pub fn call_count(&self) -> usize {
        self.metadata.len()
    }

    /// Capacity units reported across all calls
    pub fn consumed_capacity_units(&self) -> f64 {
        aggregate::total_capacity_units(&self.metadata)
    }
}

/// Batch verb strategy: ceiling, store call and result shape
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verb {
    Put,
    Delete,
    Get,
}

impl Verb {
    fn ceiling(self, config: &BatchConfig) -> usize {
        match self {
            Verb::Put | Verb::Delete => config.write_chunk_size,
            Verb::Get => config.read_chunk_size,
        }
    }

    fn operation(self) -> Operation {
        match self {
            Verb::Put => Operation::Put,
            Verb::Delete => Operation::Delete,
            Verb::Get => Operation::Get,
        }
    }

    fn check(self, schema: &KeySchema, item: &Item) -> Result<(), String> {
        match self {
            Verb::Put => schema.check(item),
            Verb::Delete | Verb::Get => schema.check_key(item),
        }
    }

    async fn call<S: Store>(
        self,
        store: &S,
        table: &str,
        requests: Vec<Item>,
        config: &BatchConfig,
    ) -> Result<ChunkOutcome, StoreError> {
        match self {
            Verb::Put => store.write_chunk(table, requests, config.capacity).await,
            Verb::Delete => store.delete_chunk(table, requests, config.capacity).await,
            Verb::Get => {
                store
                    .read_chunk(table, requests, config.consistent_read, config.capacity)
                    .await
            }
        }
    }
}

/// Why items of a chunk were left uncommitted
#[derive(Clone, Debug)]
enum Failure {
    Throttled,
    Transport(String),
    Cancelled,
    Validation { message: String, rejected: Vec<Item> },
}

impl Failure {
    fn rank(&self) -> u8 {
        match self {
            Failure::Throttled => 0,
            Failure::Transport(_) => 1,
            Failure::Cancelled => 2,
            Failure::Validation { .. } => 3,
        }
    }
}

/// Everything one chunk lifecycle reports back to the dispatcher
#[derive(Debug)]
struct ChunkReport {
    record: ChunkRecord,
    leftover: Vec<(usize, Item)>,
    failure: Option<Failure>,
    attempts: usize,
}

/// Per-operation state shared by every chunk lifecycle
struct Dispatch<'a> {
    verb: Verb,
    config: &'a BatchConfig,
    cancel: &'a CancellationToken,
    limiter: &'a Limiter,
    policy: &'a RetryPolicy,
    issued: &'a AtomicUsize,
}

/// Final per-operation accumulator, folded from chunk reports
#[derive(Debug, Default)]
struct BatchState {
    records: Vec<ChunkRecord>,
    leftover: Vec<(usize, Item)>,
    failure: Option<Failure>,
    attempts: usize,
}

impl BatchState {
    fn fold(&mut self, report: ChunkReport) {
        self.records.push(report.record);
        self.leftover.extend(report.leftover);
        self.attempts = self.attempts.max(report.attempts);

        if let Some(failure) = report.failure {
            match &mut self.failure {
                Some(Failure::Validation { rejected, .. }) => {
                    if let Failure::Validation { rejected: more, .. } = failure {
                        rejected.extend(more);
                    }
                }
                Some(current) if current.rank() >= failure.rank() => {}
                slot => *slot = Some(failure),
            }
        }
    }

    fn finish(mut self, table: &str, max_attempts: usize) -> Result<(Aggregated, usize), Error> {
        let merged = aggregate::merge(self.records);
        if self.leftover.is_empty() {
            return Ok((merged, self.attempts));
        }

        self.leftover.sort_by_key(|(index, _)| *index);
        let items = self.leftover.into_iter().map(|(_, item)| item).collect();
        let unprocessed: Unprocessed = HashMap::from([(table.to_string(), items)]);

        Err(match self.failure {
            Some(Failure::Validation { message, rejected }) => Error::Validation {
                message,
                unprocessed,
                rejected,
            },
            Some(Failure::Cancelled) => Error::Cancelled { unprocessed },
            Some(Failure::Transport(message)) => Error::TransportExhausted {
                attempts: max_attempts,
                message,
                unprocessed,
            },
            Some(Failure::Throttled) | None => Error::ExhaustedRetries {
                attempts: max_attempts,
                unprocessed,
            },
        })
    }
}

/// Splits pending entries into (committed, still unprocessed)
fn split_processed(
    schema: &KeySchema,
    pending: Vec<(usize, Item)>,
    unprocessed: &[Item],
) -> (Vec<(usize, Item)>, Vec<(usize, Item)>) {
    if unprocessed.is_empty() {
        return (pending, Vec::new());
    }
    pending
        .into_iter()
        .partition(|(_, item)| !unprocessed.iter().any(|u| schema.same_key(item, u)))
}

/// Batching coordinator for one table
///
/// Splits put, delete and get requests into store-legal chunks, runs them
/// under a concurrency cap, resubmits unprocessed items with backoff and
/// folds everything into one result.
#[derive(Debug)]
pub struct Batcher<S> {
    pub(crate) store: Arc<S>,
    pub(crate) table: TableSchema,
    pub(crate) config: BatchConfig,
}

impl<S> Clone for Batcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> Batcher<S> {
    /// Coordinator over `store` for `table` with default configuration
    pub fn new(store: Arc<S>, table: TableSchema) -> Self {
        Self {
            store,
            table,
            config: BatchConfig::default(),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Table this coordinator writes to
    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    /// Configuration in effect when no per-call override is given
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Put every item, resubmitting unprocessed ones
    ///
    /// Succeeds only when all items committed. Otherwise the error lists
    /// exactly the items that did not commit, in input order.
    #[instrument(skip_all, fields(table = %self.table.name, count = items.len()))]
    pub async fn put_items(
        &self,
        items: Vec<Item>,
        options: &BatchOptions,
    ) -> Result<BatchWriteOutput, Error> {
        let started = Instant::now();
        let (merged, attempts) = self.dispatch(Verb::Put, items, options).await?;
        Ok(BatchWriteOutput {
            processed: merged.succeeded,
            metadata: merged.metadata,
            attempts,
            total_duration: started.elapsed(),
        })
    }

    /// Delete every key, resubmitting unprocessed ones
    #[instrument(skip_all, fields(table = %self.table.name, count = keys.len()))]
    pub async fn delete_items(
        &self,
        keys: Vec<Key>,
        options: &BatchOptions,
    ) -> Result<BatchWriteOutput, Error> {
        let started = Instant::now();
        let (merged, attempts) = self.dispatch(Verb::Delete, keys, options).await?;
        Ok(BatchWriteOutput {
            processed: merged.succeeded,
            metadata: merged.metadata,
            attempts,
            total_duration: started.elapsed(),
        })
    }

    /// Read every key, resubmitting unprocessed ones
    ///
    /// Keys with no stored item are simply absent from the result.
    #[instrument(skip_all, fields(table = %self.table.name, count = keys.len()))]
    pub async fn get_items(
        &self,
        keys: Vec<Key>,
        options: &BatchOptions,
    ) -> Result<BatchReadOutput, Error> {
        let started = Instant::now();
        let (merged, attempts) = self.dispatch(Verb::Get, keys, options).await?;
        Ok(BatchReadOutput {
            items: merged.retrieved,
            metadata: merged.metadata,
            attempts,
            total_duration: started.elapsed(),
        })
    }

    async fn dispatch(
        &self,
        verb: Verb,
        items: Vec<Item>,
        options: &BatchOptions,
    ) -> Result<(Aggregated, usize), Error> {
        let Resolved { config, cancel } = options.resolve(&self.config)?;
        if items.is_empty() {
            return Ok((Aggregated::default(), 0));
        }
        if config.prevalidate {
            self.prevalidate(verb, &items)?;
        }

        let entries: Vec<(usize, Item)> = items.into_iter().enumerate().collect();
        let chunks = chunk(entries, verb.ceiling(&config))?;
        let limiter = Limiter::new(config.concurrency)?;
        let policy = RetryPolicy::new(config.batch_attempts, config.backoff.clone());
        let issued = AtomicUsize::new(0);

        debug!(
            operation = %verb.operation(),
            chunks = chunks.len(),
            concurrency = config.concurrency,
            "dispatching batch"
        );

        let ctx = Dispatch {
            verb,
            config: &config,
            cancel: &cancel,
            limiter: &limiter,
            policy: &policy,
            issued: &issued,
        };

        let reports = join_all(chunks.into_iter().map(|c| self.run_chunk(&ctx, c))).await;

        let mut state = BatchState::default();
        for report in reports {
            state.fold(report);
        }
        state.finish(&self.table.name, policy.max_attempts())
    }

    fn prevalidate(&self, verb: Verb, items: &[Item]) -> Result<(), Error> {
        let mut message = None;
        let mut rejected = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if let Err(reason) = verb.check(&self.table.key, item) {
                if message.is_none() {
                    message = Some(format!("item {index}: {reason}"));
                }
                rejected.push(item.clone());
            }
        }

        match message {
            None => Ok(()),
            Some(message) => {
                warn!(
                    table = %self.table.name,
                    rejected = rejected.len(),
                    "batch rejected before dispatch: {message}"
                );
                Err(Error::Validation {
                    message,
                    unprocessed: HashMap::from([(self.table.name.clone(), items.to_vec())]),
                    rejected,
                })
            }
        }
    }

    /// Drive one chunk through the limiter until it commits, exhausts its
    /// attempts, is rejected as invalid, or is cancelled
    async fn run_chunk(&self, ctx: &Dispatch<'_>, chunk: Vec<(usize, Item)>) -> ChunkReport {
        let mut pending = chunk;
        let mut record = ChunkRecord::default();
        let mut last_failure = None;
        let mut attempt = 0;

        loop {
            let requests: Vec<Item> = pending.iter().map(|(_, item)| item.clone()).collect();
            let requested = requests.len();

            let submitted = ctx
                .limiter
                .submit(ctx.cancel, || {
                    let seq = ctx.issued.fetch_add(1, Ordering::AcqRel);
                    async move {
                        let result = ctx
                            .verb
                            .call(self.store.as_ref(), &self.table.name, requests, ctx.config)
                            .await;
                        (seq, result)
                    }
                })
                .await;

            let Ok((seq, result)) = submitted else {
                debug!(pending = pending.len(), "chunk dropped before dispatch");
                return ChunkReport {
                    record,
                    leftover: pending,
                    failure: Some(Failure::Cancelled),
                    attempts: attempt,
                };
            };
            attempt += 1;

            let mut call = CallMetadata {
                seq,
                operation: ctx.verb.operation(),
                attempt,
                requested,
                unprocessed: requested,
                capacity: Vec::new(),
                error: None,
            };

            match result {
                Ok(outcome) => {
                    let (done, rest) =
                        split_processed(&self.table.key, pending, &outcome.unprocessed);
                    call.unprocessed = rest.len();
                    call.capacity = outcome.capacity;
                    record.succeeded.extend(done);
                    record.retrieved.extend(outcome.items);
                    pending = rest;
                    if !pending.is_empty() {
                        last_failure = Some(Failure::Throttled);
                    }
                }
                Err(err) if err.kind == ErrorKind::Validation => {
                    warn!(
                        seq,
                        attempt,
                        rejected = pending.len(),
                        "store rejected chunk: {}",
                        err.message
                    );
                    call.error = Some(err.kind);
                    record.calls.push(call);
                    let rejected = pending.iter().map(|(_, item)| item.clone()).collect();
                    return ChunkReport {
                        record,
                        leftover: pending,
                        failure: Some(Failure::Validation {
                            message: err.message,
                            rejected,
                        }),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    debug!(seq, attempt, kind = %err.kind, "chunk call failed: {}", err.message);
                    call.error = Some(err.kind);
                    last_failure = Some(match err.kind {
                        ErrorKind::Transport => Failure::Transport(err.message),
                        _ => Failure::Throttled,
                    });
                }
            }
            record.calls.push(call);

            match ctx.policy.decide(attempt, pending.len()) {
                RetryDecision::Complete => {
                    return ChunkReport {
                        record,
                        leftover: Vec::new(),
                        failure: None,
                        attempts: attempt,
                    };
                }
                RetryDecision::Exhausted => {
                    warn!(
                        attempt,
                        unprocessed = pending.len(),
                        "chunk exhausted its attempts"
                    );
                    return ChunkReport {
                        record,
                        leftover: pending,
                        failure: last_failure,
                        attempts: attempt,
                    };
                }
                RetryDecision::Retry(delay) => {
                    debug!(
                        attempt,
                        unprocessed = pending.len(),
                        ?delay,
                        "resubmitting unprocessed items"
                    );
                    let cancelled = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return ChunkReport {
                            record,
                            leftover: pending,
                            failure: Some(Failure::Cancelled),
                            attempts: attempt,
                        };
                    }
                }
            }
        }
    }
}
