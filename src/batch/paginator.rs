use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::batch::aggregate::{self, CallMetadata, ChunkRecord, Operation};
use crate::batch::dispatcher::Batcher;
use crate::batch::limiter::Limiter;
use crate::batch::options::{BatchOptions, QueryOptions, Resolved, ScanOptions};
use crate::batch::retry::{RetryDecision, RetryPolicy};
use crate::error::{Error, ErrorKind};
use crate::store::{KeyCondition, PageKind, PageRequest, Store};
use crate::table::{Item, Key};

/// Traversal state of a [`Paginator`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// A page can be requested
    Ready,
    /// A page request is in progress
    FetchingPage,
    /// No cursor left, or the page budget is spent
    Done,
    /// An unrecoverable error ended the traversal
    Failed,
}

/// One page as seen by the caller
#[derive(Clone, Debug, PartialEq)]
pub struct ScanPage {
    /// Items on the page
    pub items: Vec<Item>,
    /// Calls spent on this page, retries included
    pub metadata: Vec<CallMetadata>,
    /// Cursor to the next page, if any
    pub cursor: Option<Key>,
    /// Items evaluated by the store before filtering
    pub scanned_count: usize,
}

/// Collected result of a scan or query
#[must_use = "scan results contain the fetched items"]
#[derive(Clone, Debug)]
pub struct ScanOutput<T = Item> {
    /// Items from every page
    pub items: Vec<T>,
    /// One entry per physical store call, in issue order
    pub metadata: Vec<CallMetadata>,
    /// Pages fetched
    pub pages: usize,
}

impl<T> ScanOutput<T> {
    /// Convert every item, keeping the call metadata
    pub fn try_map<U, E>(self, convert: impl FnMut(T) -> Result<U, E>) -> Result<ScanOutput<U>, E> {
        Ok(ScanOutput {
            items: self.items.into_iter().map(convert).collect::<Result<_, E>>()?,
            metadata: self.metadata,
            pages: self.pages,
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

/// Drives repeated page fetches through the limiter and retry policy
#[derive(Debug)]
pub struct Paginator<S> {
    store: Arc<S>,
    request: PageRequest,
    cursor: Option<Key>,
    state: PageState,
    budget: usize,
    fetched: usize,
    limiter: Arc<Limiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    issued: Arc<AtomicUsize>,
}

impl<S: Store> Paginator<S> {
    /// Current state
    pub fn state(&self) -> PageState {
        self.state
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.fetched
    }

    /// Cursor the next fetch will start from
    pub fn cursor(&self) -> Option<&Key> {
        self.cursor.as_ref()
    }

    fn operation(&self) -> Operation {
        match self.request.kind {
            PageKind::Scan { .. } => Operation::Scan,
            PageKind::Query { .. } => Operation::Query,
        }
    }

    /// Fetch the next page
    ///
    /// Returns `Ok(None)` once the traversal is done. Throttling and
    /// transport failures are retried on the same cursor; a validation
    /// failure or exhausted attempts move the paginator to
    /// [`PageState::Failed`].
    pub async fn next_page(&mut self) -> Result<Option<ScanPage>, Error> {
        if matches!(self.state, PageState::Done | PageState::Failed) {
            return Ok(None);
        }
        self.state = PageState::FetchingPage;

        let operation = self.operation();
        let mut metadata = Vec::new();
        let mut attempt = 0;

        loop {
            let cursor = self.cursor.clone();
            let store = &self.store;
            let request = &self.request;
            let issued = &self.issued;
            let submitted = self
                .limiter
                .submit(&self.cancel, || {
                    let seq = issued.fetch_add(1, Ordering::AcqRel);
                    async move { (seq, store.page_fetch(request, cursor).await) }
                })
                .await;

            let Ok((seq, result)) = submitted else {
                self.state = PageState::Failed;
                return Err(Error::Cancelled {
                    unprocessed: HashMap::new(),
                });
            };
            attempt += 1;

            let mut call = CallMetadata {
                seq,
                operation,
                attempt,
                requested: 0,
                unprocessed: 0,
                capacity: Vec::new(),
                error: None,
            };

            let err = match result {
                Ok(page) => {
                    call.capacity = page.capacity.into_iter().collect();
                    metadata.push(call);
                    self.fetched += 1;
                    self.cursor = page.cursor.clone();
                    let budget_spent = self.budget != 0 && self.fetched >= self.budget;
                    self.state = if self.cursor.is_none() || budget_spent {
                        PageState::Done
                    } else {
                        PageState::Ready
                    };
                    debug!(
                        %operation,
                        page = self.fetched,
                        items = page.items.len(),
                        done = self.state == PageState::Done,
                        "fetched page"
                    );
                    return Ok(Some(ScanPage {
                        items: page.items,
                        metadata,
                        cursor: page.cursor,
                        scanned_count: page.scanned_count,
                    }));
                }
                Err(err) => err,
            };

            call.error = Some(err.kind);
            metadata.push(call);

            if err.kind == ErrorKind::Validation {
                warn!(%operation, "page request rejected: {}", err.message);
                self.state = PageState::Failed;
                return Err(Error::Validation {
                    message: err.message,
                    unprocessed: HashMap::new(),
                    rejected: Vec::new(),
                });
            }

            match self.policy.decide(attempt, 1) {
                RetryDecision::Retry(delay) => {
                    debug!(%operation, attempt, kind = %err.kind, "retrying page fetch");
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        self.state = PageState::Failed;
                        return Err(Error::Cancelled {
                            unprocessed: HashMap::new(),
                        });
                    }
                }
                RetryDecision::Complete | RetryDecision::Exhausted => {
                    warn!(%operation, attempt, "page fetch exhausted its attempts: {}", err.message);
                    self.state = PageState::Failed;
                    let attempts = self.policy.max_attempts();
                    return Err(match err.kind {
                        ErrorKind::Transport => Error::TransportExhausted {
                            attempts,
                            message: err.message,
                            unprocessed: HashMap::new(),
                        },
                        _ => Error::ExhaustedRetries {
                            attempts,
                            unprocessed: HashMap::new(),
                        },
                    });
                }
            }
        }
    }

    /// Fetch every remaining page
    pub async fn collect_pages(mut self) -> Result<Vec<ScanPage>, Error> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    /// Stream of pages; ends after the last page or the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<ScanPage, Error>> {
        futures_util::stream::try_unfold(self, |mut paginator| async move {
            let page = paginator.next_page().await?;
            Ok(page.map(|page| (page, paginator)))
        })
    }
}

fn collect_output(pages: Vec<ScanPage>) -> ScanOutput {
    let count = pages.len();
    let merged = aggregate::merge(pages.into_iter().map(|page| ChunkRecord {
        succeeded: Vec::new(),
        retrieved: page.items,
        calls: page.metadata,
    }));
    ScanOutput {
        items: merged.retrieved,
        metadata: merged.metadata,
        pages: count,
    }
}

impl<S: Store> Batcher<S> {
    fn page_request(&self, kind: PageKind, resolved: &Resolved) -> PageRequest {
        PageRequest {
            kind,
            consistent_read: resolved.config.consistent_read,
            capacity: resolved.config.capacity,
            ..PageRequest::scan(&self.table.name)
        }
    }

    /// Page request for a query; key names come from the index when one is set
    fn query_request(
        &self,
        condition: KeyCondition,
        options: &QueryOptions,
        resolved: &Resolved,
    ) -> PageRequest {
        let (index_name, key) = match &options.index {
            Some((name, key)) => (Some(name.clone()), key.clone()),
            None => (None, self.table.key.clone()),
        };
        let kind = PageKind::Query {
            key,
            condition,
            scan_index_forward: options.scan_index_forward,
        };
        PageRequest {
            index_name,
            limit: options.limit,
            filter_expression: options.filter_expression.clone(),
            expression_attribute_names: options.expression_attribute_names.clone(),
            expression_attribute_values: options.expression_attribute_values.clone(),
            ..self.page_request(kind, resolved)
        }
    }

    fn paginator(
        &self,
        request: PageRequest,
        pages: usize,
        resolved: &Resolved,
        limiter: Arc<Limiter>,
        issued: Arc<AtomicUsize>,
    ) -> Paginator<S> {
        Paginator {
            store: Arc::clone(&self.store),
            request,
            cursor: None,
            state: PageState::Ready,
            budget: pages,
            fetched: 0,
            limiter,
            policy: RetryPolicy::new(
                resolved.config.batch_attempts,
                resolved.config.backoff.clone(),
            ),
            cancel: resolved.cancel.clone(),
            issued,
        }
    }

    /// Paginator over an arbitrary page request
    ///
    /// `pages` is the fetch ceiling; 0 means unlimited.
    pub fn paginate(
        &self,
        request: PageRequest,
        pages: usize,
        options: &BatchOptions,
    ) -> Result<Paginator<S>, Error> {
        let resolved = options.resolve(&self.config)?;
        let limiter = Arc::new(Limiter::new(resolved.config.concurrency)?);
        Ok(self.paginator(request, pages, &resolved, limiter, Arc::default()))
    }

    /// Scan the table, collecting every page within the page budget
    ///
    /// With `segments > 1` each segment is traversed by its own paginator;
    /// all of them share one limiter.
    #[instrument(skip_all, fields(table = %self.table.name, pages = options.pages, segments = options.segments))]
    pub async fn scan(&self, options: &ScanOptions) -> Result<ScanOutput, Error> {
        let resolved = options.batch.resolve(&self.config)?;
        let limiter = Arc::new(Limiter::new(resolved.config.concurrency)?);
        let issued = Arc::new(AtomicUsize::new(0));
        let segments = i32::try_from(options.segments.max(1))
            .map_err(|_| Error::InvalidConfig("too many scan segments".into()))?;

        let paginators: Vec<Paginator<S>> = (0..segments)
            .map(|segment| {
                let kind = PageKind::Scan {
                    segment: (segments > 1).then_some((segment, segments)),
                };
                let request = PageRequest {
                    index_name: options.index_name.clone(),
                    limit: options.limit,
                    filter_expression: options.filter_expression.clone(),
                    expression_attribute_names: options.expression_attribute_names.clone(),
                    expression_attribute_values: options.expression_attribute_values.clone(),
                    ..self.page_request(kind, &resolved)
                };
                self.paginator(
                    request,
                    options.pages,
                    &resolved,
                    Arc::clone(&limiter),
                    Arc::clone(&issued),
                )
            })
            .collect();

        let mut pages = Vec::new();
        for result in join_all(paginators.into_iter().map(Paginator::collect_pages)).await {
            pages.extend(result?);
        }
        Ok(collect_output(pages))
    }

    /// Query one partition, collecting every page within the page budget
    #[instrument(skip_all, fields(table = %self.table.name, pages = options.pages))]
    pub async fn query(
        &self,
        condition: KeyCondition,
        options: &QueryOptions,
    ) -> Result<ScanOutput, Error> {
        let resolved = options.batch.resolve(&self.config)?;
        let request = self.query_request(condition, options, &resolved);

        let limiter = Arc::new(Limiter::new(resolved.config.concurrency)?);
        let pages = self
            .paginator(request, options.pages, &resolved, limiter, Arc::default())
            .collect_pages()
            .await?;
        Ok(collect_output(pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SortCondition};
    use crate::table::{KeySchema, TableSchema};
    use aws_sdk_dynamodb::types::AttributeValue;

    fn batcher() -> Batcher<MemoryStore> {
        let table = TableSchema::new("orders", KeySchema::composite("customer", "number"));
        Batcher::new(Arc::new(MemoryStore::new(table.clone())), table)
    }

    fn condition() -> KeyCondition {
        KeyCondition {
            partition: AttributeValue::S("shipped".to_string()),
            sort: Some(SortCondition::BeginsWith("2024".to_string())),
        }
    }

    fn query_key(request: &PageRequest) -> Option<&KeySchema> {
        match &request.kind {
            PageKind::Query { key, .. } => Some(key),
            PageKind::Scan { .. } => None,
        }
    }

    #[test]
    fn test_query_request_carries_table_key() {
        let batcher = batcher();
        let options = QueryOptions::default().limit(7);
        let resolved = options.batch.resolve(&batcher.config).unwrap();

        let request = batcher.query_request(condition(), &options, &resolved);

        assert_eq!(request.table, "orders");
        assert_eq!(request.index_name, None);
        assert_eq!(request.limit, Some(7));
        assert_eq!(query_key(&request), Some(&batcher.table.key));
    }

    #[test]
    fn test_query_request_carries_index_key() {
        let batcher = batcher();
        let index_key = KeySchema::composite("status", "placed_at");
        let options = QueryOptions::default().index("by_status", index_key.clone());
        let resolved = options.batch.resolve(&batcher.config).unwrap();

        let request = batcher.query_request(condition(), &options, &resolved);

        assert_eq!(request.index_name.as_deref(), Some("by_status"));
        assert_eq!(query_key(&request), Some(&index_key));
    }
}
