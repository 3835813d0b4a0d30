//! # DynamoDB Batching Coordinator
//!
//! Turns arbitrarily large put, delete and get requests into a stream of
//! DynamoDB-legal batch calls and folds the outcome back into one result.
//!
//! - **Chunking**: writes go out in chunks of at most 25, reads of at most 100
//! - **Bounded concurrency**: a FIFO limiter caps in-flight calls per operation
//! - **Retry**: unprocessed items are resubmitted with capped, jittered backoff
//! - **Exact accounting**: on failure the error lists exactly the items that
//!   did not commit, ready to resubmit
//! - **Pagination**: scans and queries run as a cursor state machine with an
//!   optional page budget, parallel segments and a `Stream` adapter
//! - **Typed layer**: `serde` types through [`DynamoTable`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynamo_batch::{BatchOptions, Batcher, DynamoDbStore, Error, KeySchema, TableSchema};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let store = Arc::new(DynamoDbStore::global().await);
//!     let batcher = Batcher::new(store, TableSchema::new("events", KeySchema::hash("id")));
//!
//!     let items = Vec::new();
//!     match batcher.put_items(items, &BatchOptions::default().concurrency(4)).await {
//!         Ok(output) => println!("{} calls", output.call_count()),
//!         Err(err) => println!("{} items left over: {err}", err.unprocessed_count()),
//!     }
//!     Ok(())
//! }
//! ```
#![deny(
    warnings,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    deprecated,
    unknown_lints,
    unreachable_code,
    unused_mut
)]

mod error;
pub use error::{Error, ErrorKind, StoreError, Unprocessed};

pub mod batch;

/// Set helpers over typed items
pub mod methods;

pub mod store;
pub mod table;

// Re-export main types for convenience
pub use batch::{
    Backoff, BatchConfig, BatchOptions, BatchReadOutput, BatchWriteOutput, Batcher, CallMetadata,
    CapacityMode, Operation, PageState, Paginator, QueryOptions, ScanOptions, ScanOutput, ScanPage,
};
pub use methods::DynamoTableMethods;
pub use store::{DynamoDbStore, KeyCondition, MemoryStore, PageRequest, SortCondition, Store};
pub use table::{CompositeKey, DynamoTable, Item, Key, KeySchema, TableSchema};
pub use tokio_util::sync::CancellationToken;

// Re-export aws-config types for configuration
pub use aws_config::{
    BehaviorVersion, Region, SdkConfig, defaults,
    meta::region::{ProvideRegion, RegionProviderChain},
    retry::{RetryConfig, RetryMode},
    timeout::TimeoutConfig,
};

// Re-export aws-types for advanced configuration
pub use aws_types::sdk_config::Builder as SdkConfigBuilder;

use aws_sdk_dynamodb::Client as DynamoDbClient;
use tokio::sync::OnceCell;

/// Global DynamoDB client instance
static GLOBAL_CLIENT: OnceCell<DynamoDbClient> = OnceCell::const_new();

/// Default SDK configuration for the global client
///
/// The SDK retry layer is limited to one attempt; the batch engine owns
/// resubmission.
///
/// - Connect timeout: 3 seconds
/// - Read timeout: 20 seconds
/// - Operation timeout: 60 seconds
/// - LocalStack support via AWS_PROFILE=localstack
async fn aws_config_defaults() -> SdkConfig {
    use aws_types::sdk_config::{RetryConfig, TimeoutConfig};
    use std::time::Duration;

    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(Duration::from_secs(3))
        .read_timeout(Duration::from_secs(20))
        .operation_timeout(Duration::from_secs(60))
        .build();

    let mut loader = defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(1))
        .timeout_config(timeout_config);

    // Support LocalStack via AWS_PROFILE=localstack
    if std::env::var("AWS_PROFILE").unwrap_or_default() == "localstack" {
        loader = loader.endpoint_url("http://127.0.0.1:4566");
    }

    loader.load().await
}

/// Initialize the global DynamoDB client with a custom AWS config
///
/// # Example
///
/// ```rust,no_run
/// #[tokio::main]
/// async fn main() {
///     let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
///         .region(aws_config::Region::new("us-west-2"))
///         .load()
///         .await;
///     dynamo_batch::init(&config).await;
/// }
/// ```
pub async fn init(config: &SdkConfig) {
    let _ = GLOBAL_CLIENT
        .get_or_init(|| async { DynamoDbClient::new(config) })
        .await;
}

/// Initialize the global DynamoDB client with a custom client instance
pub async fn init_with_client(client: DynamoDbClient) {
    let _ = GLOBAL_CLIENT.get_or_init(|| async { client }).await;
}

/// Get a reference to the global DynamoDB client
///
/// Initializes the client with default settings on first use unless
/// [`init`] or [`init_with_client`] ran before.
pub async fn dynamodb_client() -> &'static DynamoDbClient {
    GLOBAL_CLIENT
        .get_or_init(|| async {
            let config = aws_config_defaults().await;
            DynamoDbClient::new(&config)
        })
        .await
}
