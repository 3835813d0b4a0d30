use aws_sdk_dynamodb::error::BuildError;
use serde_dynamo::Error as SerdeDynamoError;
use std::collections::HashMap;
use std::fmt;

use crate::table::Item;

/// Items that never committed, keyed by table name.
///
/// Each list keeps the relative order in which the items were handed to the
/// batch call, so it can be resubmitted as-is.
pub type Unprocessed = HashMap<String, Vec<Item>>;

/// Failure class reported by a single store call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request, or items inside it, were rejected as invalid
    Validation,
    /// Transient capacity or throughput rejection
    Throttling,
    /// Network, timeout or malformed-response failure; outcome unknown
    Transport,
}

impl ErrorKind {
    /// Whether a call failing with this kind may be resubmitted
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "ValidationException",
            ErrorKind::Throttling => "ThrottlingException",
            ErrorKind::Transport => "TransportError",
        };
        f.write_str(name)
    }
}

/// Error returned by one physical store call
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    /// Failure class
    pub kind: ErrorKind,
    /// Store supplied description
    pub message: String,
}

impl StoreError {
    /// Build a validation rejection
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    /// Build a throttling rejection
    pub fn throttling(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Throttling,
            message: message.into(),
        }
    }

    /// Build a transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: message.into(),
        }
    }
}

/// Batch operation error
///
/// Every variant produced by a batch call carries the complete set of items
/// that did not commit, so callers can resubmit exactly that list.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Items were structurally invalid or the store rejected them as invalid
    #[error("ValidationException: {message}")]
    Validation {
        /// Description of the first rejection
        message: String,
        /// Every item that did not commit
        unprocessed: Unprocessed,
        /// Items identified as the cause of the rejection
        rejected: Vec<Item>,
    },
    /// The attempt ceiling was reached while the store kept returning items
    #[error("{} items still unprocessed after {attempts} attempts", count(.unprocessed))]
    ExhaustedRetries {
        /// Attempt ceiling that was reached
        attempts: usize,
        /// Every item that did not commit
        unprocessed: Unprocessed,
    },
    /// The attempt ceiling was reached on transport failures; the listed
    /// items may or may not have been written
    #[error("transport failure persisted after {attempts} attempts: {message}")]
    TransportExhausted {
        /// Attempt ceiling that was reached
        attempts: usize,
        /// Last transport failure seen
        message: String,
        /// Every item whose status could not be confirmed
        unprocessed: Unprocessed,
    },
    /// The batch was cancelled before every chunk was dispatched
    #[error("batch cancelled with {} items unprocessed", count(.unprocessed))]
    Cancelled {
        /// Every item that did not commit, including those never submitted
        unprocessed: Unprocessed,
    },
    /// Configuration or option value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Serde DynamoDB serialization/deserialization error
    #[error("DynamoDB serialization error: {0}")]
    SerdeDynamo(#[from] SerdeDynamoError),
    /// DynamoDB request builder error
    #[error("DynamoDB request builder error: {0}")]
    Build(#[from] BuildError),
}

fn count(unprocessed: &Unprocessed) -> usize {
    unprocessed.values().map(Vec::len).sum()
}

impl Error {
    /// Taxonomy tag of the error
    ///
    /// Validation failures report `ValidationException`, matching the code
    /// DynamoDB itself uses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "ValidationException",
            Error::ExhaustedRetries { .. } => "ExhaustedRetries",
            Error::TransportExhausted { .. } => "TransportExhausted",
            Error::Cancelled { .. } => "Cancelled",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::SerdeDynamo(_) => "SerializationError",
            Error::Build(_) => "BuildError",
        }
    }

    /// Items that did not commit, if this error came from a batch call
    pub fn unprocessed(&self) -> Option<&Unprocessed> {
        match self {
            Error::Validation { unprocessed, .. }
            | Error::ExhaustedRetries { unprocessed, .. }
            | Error::TransportExhausted { unprocessed, .. }
            | Error::Cancelled { unprocessed } => Some(unprocessed),
            _ => None,
        }
    }

    /// Unprocessed items for one table, or an empty slice
    pub fn unprocessed_for(&self, table: &str) -> &[Item] {
        self.unprocessed()
            .and_then(|map| map.get(table))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of unprocessed items across tables
    pub fn unprocessed_count(&self) -> usize {
        self.unprocessed().map(count).unwrap_or(0)
    }

    /// Check if the error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if the error is a serialization/deserialization error
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Error::SerdeDynamo(_))
    }
}
