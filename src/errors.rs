//! Centralised error types for the store, cache and ingestion layers.
//!
//! Every failure surfaced by this crate maps onto exactly one [`ErrorKind`],
//! so the upstream consumer can turn it into a response without inspecting
//! driver-specific details.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::connection::Domain;

/// Classification shared by every error type in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OpenFailure,
    TuningFailure,
    QueryFailure,
    StoreUnavailable,
    FetchFailure,
    StoreFailure,
}

/// A store could not be opened at startup.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("store `{name}` not found at {path:?}")]
    NotFound { name: String, path: PathBuf },

    #[error("engine rejected store `{name}`: {source}")]
    Engine {
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

impl OpenError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::OpenFailure
    }

    /// True when the target simply does not exist, which is recoverable for
    /// optional stores.
    pub fn is_absent(&self) -> bool {
        matches!(self, OpenError::NotFound { .. })
    }
}

/// A tuning directive was not applied. Always logged, never propagated.
#[derive(Error, Debug)]
pub enum TuningError {
    #[error("invalid tuning directive {key} = {value}")]
    InvalidDirective { key: String, value: String },

    #[error("store rejected tuning directive {key} = {value}: {source}")]
    Rejected {
        key: String,
        value: String,
        #[source]
        source: sqlx::Error,
    },
}

impl TuningError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TuningFailure
    }
}

/// A statement failed, timed out, or could not be issued at all.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("store for domain {0} is unavailable")]
    StoreUnavailable(Domain),

    #[error("statement failed on store `{store}`: {source}")]
    Statement {
        store: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("statement on store `{store}` timed out after {after:?}")]
    Timeout { store: String, after: Duration },

    #[error("store `{store}` is closed")]
    Closed { store: String },
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            _ => ErrorKind::QueryFailure,
        }
    }
}

/// Failures raised while pulling records from an external source.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unknown ingestion source `{0}`")]
    UnknownSource(String),

    #[error("invalid request for {source_id}: {reason}")]
    Request { source_id: String, reason: String },

    #[error("HTTP error fetching from {source_id}: {error}")]
    Fetch {
        source_id: String,
        #[source]
        error: reqwest::Error,
    },

    #[error("{source_id} responded with status {status}")]
    Status {
        source_id: String,
        status: reqwest::StatusCode,
    },

    #[error("could not decode response from {source_id}: {error}")]
    Decode {
        source_id: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("failed to persist records from {source_id}: {error}")]
    Store {
        source_id: String,
        #[source]
        error: QueryError,
    },
}

impl IngestError {
    /// Transport, status and decoding problems are all fetch-side; only a
    /// persistence failure is a store failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Store { .. } => ErrorKind::StoreFailure,
            _ => ErrorKind::FetchFailure,
        }
    }

    /// Whether the caller may retry with backoff. Store failures are never
    /// retried because a write reported as failed may still have landed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Fetch { .. } | IngestError::Status { .. } | IngestError::Decode { .. }
        )
    }
}

/// Startup failures for the composition root.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Mandatory store failed to open: {0}")]
    Open(#[from] OpenError),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
