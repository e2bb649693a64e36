//! Centralized error types for Snowwatch.
//!
//! The taxonomy mirrors how a fetch pass can go wrong:
//! - `FetchError`: transient upstream or network trouble
//! - `StorageError`: ordering or constraint violations in the local store
//! - `DuplicateAlertError`: a benign race on the alert ledger
//! - `NotifyError`: delivery failure, retried once per pass
//! - `DegenerateComparisonWarning`: non-fatal, logged and skipped
//!
//! Every error carries a `user_message()` suitable for a one-line summary.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Top-level application error type.
///
/// Use `user_message()` to get an operator-facing message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Alert ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Fetch(e) => e.user_message(),
            AppError::Storage(e) => e.user_message(),
            AppError::Ledger(e) => e.user_message(),
            AppError::Notify(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Io(_) => "A file operation failed.",
            AppError::Other(e) => match e.downcast_ref::<ConfigError>() {
                Some(config) => config.user_message(),
                None => "An unexpected error occurred.",
            },
        }
    }
}

/// Upstream/network errors raised at the fetcher boundary.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl FetchError {
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FetchError::ConnectionFailed(_) => "Unable to reach the forecast service.",
            FetchError::Timeout => "The forecast service timed out.",
            FetchError::Upstream { status, .. } if *status >= 500 => {
                "The forecast service is having trouble. Will retry next run."
            }
            FetchError::Upstream { .. } => "The forecast service rejected the request.",
            FetchError::InvalidPayload(_) => "The forecast service returned unexpected data.",
            FetchError::NotFound(_) => "The requested forecast data does not exist.",
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::ConnectionFailed(_) | FetchError::Timeout => true,
            FetchError::Upstream { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            FetchError::InvalidPayload(_) | FetchError::NotFound(_) => false,
        }
    }
}

/// Persistence errors (SQLite, ordering guarantees).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(
        "Out-of-order snapshot for location {location_id}: {captured_at} is not after {latest}"
    )]
    OutOfOrder {
        location_id: i64,
        captured_at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Data corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            StorageError::OutOfOrder { .. } => "A duplicate or out-of-order fetch was skipped.",
            StorageError::ConstraintViolation(_) => "A record conflicted with existing data.",
            StorageError::ConnectionFailed(_) => "Unable to open the local database.",
            StorageError::QueryFailed(_) => "A database operation failed.",
            StorageError::Corruption(_) => "The local database may be corrupted.",
            StorageError::Serialization(_) => "Stored forecast data could not be read.",
            StorageError::NotFound(_) => "The requested record does not exist.",
        }
    }

    /// Out-of-order writes mean a duplicate fetch, not data loss.
    pub fn is_out_of_order(&self) -> bool {
        matches!(self, StorageError::OutOfOrder { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        e.into_storage_error()
    }
}

/// Another writer already recorded these fingerprints.
#[derive(Debug, Error)]
#[error("{} alert(s) already recorded for location {location_id}", .fingerprints.len())]
pub struct DuplicateAlertError {
    pub location_id: i64,
    pub fingerprints: Vec<String>,
}

/// Alert ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateAlertError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LedgerError::Duplicate(_) => "Alert was already handled.",
            LedgerError::Storage(e) => e.user_message(),
        }
    }
}

/// Notification delivery failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Notifier command exited with {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NotifyError {
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            NotifyError::Delivery(_) => "Notification could not be delivered.",
            NotifyError::CommandFailed(_) => "The notification command failed.",
            NotifyError::Io(_) => "The notification command could not be started.",
        }
    }
}

/// Two snapshots with the same capture time were compared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Degenerate comparison: both snapshots captured at {captured_at}")]
pub struct DegenerateComparisonWarning {
    pub captured_at: DateTime<Utc>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
        }
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_fetch_error(self) -> FetchError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_fetch_error(self) -> FetchError {
        if self.is_timeout() {
            FetchError::Timeout
        } else if self.is_connect() {
            FetchError::ConnectionFailed(self.to_string())
        } else if let Some(status) = self.status() {
            FetchError::Upstream {
                status: status.as_u16(),
                message: self.to_string(),
            }
        } else if self.is_decode() {
            FetchError::InvalidPayload(self.to_string())
        } else {
            FetchError::ConnectionFailed(self.to_string())
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        e.into_fetch_error()
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_storage_error(self) -> StorageError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_storage_error(self) -> StorageError {
        match &self {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::ConstraintViolation(self.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StorageError::ConnectionFailed(self.to_string())
            }
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("corrupt") => {
                StorageError::Corruption(self.to_string())
            }
            _ => StorageError::QueryFailed(self.to_string()),
        }
    }
}
