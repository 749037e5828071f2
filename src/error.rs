//! WolfGate Error Types

use thiserror::Error;

/// Result type alias for WolfGate operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGate error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Database / probe errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Probe failed on {address}: {reason}")]
    Probe { address: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Cannot resolve address {0}")]
    AddressResolution(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Backend registry errors
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Backend {0} is already known")]
    DuplicateBackend(String),

    #[error("rw node already exists in group '{0}', only one rw node is allowed")]
    SecondMaster(String),

    #[error("Backend {0} state changed concurrently")]
    StateConflict(String),

    #[error("Parameter error: {0}")]
    InvalidParameter(String),

    // Sharding errors
    #[error("Invalid vdb {id}: {reason}")]
    InvalidVdb { id: i64, reason: String },

    #[error("vdb {0} already exists")]
    DuplicateVdb(i64),

    #[error("vdb {0} not found")]
    UnknownVdb(i64),

    #[error("Table {0} is already registered")]
    DuplicateTable(String),

    #[error("Group '{0}' is not part of the sharding config")]
    UnknownGroup(String),

    #[error("Sharding error: {0}")]
    Sharding(String),

    // Object store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::Store(_)
                | Error::Io(_)
                | Error::Probe { .. }
        )
    }

    /// Check if the error means the backend is currently unreachable
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::AddressResolution(_)
                | Error::Database(_)
                | Error::Probe { .. }
                | Error::Io(_)
        )
    }

    /// Short, stable code used for admin replies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Json(_) => "JSON",
            Error::Database(_) | Error::Probe { .. } => "DATABASE",
            Error::Network(_) | Error::AddressResolution(_) | Error::ConnectionTimeout(_) => "NETWORK",
            Error::BackendNotFound(_) => "NO_SUCH_BACKEND",
            Error::DuplicateBackend(_) => "DUPLICATE",
            Error::SecondMaster(_) => "SECOND_MASTER",
            Error::StateConflict(_) => "CONFLICT",
            Error::InvalidParameter(_) => "PARAMETER",
            Error::InvalidVdb { .. }
            | Error::DuplicateVdb(_)
            | Error::UnknownVdb(_)
            | Error::DuplicateTable(_)
            | Error::UnknownGroup(_)
            | Error::Sharding(_) => "SHARDING",
            Error::Store(_) | Error::Sqlite(_) => "STORE",
            Error::Io(_) => "IO",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL",
            Error::ShuttingDown => "SHUTDOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Store("busy".into()).is_retryable());
        assert!(!Error::DuplicateVdb(1).is_retryable());
        assert!(!Error::SecondMaster("g1".into()).is_retryable());
    }

    #[test]
    fn test_unreachable_covers_dns_and_connect() {
        assert!(Error::AddressResolution("db1:3306".into()).is_unreachable());
        assert!(Error::ConnectionTimeout("db1:3306".into()).is_unreachable());
        assert!(!Error::Config("x".into()).is_unreachable());
    }
}
