use core::result::Result as CoreResult;
use std::io::Error as IoError;
use std::path::PathBuf;

use regex::Error as RegexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::ids::{AgentId, TransactionId};
use crate::types::TransactionStatus;

/// Result type for orchestration operations.
pub type Result<T> = CoreResult<T, OrchestrationError>;

/// Errors that can occur in the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// A subscription pattern was not a valid regular expression.
    #[error("Invalid subscription pattern: {0}")]
    Pattern(#[from] RegexError),

    /// An optimistic write carried a stale version. The store was not modified.
    #[error("Version conflict on '{key}': expected {expected}, found {actual:?}")]
    Concurrency {
        /// Key the write targeted
        key: String,
        /// Version the writer expected
        expected: u64,
        /// Version actually stored (`None` if the key does not exist)
        actual: Option<u64>,
    },

    /// Checkpoint I/O or structural validation failed.
    #[error("State error: {0}")]
    State(String),

    /// The workspace file system collaborator failed.
    #[error("File system error at {}: {message}", path.display())]
    FileSystem {
        /// Path the operation targeted
        path: PathBuf,
        /// Description of the failure
        message: String,
    },

    /// A file is write-locked by another agent.
    #[error("File locked by agent {holder}: {}", path.display())]
    FileLocked {
        /// Locked path
        path: PathBuf,
        /// Agent holding the lock
        holder: AgentId,
    },

    /// No pooled agent became available before the deadline.
    #[error("Timed out after {waited_ms}ms waiting for a '{agent_type}' agent")]
    PoolTimeout {
        /// Agent type that was requested
        agent_type: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// A transaction with this id already exists.
    #[error("Transaction {0} already exists")]
    TransactionConflict(TransactionId),

    /// No transaction with this id is known.
    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    /// The transaction is not in a state that permits the operation.
    #[error("Cannot {operation} transaction {id}: status is {status:?}")]
    InvalidTransactionState {
        /// Transaction the operation targeted
        id: TransactionId,
        /// Current status
        status: TransactionStatus,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// An agent factory failed to construct an instance.
    #[error("Agent factory failed: {0}")]
    Factory(String),

    /// The state store actor is no longer running.
    #[error("State store is closed")]
    StoreClosed,

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl OrchestrationError {
    /// Determines whether the caller should retry at a higher level.
    ///
    /// Write conflicts mean "re-read and retry", pool timeouts mean backpressure.
    /// The engine itself never retries either.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. } | Self::PoolTimeout { .. })
    }

    /// Builds a [`OrchestrationError::FileSystem`] from a path and any displayable error.
    pub fn file_system(path: impl Into<PathBuf>, error: impl ToString) -> Self {
        Self::FileSystem {
            path: path.into(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, from_str};
    use std::io;

    #[test]
    fn test_error_display() {
        let conflict = OrchestrationError::Concurrency {
            key: "budget".to_owned(),
            expected: 1,
            actual: Some(2),
        };
        assert_eq!(
            conflict.to_string(),
            "Version conflict on 'budget': expected 1, found Some(2)"
        );

        let timeout = OrchestrationError::PoolTimeout {
            agent_type: "worker".to_owned(),
            waited_ms: 30_000,
        };
        assert_eq!(
            timeout.to_string(),
            "Timed out after 30000ms waiting for a 'worker' agent"
        );

        let invalid = OrchestrationError::InvalidTransactionState {
            id: TransactionId::from("tx-1"),
            status: TransactionStatus::Committed,
            operation: "record",
        };
        assert_eq!(
            invalid.to_string(),
            "Cannot record transaction tx-1: status is Committed"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        let conflict = OrchestrationError::Concurrency {
            key: "k".to_owned(),
            expected: 3,
            actual: None,
        };
        assert!(conflict.is_retryable());

        let timeout = OrchestrationError::PoolTimeout {
            agent_type: "worker".to_owned(),
            waited_ms: 10,
        };
        assert!(timeout.is_retryable());

        assert!(!OrchestrationError::State("bad".to_owned()).is_retryable());
        assert!(!OrchestrationError::StoreClosed.is_retryable());
        assert!(!OrchestrationError::TransactionConflict(TransactionId::from("t")).is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: OrchestrationError = io_error.into();
        assert!(matches!(error, OrchestrationError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_error = match from_str::<JsonValue>("invalid json") {
            Ok(value) => panic!("expected parse failure, got {value}"),
            Err(error) => error,
        };
        let error: OrchestrationError = json_error.into();
        assert!(matches!(error, OrchestrationError::Json(_)));
    }

    #[test]
    fn test_file_system_helper() {
        let error = OrchestrationError::file_system("a.txt", "permission denied");
        assert_eq!(
            error.to_string(),
            "File system error at a.txt: permission denied"
        );
    }
}
