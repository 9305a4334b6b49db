//! Typed error hierarchy for chanfetch
//!
//! Every error type includes context about what went wrong and whether
//! the operation can be retried.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download manager
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Transient transport-level errors (network hiccup, platform rate limit)
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The platform reports the file deleted or otherwise unavailable
    #[error("File unavailable: {message}")]
    FileUnavailable { message: String },

    /// The channel scan itself cannot proceed (unreachable, unauthorized)
    #[error("Channel scan error: {message}")]
    ChannelScan { message: String },

    /// Local storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Rejected control action (e.g., pausing a completed job)
    #[error("Invalid transition: cannot {action} while {current_state}")]
    InvalidTransition {
        action: &'static str,
        current_state: String,
    },

    /// Job or transfer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Platform session/authentication error
    #[error("Session error: {message}")]
    Session { message: String },

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Disk full
    DiskFull,
    /// Other I/O error
    Io,
}

impl ManagerError {
    /// Check if this error is retryable with backoff.
    ///
    /// Only transport errors are; storage errors pause the job instead of
    /// being retried, and everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    /// Create a retryable transport error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a file-unavailable error
    pub fn file_unavailable(message: impl Into<String>) -> Self {
        Self::FileUnavailable {
            message: message.into(),
        }
    }

    /// Create a channel scan error
    pub fn scan(message: impl Into<String>) -> Self {
        Self::ChannelScan {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }
}

/// Result type alias for manager operations
pub type Result<T> = std::result::Result<T, ManagerError>;

// Implement From traits for common error types

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::StorageFull => StorageErrorKind::DiskFull,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for ManagerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}
