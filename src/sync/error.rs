//! Error type for replica synchronization.
//!
//! Only a handful of variants are session-fatal (see [`SyncError::is_fatal`]);
//! per-item failures never surface as `SyncError` from the engine, they are
//! reported as skipped changes instead.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used across the sync module.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A replica root does not exist.
    #[error("replica root not found: {}", path.display())]
    RootNotFound { path: PathBuf },

    /// A replica root exists but is not a directory.
    #[error("replica root is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    /// Source and destination resolve to the same directory.
    #[error("source and destination are the same directory: {}", path.display())]
    SameRoot { path: PathBuf },

    /// Another session holds the store lock for this replica.
    #[error("metadata store for {} is locked by another session", path.display())]
    StoreLocked { path: PathBuf },

    /// An include or exclude pattern failed to compile.
    #[error("invalid filter pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// I/O failure with the operation and path that caused it.
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The metadata store could not be serialized.
    #[error("failed to encode metadata store: {0}")]
    Encode(#[from] serde_json::Error),

    /// The destination root disappeared or became unreadable mid-session.
    #[error("destination replica is unavailable: {}", path.display())]
    DestinationUnavailable { path: PathBuf },

    /// The caller cancelled the session.
    #[error("synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    /// Wrap an `io::Error` with the operation being attempted and its path.
    pub fn io(operation: impl Into<String>, path: impl AsRef<Path>, source: io::Error) -> Self {
        SyncError::Io {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for failures detected before any detection work starts.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::RootNotFound { .. }
                | SyncError::NotADirectory { .. }
                | SyncError::SameRoot { .. }
                | SyncError::InvalidPattern { .. }
        )
    }

    /// True for errors that end the whole session.
    pub fn is_fatal(&self) -> bool {
        self.is_precondition()
            || matches!(
                self,
                SyncError::StoreLocked { .. }
                    | SyncError::DestinationUnavailable { .. }
                    | SyncError::Cancelled
            )
    }
}
