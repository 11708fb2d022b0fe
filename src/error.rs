//! Error types for the keepsake library
//!
//! This module defines all error types that can occur during keepsake
//! operations. Errors fall into three classes: environment failures (the
//! filesystem cannot be trusted and the run must abort), detected races
//! (content moved under us between stat and read — fatal by design, because
//! a silently wrong digest would corrupt deduplication), and capacity
//! exhaustion (slot overflow in the repository).

use crate::types::BackupId;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the keepsake library
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Main error type for all keepsake operations
#[derive(Debug, Error)]
pub enum KeepsakeError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error annotated with the logical path being processed
    #[error("IO error on {path:?}: {source}")]
    PathIo {
        /// Logical source path (not the physical repository path)
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Backup marker not found in the catalog
    #[error("Backup not found: {0}")]
    BackupNotFound(BackupId),

    /// A backup run is already open on this catalog
    #[error("A backup is already in progress")]
    BackupInProgress,

    /// No backup run is open on this catalog
    #[error("No backup is in progress")]
    NoBackupInProgress,

    /// Requested path is not tracked by the catalog
    #[error("Path not tracked: {0:?}")]
    PathNotTracked(PathBuf),

    /// A path has no recorded state at the requested backup
    #[error("No recorded state for {path:?} at backup {backup}")]
    NoStateAtBackup {
        /// Path being resolved
        path: PathBuf,
        /// Requested backup id
        backup: BackupId,
    },

    /// Object missing from the content store
    #[error("Object not found in repository: {0}")]
    ObjectMissing(String),

    /// Read hit end of file before the requested length was satisfied
    #[error("Reached end of file unexpectedly: {path:?}")]
    UnexpectedEof {
        /// Logical source path of the object
        path: PathBuf,
    },

    /// File content changed between stat and read
    #[error("File changed while checking for changes: {0:?}")]
    FileChanged(PathBuf),

    /// File content changed between hashing and storing
    #[error("File changed while storing: {0:?}")]
    FileChangedDuringStore(PathBuf),

    /// Symlink target changed between stat and readlink
    #[error("Symlink changed while reading: {0:?}")]
    SymlinkChanged(PathBuf),

    /// More than 256 distinct objects collide on one (digest, size) address
    #[error("Slot overflow for object {digest} ({size} bytes): more than 256 colliding objects")]
    SlotOverflow {
        /// Hex-rendered digest of the colliding content
        digest: String,
        /// Size shared by the colliding objects
        size: u64,
    },

    /// Repository directory is missing or was never initialized
    #[error("Repository not initialized at {0:?}")]
    RepositoryNotInitialized(PathBuf),

    /// Repository directory already exists
    #[error("Repository already exists at {0:?}")]
    RepositoryAlreadyExists(PathBuf),

    /// Catalog file is missing
    #[error("Catalog not found at {0:?}")]
    CatalogNotFound(PathBuf),

    /// Catalog violates a structural invariant
    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    /// Search feed yielded a result that violates its protocol
    #[error("Search feed protocol violation: {0}")]
    FeedProtocol(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for KeepsakeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        KeepsakeError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for KeepsakeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        KeepsakeError::Bincode(err.to_string())
    }
}

impl KeepsakeError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        KeepsakeError::Internal(msg.into())
    }

    /// Create an invalid-configuration error with a custom message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        KeepsakeError::InvalidConfiguration(msg.into())
    }

    /// Wrap an I/O error with the logical path it occurred on
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeepsakeError::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Check if this error is a detected race (content moved between stat
    /// and read). Races are never retried.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            KeepsakeError::FileChanged(_)
                | KeepsakeError::FileChangedDuringStore(_)
                | KeepsakeError::SymlinkChanged(_)
        )
    }

    /// Check if this error indicates a corrupt or inconsistent catalog/store
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KeepsakeError::InvalidCatalog(_)
                | KeepsakeError::UnexpectedEof { .. }
                | KeepsakeError::ObjectMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KeepsakeError::PathNotTracked(PathBuf::from("/home/user/notes"));
        assert_eq!(err.to_string(), "Path not tracked: \"/home/user/notes\"");
    }

    #[test]
    fn test_error_race() {
        assert!(KeepsakeError::FileChanged(PathBuf::from("a")).is_race());
        assert!(KeepsakeError::SymlinkChanged(PathBuf::from("a")).is_race());
        assert!(!KeepsakeError::BackupInProgress.is_race());
    }

    #[test]
    fn test_error_corruption() {
        assert!(KeepsakeError::UnexpectedEof {
            path: PathBuf::from("a"),
        }
        .is_corruption());
        assert!(!KeepsakeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test"
        ))
        .is_corruption());
    }
}
