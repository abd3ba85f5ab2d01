//! Storage error handling
//!
//! Typed errors for the buffer, cache and disk tiers, with enough context to
//! tell which tier failed and why.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::tier::TierKind;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A tier could not be opened
    #[error("Failed to open {tier} tier '{name}': {source}")]
    Open {
        tier: TierKind,
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Snapshot copy between tiers failed
    #[error("Failed to mirror '{from}' to '{to}': {source}")]
    Mirror {
        from: String,
        to: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Atomic replace of the disk tier failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Schema version on disk is newer than this build understands
    #[error("Unrecognized schema version {found} (current is {current})")]
    SchemaVersion { found: i32, current: i32 },

    /// A tier lock was poisoned by a panicking writer
    #[error("{0} tier lock poisoned")]
    Poisoned(TierKind),

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Whether this is the unique-key violation the merge protocol resolves inline
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StorageError::Database(e) => is_constraint_violation(e),
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions of the data directory.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::SchemaVersion { .. } => {
                Some("The database was written by a newer marksync; upgrade before syncing.")
            }
            _ => None,
        }
    }
}

/// Check whether a SQLite error is a uniqueness/constraint failure
pub fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(err, StorageError::DiskFull { .. }));
    }

    #[test]
    fn test_constraint_violation_detection() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (url TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();

        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .map_err(StorageError::from)
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let other = StorageError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!other.is_constraint_violation());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::Open {
            tier: TierKind::Cache,
            name: "memcache".to_string(),
            source: rusqlite::Error::InvalidQuery,
        };

        let msg = err.to_string();
        assert!(msg.contains("cache"));
        assert!(msg.contains("memcache"));
    }
}
