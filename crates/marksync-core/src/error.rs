//! Error taxonomy for sources and their lifecycle
//!
//! Storage failures live in [`crate::storage::StorageError`] and watch
//! failures in [`crate::watch::WatchError`]; this module covers what a source
//! reader can report and how the lifecycle classifies each failure.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::module::ModuleState;
use crate::storage::StorageError;
use crate::watch::WatchError;

/// Errors a source reader can return
#[derive(Error, Debug)]
pub enum SourceError {
    /// Source file missing or locked by its owning application
    #[error("Source unavailable at '{path}': {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// Source data could not be parsed
    #[error("Failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    /// I/O error while reading the source
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SourceError {
    /// Classify an I/O error: missing files make the source unavailable
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => SourceError::Unavailable {
                path,
                reason: "file not found".to_string(),
            },
            _ => SourceError::Io {
                path,
                source: error,
            },
        }
    }
}

/// Errors raised by a source module's lifecycle operations
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Source locked or missing; the cycle is skipped
    #[error("Source '{module}' unavailable: {reason}")]
    SourceUnavailable { module: String, reason: String },

    /// Malformed source data; the previous tree is kept
    #[error("Source '{module}' returned malformed data: {source}")]
    Parse {
        module: String,
        #[source]
        source: SourceError,
    },

    /// A storage tier could not be opened or written
    #[error("Storage failure in '{module}': {source}")]
    StorageFatal {
        module: String,
        #[source]
        source: StorageError,
    },

    /// Watches could not be installed
    #[error("Watch setup failed for '{module}': {source}")]
    WatchSetup {
        module: String,
        #[source]
        source: WatchError,
    },

    /// Operation not allowed in the module's current state
    #[error("Cannot {op} module '{module}' in state {from:?}")]
    InvalidState {
        module: String,
        from: ModuleState,
        op: &'static str,
    },
}

impl ModuleError {
    /// Map a reader error to the lifecycle taxonomy
    pub fn from_source(module: &str, error: SourceError) -> Self {
        match error {
            SourceError::Unavailable { path, reason } => ModuleError::SourceUnavailable {
                module: module.to_string(),
                reason: format!("{}: {}", path.display(), reason),
            },
            SourceError::Io { path, source } if source.kind() == io::ErrorKind::NotFound => {
                ModuleError::SourceUnavailable {
                    module: module.to_string(),
                    reason: format!("{}: {}", path.display(), source),
                }
            }
            other => ModuleError::Parse {
                module: module.to_string(),
                source: other,
            },
        }
    }

    pub fn storage(module: &str, source: StorageError) -> Self {
        ModuleError::StorageFatal {
            module: module.to_string(),
            source,
        }
    }

    pub fn watch(module: &str, source: WatchError) -> Self {
        ModuleError::WatchSetup {
            module: module.to_string(),
            source,
        }
    }

    /// Whether this failure ends the source's lifecycle
    ///
    /// Only storage and watch-setup failures are fatal, and only for the
    /// source that raised them. Everything else skips one cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModuleError::StorageFatal { .. } | ModuleError::WatchSetup { .. }
        )
    }
}

/// Errors raised while registering sources
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Source descriptor has an empty id")]
    MissingId,

    #[error("Source '{0}' is already registered")]
    Duplicate(String),

    #[error("Source '{0}' was already provisioned elsewhere")]
    AlreadyProvisioned(String),
}

pub type ModuleResult<T> = Result<T, ModuleError>;
