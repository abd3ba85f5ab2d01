//! Command handlers

use std::path::Path;

use marksync_core::StorageError;

use crate::output::Output;

pub mod config;
pub mod daemon;
pub mod list;
pub mod status;
pub mod sync;

/// Turn a failure to open the store into a CLI error, printing its recovery hint
fn store_failure(output: &Output, error: StorageError, path: &Path) -> anyhow::Error {
    if let Some(hint) = error.recovery_suggestion() {
        output.warn(hint);
    }
    anyhow::Error::new(error).context(format!("Failed to open store at {:?}", path))
}
