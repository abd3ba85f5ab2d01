//! Sync command handler

use anyhow::{bail, Result};
use tracing::warn;

use marksync_core::{Config, Orchestrator, Registry, TieredStore};

use crate::output::Output;

/// Load every configured source once and merge it into the store
pub fn sync(config: &Config, output: &Output) -> Result<()> {
    if config.sources.is_empty() {
        bail!(
            "No sources configured. Add one to:\n  {}",
            Config::config_file_path().display()
        );
    }

    let disk_path = config.disk_path();
    let store =
        TieredStore::open(&disk_path).map_err(|e| super::store_failure(output, e, &disk_path))?;
    let (registry, errors) = Registry::from_config(config, &store);
    for e in &errors {
        output.warn(&e.to_string());
    }

    let statuses = Orchestrator::new(store.clone(), registry).sync_once();
    output.print_statuses(&statuses);

    let failed = statuses.iter().filter(|s| s.error.is_some()).count();
    if failed > 0 {
        warn!(failed, "sync finished with errors");
        bail!("{} of {} source(s) failed", failed, statuses.len());
    }

    output.success(&format!("{} bookmark(s) stored", store.cache_count()?));
    Ok(())
}
