//! Daemon command handler
//!
//! Watches every configured source and keeps the store in sync until
//! interrupted.

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::{error, info};

use marksync_core::{Config, MirrorMode, Orchestrator, Registry, TieredStore};

use crate::output::Output;

pub async fn run(config: &Config, output: &Output) -> Result<()> {
    if config.sources.is_empty() {
        bail!(
            "No sources configured. Add one to:\n  {}",
            Config::config_file_path().display()
        );
    }

    let disk_path = config.disk_path();
    let (store, scheduler) = match config.mirror {
        MirrorMode::Immediate => (TieredStore::open(&disk_path), None),
        MirrorMode::Debounced => {
            match TieredStore::open_debounced(&disk_path, config.mirror_interval()) {
                Ok((store, scheduler)) => (Ok(store), Some(scheduler)),
                Err(e) => (Err(e), None),
            }
        }
    };
    let store = store.map_err(|e| super::store_failure(output, e, &disk_path))?;

    let (registry, errors) = Registry::from_config(config, &store);
    for e in &errors {
        output.warn(&e.to_string());
    }
    if registry.is_empty() {
        bail!("No source could be registered");
    }

    let mut orchestrator = Orchestrator::new(store, registry);
    if let Some(scheduler) = scheduler {
        orchestrator = orchestrator.with_scheduler(scheduler);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for interrupt, stopping");
        } else {
            info!("interrupt received, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    output.message(&format!(
        "Watching {} source(s), press Ctrl-C to stop",
        orchestrator.registry().len()
    ));
    let statuses = orchestrator.run(stop_rx).await;
    output.print_statuses(&statuses);
    Ok(())
}
