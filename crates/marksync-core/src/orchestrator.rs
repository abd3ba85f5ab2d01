//! Drives registered sources
//!
//! Each source gets one task that owns its module outright: init and load,
//! then a loop of waiting for a debounced trigger and running one
//! reconciliation. Blocking work (reading sources, SQLite) is moved onto the
//! blocking pool together with the module and handed back afterwards, so a
//! module is never touched from two places at once. Tasks for different
//! sources run concurrently and share only the [`TieredStore`].
//!
//! Setting the stop flag ends every loop; each module is shut down and a
//! final mirror of the cache is written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use crate::module::{ModuleState, ModuleStats, SourceModule};
use crate::registry::Registry;
use crate::storage::{MirrorScheduler, TieredStore};
use crate::watch::stopped;

/// Final or current view of one source
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub kind: String,
    pub state: ModuleState,
    pub watermark: Option<DateTime<Utc>>,
    pub stats: ModuleStats,
    /// Last lifecycle error, if any
    pub error: Option<String>,
}

impl SourceStatus {
    fn of(module: &SourceModule, error: Option<String>) -> Self {
        Self {
            id: module.id().to_string(),
            kind: module.descriptor().kind.clone(),
            state: module.state(),
            watermark: module.watermark(),
            stats: module.stats().clone(),
            error,
        }
    }
}

/// Owns the registry and the shared store for the life of the process
pub struct Orchestrator {
    store: TieredStore,
    registry: Registry,
    scheduler: Option<MirrorScheduler>,
}

impl Orchestrator {
    pub fn new(store: TieredStore, registry: Registry) -> Self {
        Self {
            store,
            registry,
            scheduler: None,
        }
    }

    /// Drive a debounced disk mirror alongside the sources
    pub fn with_scheduler(mut self, scheduler: MirrorScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    /// Initialize and load every source once, then shut them down
    ///
    /// Failures are isolated per source and reported in the returned status.
    pub fn sync_once(self) -> Vec<SourceStatus> {
        let mut statuses = Vec::new();
        for mut module in self.registry.into_modules() {
            let _span = info_span!("source", source = %module.id()).entered();
            let error = init_and_load(&mut module).err();
            module.shutdown();
            statuses.push(SourceStatus::of(&module, error));
        }

        if let Err(e) = self.store.mirror_now() {
            error!(error = %e, "final mirror failed");
        }
        statuses
    }

    /// Run every source until `stop` is set
    pub async fn run(self, stop: watch::Receiver<bool>) -> Vec<SourceStatus> {
        let scheduler = self
            .scheduler
            .map(|scheduler| tokio::spawn(scheduler.run(stop.clone())));

        let mut tasks = JoinSet::new();
        for module in self.registry.into_modules() {
            let span = info_span!("source", source = %module.id());
            tasks.spawn(source_task(module, stop.clone()).instrument(span));
        }
        info!(sources = tasks.len(), "orchestrator started");

        let mut statuses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) => statuses.push(status),
                Err(e) => error!(error = %e, "source task panicked"),
            }
        }

        match scheduler {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "mirror scheduler panicked");
                }
            }
            None => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.mirror_now()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "final mirror failed"),
                    Err(e) => error!(error = %e, "final mirror panicked"),
                }
            }
        }

        info!("orchestrator stopped");
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}

fn init_and_load(module: &mut SourceModule) -> Result<(), String> {
    if let Err(e) = module.init() {
        error!(error = %e, "init failed, source disabled");
        return Err(e.to_string());
    }
    if let Err(e) = module.load() {
        if e.is_fatal() {
            error!(error = %e, "load failed, source disabled");
        } else {
            warn!(error = %e, "initial load skipped");
        }
        return Err(e.to_string());
    }
    Ok(())
}

/// Move the module onto the blocking pool for `f` and get it back
async fn blocking<T, F>(mut module: SourceModule, f: F) -> Result<(SourceModule, T), JoinError>
where
    F: FnOnce(&mut SourceModule) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = f(&mut module);
        (module, out)
    })
    .await
}

async fn source_task(module: SourceModule, mut stop: watch::Receiver<bool>) -> SourceStatus {
    let id = module.id().to_string();
    let kind = module.descriptor().kind.clone();
    let lost = |e: JoinError| SourceStatus {
        id: id.clone(),
        kind: kind.clone(),
        state: ModuleState::Failed,
        watermark: None,
        stats: ModuleStats::default(),
        error: Some(e.to_string()),
    };

    let (mut module, mut last_error) = match blocking(module, init_and_load).await {
        Ok((module, result)) => (module, result.err()),
        Err(e) => return lost(e),
    };

    if module.state() == ModuleState::Failed {
        module.shutdown();
        return SourceStatus::of(&module, last_error);
    }

    match module.watch() {
        Ok(true) => {}
        Ok(false) => info!("source not watched"),
        Err(e) => {
            warn!(error = %e, "watch setup failed, source can only be synced manually");
            last_error = Some(e.to_string());
        }
    }

    if module.is_watching() {
        while let Some(trigger) = module.next_trigger(&mut stop).await {
            let (returned, result) = match blocking(module, |m| m.run()).await {
                Ok(done) => done,
                Err(e) => return lost(e),
            };
            module = returned;
            last_error = result.err().map(|e| e.to_string());
            module.complete_trigger(&trigger);
        }
    } else {
        stopped(&mut stop).await;
    }

    module.shutdown();
    SourceStatus::of(&module, last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChromeJsonReader, SourceDescriptor};
    use std::time::Duration;
    use tempfile::TempDir;

    const BOOKMARKS: &str = r#"{
        "roots": {
            "bookmark_bar": {
                "type": "folder",
                "name": "Bookmarks bar",
                "children": [
                    { "type": "url", "name": "Rust", "url": "https://www.rust-lang.org/" }
                ]
            }
        }
    }"#;

    fn chrome_module(dir: &TempDir, id: &str, store: &TieredStore) -> SourceModule {
        let profile = dir.path().join(id);
        std::fs::create_dir_all(&profile).unwrap();
        let file = profile.join("Bookmarks");
        std::fs::write(&file, BOOKMARKS).unwrap();
        SourceModule::new(
            SourceDescriptor::new(id, "chrome").with_debounce(Duration::from_millis(100)),
            Box::new(ChromeJsonReader::new(file)),
            store.clone(),
        )
    }

    #[test]
    fn test_sync_once_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let store = TieredStore::open(dir.path().join("marksync.db")).unwrap();

        let mut registry = Registry::new();
        registry.register(chrome_module(&dir, "good", &store)).unwrap();
        registry
            .register(SourceModule::new(
                SourceDescriptor::new("missing", "chrome"),
                Box::new(ChromeJsonReader::new(dir.path().join("nope/Default/Bookmarks"))),
                store.clone(),
            ))
            .unwrap();

        let statuses = Orchestrator::new(store.clone(), registry).sync_once();
        assert_eq!(statuses.len(), 2);

        let good = statuses.iter().find(|s| s.id == "good").unwrap();
        assert!(good.error.is_none());
        assert_eq!(good.state, ModuleState::Closed);
        assert_eq!(good.stats.url_count, 1);

        let missing = statuses.iter().find(|s| s.id == "missing").unwrap();
        assert!(missing.error.is_some());

        assert_eq!(store.cache_count().unwrap(), 1);
        assert!(store.disk_path().exists());
    }

    #[tokio::test]
    async fn test_run_picks_up_changes_and_stops() {
        let dir = TempDir::new().unwrap();
        let store = TieredStore::open(dir.path().join("marksync.db")).unwrap();
        let mut registry = Registry::new();
        registry.register(chrome_module(&dir, "chromium", &store)).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Orchestrator::new(store.clone(), registry).run(stop_rx));

        // wait for the initial load
        let mut loaded = false;
        for _ in 0..100 {
            if store.cache_count().unwrap() == 1 {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(loaded, "initial load never reached the cache");
        // the watch is installed right after the load
        tokio::time::sleep(Duration::from_millis(300)).await;

        let updated = BOOKMARKS.replace(
            r#"{ "type": "url", "name": "Rust", "url": "https://www.rust-lang.org/" }"#,
            r#"{ "type": "url", "name": "Rust", "url": "https://www.rust-lang.org/" },
               { "type": "url", "name": "Docs", "url": "https://docs.rs/" }"#,
        );
        std::fs::write(dir.path().join("chromium/Bookmarks"), updated).unwrap();

        let mut synced = false;
        for _ in 0..100 {
            if store.cache_count().unwrap() == 2 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(synced, "change was never reconciled");

        stop_tx.send(true).unwrap();
        let statuses = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ModuleState::Closed);
        assert!(statuses[0].stats.runs >= 2);
    }
}
