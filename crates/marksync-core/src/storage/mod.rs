//! Storage layer
//!
//! Three tiers of the same SQLite schema:
//!
//! - **Buffer**: in memory, private to one source, refreshed every pass
//! - **Cache**: in memory, shared by all sources, merged into by each buffer
//! - **Disk**: a file holding a whole-database snapshot of the cache
//!
//! [`TieredStore`] owns the cache and the disk location and is shared by
//! every source. Merging a buffer holds the cache connection for the length
//! of the merge; the merge itself only relies on the URL uniqueness
//! constraint to resolve overlapping writes.

pub mod error;
pub mod schema;
pub mod sync;
pub mod tier;

pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sync::{mirror_to_disk, restore_from_disk, sync_to, SyncReport, SyncStrategy};
pub use tier::{Tier, TierKind, Upsert};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument};

use crate::models::Record;
use crate::watch::{stopped, Debouncer};

/// Shared cache plus disk mirror
#[derive(Debug, Clone)]
pub struct TieredStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    cache: Mutex<Tier>,
    disk_path: PathBuf,
    mirror: Mirror,
}

#[derive(Debug)]
enum Mirror {
    Immediate,
    Scheduled(mpsc::UnboundedSender<()>),
}

impl TieredStore {
    /// Open the store, mirroring the cache to disk after every merge
    ///
    /// An existing disk tier is restored into the cache first.
    pub fn open(disk_path: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::build(disk_path.into(), Mirror::Immediate)
    }

    /// Open the store with debounced mirroring
    ///
    /// Merges only request a mirror; the returned scheduler performs one
    /// mirror per quiet period of `interval` and must be driven by the caller.
    pub fn open_debounced(
        disk_path: impl Into<PathBuf>,
        interval: Duration,
    ) -> StorageResult<(Self, MirrorScheduler)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self::build(disk_path.into(), Mirror::Scheduled(tx))?;
        let scheduler = MirrorScheduler {
            store: store.clone(),
            debouncer: Debouncer::new(rx, interval),
        };
        Ok((store, scheduler))
    }

    fn build(disk_path: PathBuf, mirror: Mirror) -> StorageResult<Self> {
        let mut cache = Tier::open_cache()?;
        if restore_from_disk(&disk_path, &mut cache)? {
            debug!(records = cache.count()?, "cache primed from disk tier");
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                cache: Mutex::new(cache),
                disk_path,
                mirror,
            }),
        })
    }

    pub fn disk_path(&self) -> &Path {
        &self.inner.disk_path
    }

    fn cache(&self) -> StorageResult<MutexGuard<'_, Tier>> {
        self.inner
            .cache
            .lock()
            .map_err(|_| StorageError::Poisoned(TierKind::Cache))
    }

    /// Merge a source's buffer into the cache, then mirror per policy
    #[instrument(skip_all, fields(buffer = buffer.name()))]
    pub fn merge_buffer(&self, buffer: &Tier) -> StorageResult<SyncReport> {
        let report = {
            let mut cache = self.cache()?;
            let report = sync_to(buffer, &mut cache)?;
            if report.changed() {
                if let Mirror::Immediate = self.inner.mirror {
                    mirror_to_disk(&cache, &self.inner.disk_path)?;
                }
            }
            report
        };

        if report.changed() {
            if let Mirror::Scheduled(tx) = &self.inner.mirror {
                if tx.send(()).is_err() {
                    // scheduler gone, fall back to a direct mirror
                    self.mirror_now()?;
                }
            }
        }

        info!(
            strategy = ?report.strategy,
            inserted = report.inserted,
            merged = report.merged,
            "buffer merged into cache"
        );
        Ok(report)
    }

    /// Snapshot the cache to the disk tier now
    pub fn mirror_now(&self) -> StorageResult<()> {
        let cache = self.cache()?;
        mirror_to_disk(&cache, &self.inner.disk_path)
    }

    pub fn cache_count(&self) -> StorageResult<i64> {
        self.cache()?.count()
    }

    pub fn cache_get(&self, url: &str) -> StorageResult<Option<Record>> {
        self.cache()?.get(url)
    }

    pub fn cache_records(&self) -> StorageResult<Vec<Record>> {
        self.cache()?.records()
    }
}

/// Mirrors the cache to disk once merges have been quiet for an interval
pub struct MirrorScheduler {
    store: TieredStore,
    debouncer: Debouncer<()>,
}

impl MirrorScheduler {
    /// Run until `stop` is set, then write one final mirror
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(interval = ?self.debouncer.delay(), "mirror scheduler started");
        while let Some(burst) = self.debouncer.next(&mut stop).await {
            debug!(requests = burst.len(), "mirroring cache to disk");
            self.mirror().await;
        }

        stopped(&mut stop).await;
        self.mirror().await;
        info!("mirror scheduler stopped");
    }

    async fn mirror(&self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.mirror_now()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to mirror cache to disk"),
            Err(e) => error!(error = %e, "mirror task panicked"),
        }
    }
}
