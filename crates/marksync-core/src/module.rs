//! Per-source lifecycle
//!
//! A [`SourceModule`] binds one reader to its private tree and buffer and to
//! the shared [`TieredStore`]. It moves through
//!
//! ```text
//! Unregistered -> Provisioned -> Initialized -> Loaded -> Watching
//!                                                           |  ^
//!                                                           v  |
//!                                                          Running
//! any -> ShuttingDown -> Closed
//! ```
//!
//! `Failed` is entered when `init` or `load` hits a fatal error. A failed
//! module can only be shut down; other modules are unaffected.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{ModuleError, ModuleResult};
use crate::lock::LockCheck;
use crate::models::now_secs;
use crate::source::{SourceDescriptor, SourceReader};
use crate::storage::{SyncReport, Tier, TieredStore};
use crate::tree::{BookmarkTree, SharedTree};
use crate::watch::{DebouncedWatch, Trigger, WatchError, WatchSpec};

/// Margin subtracted from the watermark when asking for incremental changes
pub const WATERMARK_MARGIN: Duration = Duration::from_secs(1);

/// Lifecycle state of a source module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModuleState {
    Unregistered,
    Provisioned,
    Initialized,
    Loaded,
    Watching,
    Running,
    ShuttingDown,
    Closed,
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters and timings for one module
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleStats {
    pub url_count: usize,
    pub node_count: usize,
    /// Duration of the last full tree build
    pub last_parse: Option<Duration>,
    /// Duration of the last reconciliation, pull to merge
    pub last_run: Option<Duration>,
    pub runs: u64,
    pub skipped: u64,
    /// Records written to the cache by the last reconciliation
    pub last_changed: usize,
}

/// What one reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// The pull was the source's whole bookmark set
    pub full: bool,
    /// Entries returned by the reader
    pub entries: usize,
    /// Records written to the buffer
    pub buffered: usize,
    pub sync: SyncReport,
}

/// One source's lifecycle, tree, buffer and watch
pub struct SourceModule {
    descriptor: SourceDescriptor,
    reader: Box<dyn SourceReader>,
    store: TieredStore,
    lock_check: Option<Box<dyn LockCheck>>,
    state: ModuleState,
    tree: SharedTree,
    buffer: Option<Tier>,
    specs: Vec<WatchSpec>,
    watch: Option<DebouncedWatch>,
    watermark: Option<DateTime<Utc>>,
    stats: ModuleStats,
}

impl fmt::Debug for SourceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceModule")
            .field("id", &self.descriptor.id)
            .field("state", &self.state)
            .field("watermark", &self.watermark)
            .finish()
    }
}

impl SourceModule {
    pub fn new(
        descriptor: SourceDescriptor,
        reader: Box<dyn SourceReader>,
        store: TieredStore,
    ) -> Self {
        Self {
            descriptor,
            reader,
            store,
            lock_check: None,
            state: ModuleState::Unregistered,
            tree: SharedTree::default(),
            buffer: None,
            specs: Vec::new(),
            watch: None,
            watermark: None,
            stats: ModuleStats::default(),
        }
    }

    /// Probe used when the descriptor declares `lock_check`
    pub fn with_lock_check(mut self, lock_check: Box<dyn LockCheck>) -> Self {
        self.lock_check = Some(lock_check);
        self
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn stats(&self) -> &ModuleStats {
        &self.stats
    }

    /// Handle to the published tree, shareable with readers
    pub fn tree(&self) -> SharedTree {
        self.tree.clone()
    }

    pub fn buffer(&self) -> Option<&Tier> {
        self.buffer.as_ref()
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    fn invalid(&self, op: &'static str) -> ModuleError {
        ModuleError::InvalidState {
            module: self.descriptor.id.clone(),
            from: self.state,
            op,
        }
    }

    /// Record registration; no side effects
    pub fn provision(&mut self) -> ModuleResult<()> {
        if self.state != ModuleState::Unregistered {
            return Err(self.invalid("provision"));
        }
        self.state = ModuleState::Provisioned;
        debug!(source = %self.descriptor.id, "provisioned");
        Ok(())
    }

    /// Allocate the buffer, an empty tree and the watch specs
    ///
    /// Any failure here is fatal for this source and leaves it `Failed`.
    #[instrument(skip(self), fields(source = %self.descriptor.id))]
    pub fn init(&mut self) -> ModuleResult<()> {
        if self.state != ModuleState::Provisioned {
            return Err(self.invalid("init"));
        }

        let buffer = match Tier::open_buffer(&self.descriptor.id) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.state = ModuleState::Failed;
                return Err(ModuleError::storage(&self.descriptor.id, e));
            }
        };

        if self.descriptor.capabilities.watch {
            let specs = self.reader.watch_specs();
            if let Some(missing) = specs.iter().find(|s| !s.path.exists()) {
                self.state = ModuleState::Failed;
                return Err(ModuleError::watch(
                    &self.descriptor.id,
                    WatchError::MissingPath(missing.path.clone()),
                ));
            }
            self.specs = specs;
        }

        self.buffer = Some(buffer);
        self.tree.swap(BookmarkTree::new());
        self.state = ModuleState::Initialized;
        info!(buffer = self.buffer.as_ref().map(Tier::name), "initialized");
        Ok(())
    }

    /// First full pull: build the tree, fill the buffer, merge into the cache
    ///
    /// On failure the cleanup hook runs if the source declared one. Storage
    /// failures leave the module `Failed`; other failures leave it
    /// `Initialized` so a later run can retry.
    #[instrument(skip(self), fields(source = %self.descriptor.id))]
    pub fn load(&mut self) -> ModuleResult<RunReport> {
        if self.state != ModuleState::Initialized {
            return Err(self.invalid("load"));
        }

        match self.reconcile(true) {
            Ok(report) => {
                self.state = ModuleState::Loaded;
                info!(
                    urls = self.stats.url_count,
                    nodes = self.stats.node_count,
                    "loaded"
                );
                Ok(report)
            }
            Err(e) => {
                if self.descriptor.capabilities.cleanup {
                    if let Err(cleanup) = self.reader.cleanup() {
                        warn!(error = %cleanup, "cleanup after failed load failed");
                    }
                }
                if e.is_fatal() {
                    self.state = ModuleState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Install the debounced watch
    ///
    /// Returns false when a watch already exists or the source is not
    /// watchable. On failure the module stays usable through [`run`](Self::run).
    pub fn watch(&mut self) -> ModuleResult<bool> {
        match self.state {
            ModuleState::Watching => return Ok(false),
            ModuleState::Initialized | ModuleState::Loaded => {}
            _ => return Err(self.invalid("watch")),
        }
        if self.watch.is_some() || !self.descriptor.capabilities.watch || self.specs.is_empty() {
            return Ok(false);
        }

        let watch = DebouncedWatch::subscribe(self.specs.clone(), self.descriptor.debounce)
            .map_err(|e| ModuleError::watch(&self.descriptor.id, e))?;
        info!(source = %self.descriptor.id, debounce = ?self.descriptor.debounce, "watching");
        self.watch = Some(watch);
        self.state = ModuleState::Watching;
        Ok(true)
    }

    /// Wait for the next coalesced change, or `None` once stopped or unwatched
    pub async fn next_trigger(&mut self, stop: &mut watch::Receiver<bool>) -> Option<Trigger> {
        match self.watch.as_mut() {
            Some(watch) => watch.next(stop).await,
            None => None,
        }
    }

    /// Recreate watches invalidated by the trigger's file replacements
    pub fn complete_trigger(&mut self, trigger: &Trigger) {
        if let Some(watch) = self.watch.as_mut() {
            match watch.reset_after(trigger) {
                Ok(true) => debug!(source = %self.descriptor.id, "watch reset"),
                Ok(false) => {}
                Err(e) => warn!(source = %self.descriptor.id, error = %e, "watch reset failed"),
            }
        }
    }

    /// Incremental reconciliation for one coalesced trigger
    ///
    /// Errors skip the cycle: the previous tree, buffer and watermark stay.
    /// A failure after the cache merge, while committing an incremental pull
    /// to the buffer, leaves the cache ahead of the buffer; the next pull
    /// catches it up.
    #[instrument(skip(self), fields(source = %self.descriptor.id))]
    pub fn run(&mut self) -> ModuleResult<RunReport> {
        let resume = match self.state {
            ModuleState::Initialized | ModuleState::Loaded => ModuleState::Loaded,
            ModuleState::Watching => ModuleState::Watching,
            _ => return Err(self.invalid("run")),
        };
        let previous = self.state;

        self.state = ModuleState::Running;
        let result = self.reconcile(false);
        self.state = match result {
            Ok(_) => resume,
            Err(_) => previous,
        };

        if let Err(e) = &result {
            self.stats.skipped += 1;
            warn!(error = %e, "cycle skipped");
        }
        result
    }

    /// Release the watch and the buffer; safe to call repeatedly
    pub fn shutdown(&mut self) {
        if self.state == ModuleState::Closed {
            return;
        }
        self.state = ModuleState::ShuttingDown;
        if let Some(mut watch) = self.watch.take() {
            watch.close();
        }
        self.buffer = None;
        self.state = ModuleState::Closed;
        info!(source = %self.descriptor.id, "shut down");
    }

    fn reconcile(&mut self, force_full: bool) -> ModuleResult<RunReport> {
        let id = self.descriptor.id.clone();
        let started = Instant::now();
        let pulled_at = now_secs();

        self.check_lock()?;

        let since = if force_full || !self.descriptor.capabilities.incremental {
            None
        } else {
            let margin = chrono::Duration::seconds(WATERMARK_MARGIN.as_secs() as i64);
            self.watermark.map(|w| w - margin)
        };

        let pull = self
            .reader
            .read(since)
            .map_err(|e| ModuleError::from_source(&id, e))?;

        let parse_started = Instant::now();
        let mut tree = if pull.complete {
            BookmarkTree::new()
        } else {
            (*self.tree.snapshot()).clone()
        };
        for entry in &pull.entries {
            tree.insert_entry(entry);
        }
        if pull.complete {
            self.stats.last_parse = Some(parse_started.elapsed());
        }

        let records = if pull.complete {
            tree.records(&self.descriptor.kind)
        } else {
            tree.records_for(pull.entries.iter().map(|e| e.url.as_str()), &self.descriptor.kind)
        };

        if self.buffer.is_none() {
            return Err(self.invalid("reconcile"));
        }

        // the pull is merged from a staging tier so a failed merge leaves the
        // buffer as it was
        let mut staged = Tier::open_buffer(&id).map_err(|e| ModuleError::storage(&id, e))?;
        let buffered = staged
            .upsert_many(&records)
            .map_err(|e| ModuleError::storage(&id, e))?;
        let sync = self
            .store
            .merge_buffer(&staged)
            .map_err(|e| ModuleError::storage(&id, e))?;

        if pull.complete {
            self.buffer = Some(staged);
        } else if let Some(buffer) = self.buffer.as_mut() {
            buffer
                .upsert_many(&records)
                .map_err(|e| ModuleError::storage(&id, e))?;
        }

        self.stats.url_count = tree.url_count();
        self.stats.node_count = tree.node_count();
        self.tree.swap(tree);
        self.watermark = Some(pulled_at);

        self.stats.runs += 1;
        self.stats.last_run = Some(started.elapsed());
        self.stats.last_changed = sync.inserted + sync.merged;

        debug!(
            entries = pull.entries.len(),
            buffered,
            inserted = sync.inserted,
            merged = sync.merged,
            "reconciled"
        );
        Ok(RunReport {
            full: pull.complete,
            entries: pull.entries.len(),
            buffered,
            sync,
        })
    }

    fn check_lock(&self) -> ModuleResult<()> {
        if !self.descriptor.capabilities.lock_check {
            return Ok(());
        }
        let Some(lock_check) = &self.lock_check else {
            return Ok(());
        };

        let path = self.reader.path();
        match lock_check.is_locked(path) {
            Ok(false) => Ok(()),
            Ok(true) => Err(ModuleError::SourceUnavailable {
                module: self.descriptor.id.clone(),
                reason: format!("{} is locked by another process", path.display()),
            }),
            Err(e) => Err(ModuleError::SourceUnavailable {
                module: self.descriptor.id.clone(),
                reason: format!("{}: {}", path.display(), e),
            }),
        }
    }
}
