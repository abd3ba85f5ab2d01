//! Debounced filesystem watching
//!
//! A source declares what it wants observed as a list of [`WatchSpec`]s.
//! [`DebouncedWatch`] installs one low-level `notify` watcher per spec and
//! feeds matching events into a [`Debouncer`], which turns any burst of
//! events into a single [`Trigger`] once the source has been quiet for the
//! configured delay.
//!
//! Files replaced through rename can invalidate the low-level watch. Specs
//! marked `reset_on_trigger` have their watcher torn down and recreated after
//! a trigger that saw such a replacement (`Watching -> Resetting -> Watching`).

use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default quiet period before a burst of events becomes a trigger
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Errors raised while installing or resetting watches
#[derive(Error, Debug)]
pub enum WatchError {
    /// The watched path does not exist
    #[error("Watch path does not exist: '{0}'")]
    MissingPath(PathBuf),

    /// The low-level watcher could not be installed
    #[error("Failed to watch '{path}': {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// Error reported by the watch primitive after setup
    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Set of filesystem operations a spec is interested in
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct OpMask(u8);

impl OpMask {
    pub const NONE: OpMask = OpMask(0);
    pub const CREATE: OpMask = OpMask(1);
    pub const WRITE: OpMask = OpMask(1 << 1);
    pub const REMOVE: OpMask = OpMask(1 << 2);
    pub const RENAME: OpMask = OpMask(1 << 3);
    pub const ALL: OpMask = OpMask(0b1111);

    /// The operation a `notify` event kind represents
    pub fn of(kind: &EventKind) -> OpMask {
        match kind {
            EventKind::Create(_) => OpMask::CREATE,
            EventKind::Modify(ModifyKind::Name(_)) => OpMask::RENAME,
            EventKind::Modify(ModifyKind::Metadata(_)) => OpMask::NONE,
            EventKind::Modify(_) => OpMask::WRITE,
            EventKind::Remove(_) => OpMask::REMOVE,
            _ => OpMask::NONE,
        }
    }

    pub fn contains(self, other: OpMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: OpMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for OpMask {
    type Output = OpMask;

    fn bitor(self, rhs: OpMask) -> OpMask {
        OpMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for OpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (mask, name) in [
            (OpMask::CREATE, "CREATE"),
            (OpMask::WRITE, "WRITE"),
            (OpMask::REMOVE, "REMOVE"),
            (OpMask::RENAME, "RENAME"),
        ] {
            if self.contains(mask) {
                names.push(name);
            }
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "OpMask({})", names.join("|"))
    }
}

/// One `(path, operation-mask)` watch descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    /// File or directory to watch (not recursive)
    pub path: PathBuf,
    /// Operations that count as a change
    pub ops: OpMask,
    /// When non-empty, only events on files with one of these names match
    pub names: Vec<String>,
    /// Recreate the low-level watch after a trigger that replaced a file
    pub reset_on_trigger: bool,
}

impl WatchSpec {
    pub fn new(path: impl Into<PathBuf>, ops: OpMask) -> Self {
        Self {
            path: path.into(),
            ops,
            names: Vec::new(),
            reset_on_trigger: false,
        }
    }

    /// Restrict matching to files with the given name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn reset_on_trigger(mut self) -> Self {
        self.reset_on_trigger = true;
        self
    }

    /// Classify a raw event against this spec
    pub fn classify(&self, event: &Event) -> EventClass {
        let op = OpMask::of(&event.kind);
        if !self.ops.intersects(op) {
            return EventClass::Ignored;
        }

        if !self.names.is_empty() {
            let named = event.paths.iter().any(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| self.names.iter().any(|want| want == n))
            });
            if !named {
                return EventClass::Ignored;
            }
        }

        if op.intersects(OpMask::CREATE | OpMask::REMOVE | OpMask::RENAME) {
            EventClass::Replaced
        } else {
            EventClass::Changed
        }
    }
}

/// How a raw filesystem event relates to a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Not a matching operation or file
    Ignored,
    /// Matching file written in place
    Changed,
    /// Matching file created, removed or renamed; the watch may be stale
    Replaced,
}

/// A matching event, tagged with the index of the spec it matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub spec: usize,
    pub class: EventClass,
}

/// One coalesced trigger delivered after a quiet period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Raw events folded into this trigger
    pub events: usize,
    /// Indices of specs that saw a file replacement during the burst
    pub replaced: Vec<usize>,
}

impl Trigger {
    fn from_events(events: &[WatchEvent]) -> Self {
        let mut replaced: Vec<usize> = events
            .iter()
            .filter(|e| e.class == EventClass::Replaced)
            .map(|e| e.spec)
            .collect();
        replaced.sort_unstable();
        replaced.dedup();
        Self {
            events: events.len(),
            replaced,
        }
    }
}

/// Lifecycle of a [`DebouncedWatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No low-level watches installed
    Idle,
    /// Watches installed and delivering events
    Watching,
    /// Recreating the watches of replaced files
    Resetting,
}

/// Coalesces a stream of events into bursts separated by a quiet period
///
/// Every received event resets an idle timer and marks the burst pending.
/// When the timer fires with a pending burst the whole burst is returned.
pub struct Debouncer<T> {
    rx: mpsc::UnboundedReceiver<T>,
    delay: Duration,
}

impl<T> Debouncer<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, delay: Duration) -> Self {
        Self { rx, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for the next burst of events
    ///
    /// Returns `None` once `stop` is set, or when the sending side has closed
    /// with nothing pending. A burst pending when the sender closes is
    /// delivered immediately.
    pub async fn next(&mut self, stop: &mut watch::Receiver<bool>) -> Option<Vec<T>> {
        let first = tokio::select! {
            event = self.rx.recv() => event?,
            _ = stopped(stop) => return None,
        };

        let mut burst = vec![first];
        let sleep = tokio::time::sleep(self.delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        burst.push(event);
                        sleep.as_mut().reset(Instant::now() + self.delay);
                    }
                    None => return Some(burst),
                },
                _ = &mut sleep => return Some(burst),
                _ = stopped(stop) => return None,
            }
        }
    }
}

/// Resolves once the stop flag is set or its sender is gone
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Low-level watchers for a list of specs, all feeding one channel
struct FsWatch {
    specs: Vec<WatchSpec>,
    watchers: Vec<Option<RecommendedWatcher>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl FsWatch {
    fn new(specs: Vec<WatchSpec>, tx: mpsc::UnboundedSender<WatchEvent>) -> Self {
        let watchers = specs.iter().map(|_| None).collect();
        Self {
            specs,
            watchers,
            tx,
        }
    }

    fn install(&mut self, index: usize) -> Result<(), WatchError> {
        let spec = self.specs[index].clone();
        if !spec.path.exists() {
            return Err(WatchError::MissingPath(spec.path));
        }

        let tx = self.tx.clone();
        let matcher = spec.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let class = matcher.classify(&event);
                    trace!(path = %matcher.path.display(), kind = ?event.kind, ?class, "fs event");
                    if class != EventClass::Ignored {
                        let _ = tx.send(WatchEvent { spec: index, class });
                    }
                }
                Err(e) => warn!(path = %matcher.path.display(), error = %e, "watch error"),
            })
            .map_err(|source| WatchError::Setup {
                path: spec.path.clone(),
                source,
            })?;

        watcher
            .watch(&spec.path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Setup {
                path: spec.path.clone(),
                source,
            })?;

        debug!(path = %spec.path.display(), ops = ?spec.ops, "watch installed");
        self.watchers[index] = Some(watcher);
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        if let Some(mut watcher) = self.watchers[index].take() {
            if let Err(e) = watcher.unwatch(&self.specs[index].path) {
                debug!(path = %self.specs[index].path.display(), error = %e, "unwatch failed");
            }
        }
    }

    fn remove_all(&mut self) {
        for index in 0..self.watchers.len() {
            self.remove(index);
        }
    }
}

/// Filesystem watch plus debouncer for one source
pub struct DebouncedWatch {
    fs: FsWatch,
    debouncer: Debouncer<WatchEvent>,
    state: WatchState,
}

impl fmt::Debug for DebouncedWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedWatch")
            .field("specs", &self.fs.specs)
            .field("delay", &self.debouncer.delay)
            .field("state", &self.state)
            .finish()
    }
}

impl DebouncedWatch {
    /// Install low-level watches for every spec
    ///
    /// Fails if any spec cannot be watched; nothing stays installed then.
    pub fn subscribe(specs: Vec<WatchSpec>, delay: Duration) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut fs = FsWatch::new(specs, tx);

        for index in 0..fs.specs.len() {
            if let Err(e) = fs.install(index) {
                fs.remove_all();
                return Err(e);
            }
        }

        Ok(Self {
            fs,
            debouncer: Debouncer::new(rx, delay),
            state: WatchState::Watching,
        })
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn specs(&self) -> &[WatchSpec] {
        &self.fs.specs
    }

    /// Wait for the next coalesced trigger, or `None` once stopped
    pub async fn next(&mut self, stop: &mut watch::Receiver<bool>) -> Option<Trigger> {
        let burst = self.debouncer.next(stop).await?;
        let trigger = Trigger::from_events(&burst);
        debug!(events = trigger.events, "debounced trigger");
        Some(trigger)
    }

    /// Recreate the low-level watch of each replaced spec that asks for it
    ///
    /// Returns true if any watch was recreated. A spec whose path is gone
    /// stays unwatched and the error is returned after the others are reset.
    pub fn reset_after(&mut self, trigger: &Trigger) -> Result<bool, WatchError> {
        let targets: Vec<usize> = trigger
            .replaced
            .iter()
            .copied()
            .filter(|&i| self.fs.specs.get(i).map_or(false, |s| s.reset_on_trigger))
            .collect();
        if targets.is_empty() {
            return Ok(false);
        }

        self.state = WatchState::Resetting;
        let mut first_error = None;
        for index in targets {
            self.fs.remove(index);
            match self.fs.install(index) {
                Ok(()) => debug!(path = %self.fs.specs[index].path.display(), "watch reset"),
                Err(e) => {
                    warn!(error = %e, "failed to reset watch");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.state = WatchState::Watching;

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Remove every low-level watch; safe to call repeatedly
    pub fn close(&mut self) {
        if self.state != WatchState::Idle {
            self.fs.remove_all();
            self.state = WatchState::Idle;
        }
    }
}

impl Drop for DebouncedWatch {
    fn drop(&mut self) {
        self.close();
    }
}

/// Watch specs covering one file that applications replace via rename
pub fn file_specs(path: &Path) -> Vec<WatchSpec> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut spec = WatchSpec::new(dir, OpMask::ALL).reset_on_trigger();
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        spec = spec.with_name(name);
    }
    vec![spec]
}
