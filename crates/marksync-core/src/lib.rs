//! marksync core library
//!
//! This crate keeps bookmarks from several browsers in one deduplicated,
//! tag-merged store and keeps that store in sync while the browsers run.
//!
//! # Architecture
//!
//! - **Tree**: each source's bookmarks as an arena tree with a URL index,
//!   rebuilt per pass and published by swap
//! - **Tiered store**: per-source buffer, shared in-memory cache, and a
//!   durable disk snapshot of the cache
//! - **Debounced watch**: filesystem events coalesced into one trigger per
//!   quiet period
//! - **Module lifecycle**: the per-source state machine tying these together
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = TieredStore::open(config.disk_path())?;
//! let (registry, _errors) = Registry::from_config(&config, &store);
//!
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let statuses = Orchestrator::new(store, registry).run(stop_rx).await;
//! ```
//!
//! # Modules
//!
//! - `config`: Application configuration
//! - `models`: Records, tag sets, and source entries
//! - `tree`: Arena bookmark tree and URL index
//! - `storage`: Buffer, cache, and disk tiers and the merge between them
//! - `watch`: Filesystem watch and debouncer
//! - `lock`: Pre-flight lock check for source files
//! - `source`: Source readers and capability descriptors
//! - `module`: Per-source lifecycle
//! - `registry`: Registered sources
//! - `orchestrator`: Runs every source until shutdown

pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod module;
pub mod orchestrator;
pub mod registry;
pub mod source;
pub mod storage;
pub mod tree;
pub mod watch;

pub use config::{Config, MirrorMode, SourceConfig, SourceKind};
pub use error::{ModuleError, RegistryError, SourceError};
pub use models::{Record, SourceEntry, SourcePull, Tags};
pub use module::{ModuleState, ModuleStats, RunReport, SourceModule};
pub use orchestrator::{Orchestrator, SourceStatus};
pub use registry::Registry;
pub use source::{Capabilities, ChromeJsonReader, SourceDescriptor, SourceReader};
pub use storage::{
    MirrorScheduler, StorageError, SyncReport, SyncStrategy, Tier, TierKind, TieredStore,
};
pub use tree::{BookmarkTree, NodeId, NodeKind, SharedTree};
pub use watch::{DebouncedWatch, Debouncer, OpMask, WatchSpec};
