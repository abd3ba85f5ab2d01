//! End-to-end behaviour of several sources sharing one store

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

use marksync_core::storage::sync_to;
use marksync_core::{
    BookmarkTree, Capabilities, Debouncer, ModuleState, Record, SourceDescriptor,
    SourceEntry, SourceError, SourceModule, SourcePull, SourceReader, SyncStrategy, Tags, Tier,
    TieredStore,
};

/// Reader that replays queued pulls
#[derive(Debug, Clone, Default)]
struct Replay {
    path: PathBuf,
    pulls: Arc<Mutex<VecDeque<SourcePull>>>,
}

impl Replay {
    fn push(&self, entries: Vec<SourceEntry>) {
        self.pulls.lock().unwrap().push_back(SourcePull::full(entries));
    }
}

impl SourceReader for Replay {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, _since: Option<DateTime<Utc>>) -> Result<SourcePull, SourceError> {
        self.pulls
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SourceError::Unavailable {
                path: self.path.clone(),
                reason: "nothing queued".to_string(),
            })
    }
}

struct Harness {
    dir: TempDir,
    store: TieredStore,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = TieredStore::open(dir.path().join("marksync.db")).unwrap();
        Self { dir, store }
    }

    fn source(&self, id: &str) -> (SourceModule, Replay) {
        let reader = Replay {
            path: self.dir.path().join(id),
            ..Replay::default()
        };
        let descriptor = SourceDescriptor::new(id, "replay").with_capabilities(Capabilities {
            watch: false,
            ..Capabilities::default()
        });
        let module = SourceModule::new(descriptor, Box::new(reader.clone()), self.store.clone());
        (module, reader)
    }

    fn record(&self, url: &str) -> Record {
        self.store.cache_get(url).unwrap().unwrap()
    }
}

fn entry(url: &str, tags: &[&str]) -> SourceEntry {
    SourceEntry::new(url, url).tagged(tags.iter().copied())
}

fn tags_of(record: &Record) -> Vec<String> {
    record.tags.iter().map(str::to_string).collect()
}

#[test]
fn test_tag_added_later_is_unioned() {
    let h = Harness::new();
    let (mut a, feed_a) = h.source("a");
    let (mut b, feed_b) = h.source("b");

    feed_a.push(vec![entry("https://u.test/", &["x"])]);
    feed_b.push(vec![entry("https://other.test/", &["y"])]);
    for m in [&mut a, &mut b] {
        m.provision().unwrap();
        m.init().unwrap();
        m.load().unwrap();
    }
    let before_b = h.record("https://other.test/");

    feed_a.push(vec![entry("https://u.test/", &["z"])]);
    a.run().unwrap();

    assert_eq!(tags_of(&h.record("https://u.test/")), vec!["x", "z"]);
    assert_eq!(h.record("https://other.test/"), before_b);
}

#[test]
fn test_same_url_from_two_sources() {
    let h = Harness::new();
    let (mut a, feed_a) = h.source("a");
    let (mut b, feed_b) = h.source("b");

    feed_a.push(vec![entry("https://shared.test/", &["a"])]);
    feed_b.push(vec![entry("https://shared.test/", &["b"])]);
    for m in [&mut a, &mut b] {
        m.provision().unwrap();
        m.init().unwrap();
        m.load().unwrap();
    }

    assert_eq!(h.store.cache_count().unwrap(), 1);
    assert_eq!(tags_of(&h.record("https://shared.test/")), vec!["a", "b"]);
}

#[test]
fn test_first_sync_into_empty_cache_is_bulk_copy() {
    let mut buffer = Tier::open_buffer("bulk").unwrap();
    let records: Vec<Record> = (0..1000)
        .map(|i| Record::new(format!("https://site{}.test/", i)).with_tags(["bulk"]))
        .collect();
    assert_eq!(buffer.upsert_many(&records).unwrap(), 1000);

    let mut cache = Tier::open_cache().unwrap();
    let report = sync_to(&buffer, &mut cache).unwrap();

    assert_eq!(report.strategy, SyncStrategy::BulkCopy);
    assert_eq!(report.merged, 0);
    assert_eq!(cache.count().unwrap(), 1000);
}

#[test]
fn test_unchanged_source_leaves_store_untouched() {
    let h = Harness::new();
    let (mut a, feed) = h.source("a");
    let entries = vec![
        entry("https://one.test/", &["x"]),
        entry("https://two.test/", &["y"]),
    ];

    feed.push(entries.clone());
    a.provision().unwrap();
    a.init().unwrap();
    a.load().unwrap();
    let first = h.store.cache_records().unwrap();
    let disk_before = std::fs::read(h.store.disk_path()).unwrap();

    feed.push(entries);
    let report = a.run().unwrap();

    assert!(!report.sync.changed());
    assert_eq!(h.store.cache_records().unwrap(), first);
    assert_eq!(std::fs::read(h.store.disk_path()).unwrap(), disk_before);
}

#[test]
fn test_tags_never_shrink() {
    let h = Harness::new();
    let (mut a, feed) = h.source("a");

    feed.push(vec![entry("https://u.test/", &["x", "y"])]);
    a.provision().unwrap();
    a.init().unwrap();
    a.load().unwrap();

    let first = h.record("https://u.test/").tags;

    // the source drops every tag
    feed.push(vec![entry("https://u.test/", &[])]);
    a.run().unwrap();
    assert_eq!(tags_of(&h.record("https://u.test/")), vec!["x", "y"]);

    // and the URL itself; the cache keeps it
    feed.push(vec![entry("https://new.test/", &[])]);
    a.run().unwrap();
    assert_eq!(h.store.cache_count().unwrap(), 2);
    assert_eq!(tags_of(&h.record("https://u.test/")), vec!["x", "y"]);

    // a later pass can only add
    feed.push(vec![entry("https://u.test/", &["w"])]);
    a.run().unwrap();
    let last = h.record("https://u.test/").tags;
    assert!(last.is_superset(&first));
    assert!(!first.is_superset(&last));
}

#[test]
fn test_concurrent_merges_union_tags() {
    const ROUNDS: usize = 20;
    const PASSES: usize = 10;
    let url = "https://contended.test/";

    // every round starts from an empty cache so the first merges race to bulk copy
    for _ in 0..ROUNDS {
        let h = Harness::new();
        let start = Arc::new(Barrier::new(2));

        let workers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let store = h.store.clone();
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let mut buffer = Tier::open_buffer(name).unwrap();
                    start.wait();
                    for pass in 0..PASSES {
                        let record = Record::new(url)
                            .with_tags([name.to_string(), format!("{name}{pass}")])
                            .with_module(name);
                        buffer.upsert(&record).unwrap();
                        store.merge_buffer(&buffer).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(h.store.cache_count().unwrap(), 1);
        let tags = h.record(url).tags;
        let mut expected: Tags = ["a", "b"].into_iter().collect();
        for pass in 0..PASSES {
            expected.insert(format!("a{pass}"));
            expected.insert(format!("b{pass}"));
        }
        assert_eq!(tags, expected);

        // the disk mirror saw the final state
        let reopened = TieredStore::open(h.store.disk_path()).unwrap();
        assert_eq!(reopened.cache_records().unwrap(), h.store.cache_records().unwrap());
    }
}

#[test]
fn test_url_in_many_contexts_is_one_node() {
    let h = Harness::new();
    let (mut a, feed) = h.source("a");
    let url = "https://dup.test/";

    feed.push(vec![
        SourceEntry::new(url, "dup").in_folder(["Work"]),
        SourceEntry::new(url, "dup").in_folder(["Reading", "Later"]),
        SourceEntry::new(url, "dup").tagged(["rust"]),
    ]);
    a.provision().unwrap();
    a.init().unwrap();
    a.load().unwrap();

    let tree = a.tree().snapshot();
    assert_eq!(tree.url_count(), 1);
    assert!(tree.index_is_consistent());
    assert_eq!(a.buffer().unwrap().count().unwrap(), 1);
    assert_eq!(
        tags_of(&h.record(url)),
        vec!["Later", "Reading", "Work", "rust"]
    );
    assert_eq!(a.state(), ModuleState::Loaded);
}

#[test]
fn test_tree_swap_keeps_old_snapshot() {
    let h = Harness::new();
    let (mut a, feed) = h.source("a");

    feed.push(vec![entry("https://old.test/", &[])]);
    a.provision().unwrap();
    a.init().unwrap();
    a.load().unwrap();
    let held: Arc<BookmarkTree> = a.tree().snapshot();

    feed.push(vec![entry("https://new.test/", &[])]);
    a.run().unwrap();

    assert!(held.lookup("https://old.test/").is_some());
    assert!(held.lookup("https://new.test/").is_none());
    assert!(a.tree().snapshot().lookup("https://new.test/").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_events_triggers_once() {
    let (tx, rx) = mpsc::unbounded_channel();
    let (_stop_tx, mut stop) = watch::channel(false);
    let mut debouncer = Debouncer::new(rx, Duration::from_millis(1500));

    let sender = tokio::spawn(async move {
        for i in 0..10 {
            tx.send(i).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // keep the channel open past the quiet period
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(tx);
    });

    let started = tokio::time::Instant::now();
    let burst = debouncer.next(&mut stop).await.unwrap();
    assert_eq!(burst, (0..10).collect::<Vec<_>>());
    // last event at 900ms plus the quiet period
    assert!(started.elapsed() >= Duration::from_millis(2400));

    assert!(debouncer.next(&mut stop).await.is_none());
    sender.await.unwrap();
}
