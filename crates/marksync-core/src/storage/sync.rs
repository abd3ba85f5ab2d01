//! Moving records between tiers
//!
//! `sync_to` merges one tier into another. When the destination is empty the
//! whole database is copied with the SQLite backup API; otherwise records go
//! through a two-phase insert/update so that concurrent writers only ever
//! race on the URL uniqueness constraint.
//!
//! The disk tier is never merged into. It is replaced as a whole snapshot of
//! the cache, written to a temporary file and renamed into place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::{Backup, Progress};
use rusqlite::{params, DatabaseName};
use tracing::{debug, info, warn};

use super::error::{is_constraint_violation, StorageError, StorageResult};
use super::tier::{record_from_row, Tier, INSERT_RECORD, SELECT_COLUMNS};
use crate::models::{now_secs, Record, Tags};

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 256;

/// How a sync moved its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Nothing to move
    Noop,
    /// Whole-database copy into an empty destination
    BulkCopy,
    /// Row-by-row insert with conflict resolution
    Merge,
}

/// Outcome of one `sync_to` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub strategy: SyncStrategy,
    /// Rows that did not exist in the destination
    pub inserted: usize,
    /// Existing rows that were rewritten with merged tags or new metadata
    pub merged: usize,
    /// Existing rows already carrying everything the source had
    pub unchanged: usize,
}

impl SyncReport {
    fn new(strategy: SyncStrategy) -> Self {
        Self {
            strategy,
            inserted: 0,
            merged: 0,
            unchanged: 0,
        }
    }

    /// Whether the destination changed
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.merged > 0
    }
}

/// Merge every record of `src` into `dst`
///
/// Phase one inserts each record in a single transaction; uniqueness
/// violations are collected instead of aborting. Phase two, in a second
/// transaction, rewrites each conflicting row with the union of both tag
/// sets, the incoming title and description, and a fresh modification time.
/// Rows the merge would not change are skipped, so repeating a sync leaves
/// the destination byte-identical.
pub fn sync_to(src: &Tier, dst: &mut Tier) -> StorageResult<SyncReport> {
    if src.is_empty()? {
        debug!(src = src.name(), dst = dst.name(), "nothing to sync");
        return Ok(SyncReport::new(SyncStrategy::Noop));
    }

    if dst.is_empty()? {
        return bulk_copy(src, dst);
    }

    let records = src.records()?;
    let mut report = SyncReport::new(SyncStrategy::Merge);
    let mut conflicts = Vec::new();

    {
        let tx = dst.connection_mut().transaction()?;
        for record in records {
            let result = tx.execute(
                INSERT_RECORD,
                params![
                    record.url,
                    record.title,
                    record.tags.to_stored(),
                    record.description,
                    record.modified.timestamp(),
                    record.flags,
                    record.module,
                ],
            );
            match result {
                Ok(_) => report.inserted += 1,
                Err(e) if is_constraint_violation(&e) => conflicts.push(record),
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit()?;
    }

    if !conflicts.is_empty() {
        let tx = dst.connection_mut().transaction()?;
        let select = format!("{SELECT_COLUMNS} WHERE url = ?");
        for incoming in &conflicts {
            let existing = tx.query_row(&select, params![incoming.url], record_from_row)?;
            match merged_record(&existing, incoming) {
                Some(merged) => {
                    tx.execute(
                        "UPDATE bookmarks SET metadata = ?, tags = ?, description = ?, \
                         modified = ?, flags = ? WHERE url = ?",
                        params![
                            merged.title,
                            merged.tags.to_stored(),
                            merged.description,
                            merged.modified.timestamp(),
                            merged.flags,
                            merged.url,
                        ],
                    )?;
                    report.merged += 1;
                }
                None => report.unchanged += 1,
            }
        }
        tx.commit()?;
    }

    debug!(
        src = src.name(),
        dst = dst.name(),
        inserted = report.inserted,
        merged = report.merged,
        unchanged = report.unchanged,
        "merged tiers"
    );
    Ok(report)
}

/// The row to write back for a conflicting record, or `None` if nothing changes
///
/// An empty incoming description keeps the stored one, since most browsers
/// have no notion of descriptions and would otherwise erase them.
fn merged_record(existing: &Record, incoming: &Record) -> Option<Record> {
    let tags: Tags = existing.tags.union(&incoming.tags);
    let description = if incoming.description.is_empty() {
        existing.description.clone()
    } else {
        incoming.description.clone()
    };

    if tags == existing.tags
        && incoming.title == existing.title
        && description == existing.description
        && incoming.flags == existing.flags
    {
        return None;
    }

    Some(Record {
        url: existing.url.clone(),
        title: incoming.title.clone(),
        tags,
        description,
        modified: now_secs(),
        flags: incoming.flags,
        module: existing.module.clone(),
    })
}

fn bulk_copy(src: &Tier, dst: &mut Tier) -> StorageResult<SyncReport> {
    let count = src.count()?;
    let from = src.name().to_string();
    let to = dst.name().to_string();

    let backup = Backup::new(src.connection(), dst.connection_mut()).map_err(|source| {
        StorageError::Mirror {
            from: from.clone(),
            to: PathBuf::from(&to),
            source,
        }
    })?;
    backup
        .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)
        .map_err(|source| StorageError::Mirror {
            from: from.clone(),
            to: PathBuf::from(&to),
            source,
        })?;

    debug!(src = %from, dst = %to, records = count, "bulk copied into empty tier");
    let mut report = SyncReport::new(SyncStrategy::BulkCopy);
    report.inserted = usize::try_from(count).unwrap_or_default();
    Ok(report)
}

/// Replace the disk tier at `path` with a snapshot of `cache`
///
/// The snapshot is written next to the target and renamed over it, so a
/// crash leaves either the previous mirror or the new one on disk.
pub fn mirror_to_disk(cache: &Tier, path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }
    }

    let tmp = temp_path(path);
    if tmp.exists() {
        std::fs::remove_file(&tmp).map_err(|e| StorageError::from_io(e, tmp.clone()))?;
    }

    if let Err(source) = cache
        .connection()
        .backup(DatabaseName::Main, &tmp, None)
    {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::Mirror {
            from: cache.name().to_string(),
            to: path.to_path_buf(),
            source,
        });
    }

    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StorageError::AtomicWriteFailed {
            from: tmp.clone(),
            to: path.to_path_buf(),
            source: e,
        }
    })?;

    info!(path = %path.display(), "mirrored cache to disk");
    Ok(())
}

/// Load the disk tier at `path` into `cache`, replacing its contents
///
/// Returns false when there is no disk tier yet.
pub fn restore_from_disk(path: &Path, cache: &mut Tier) -> StorageResult<bool> {
    if !path.exists() {
        return Ok(false);
    }

    let name = cache.name().to_string();
    cache
        .connection_mut()
        .restore(DatabaseName::Main, path, None::<fn(Progress)>)
        .map_err(|source| StorageError::Mirror {
            from: path.display().to_string(),
            to: PathBuf::from(&name),
            source,
        })?;

    if let Err(e) = cache.ensure_schema() {
        warn!(path = %path.display(), error = %e, "disk tier schema rejected");
        cache.clear().ok();
        return Err(e);
    }

    info!(path = %path.display(), records = cache.count()?, "restored cache from disk");
    Ok(true)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn buffer_with(records: &[Record]) -> Tier {
        let mut buffer = Tier::open_buffer("test").unwrap();
        buffer.upsert_many(records).unwrap();
        buffer
    }

    fn dump(tier: &Tier) -> Vec<(String, String, String, String, i64)> {
        tier.connection()
            .prepare("SELECT url, metadata, tags, description, modified FROM bookmarks ORDER BY url")
            .unwrap()
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_empty_source_is_noop() {
        let buffer = Tier::open_buffer("test").unwrap();
        let mut cache = Tier::open_cache().unwrap();

        let report = sync_to(&buffer, &mut cache).unwrap();
        assert_eq!(report.strategy, SyncStrategy::Noop);
        assert!(!report.changed());
    }

    #[test]
    fn test_empty_destination_uses_bulk_copy() {
        let buffer = buffer_with(&[
            Record::new("https://a.com").with_tags(["x"]),
            Record::new("https://b.com"),
        ]);
        let mut cache = Tier::open_cache().unwrap();

        let report = sync_to(&buffer, &mut cache).unwrap();
        assert_eq!(report.strategy, SyncStrategy::BulkCopy);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.merged, 0);
        assert_eq!(dump(&cache), dump(&buffer));
    }

    #[test]
    fn test_conflict_unions_tags() {
        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_tags(["x"]))
            .unwrap();

        let buffer = buffer_with(&[Record::new("https://a.com").with_tags(["z"])]);
        let report = sync_to(&buffer, &mut cache).unwrap();

        assert_eq!(report.strategy, SyncStrategy::Merge);
        assert_eq!(report.merged, 1);
        let stored = cache.get("https://a.com").unwrap().unwrap();
        assert_eq!(stored.tags.to_stored(), ",x,z,");
        assert_eq!(cache.count().unwrap(), 1);
    }

    #[test]
    fn test_merge_inserts_new_and_merges_existing() {
        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_tags(["x"]))
            .unwrap();

        let buffer = buffer_with(&[
            Record::new("https://a.com").with_tags(["y"]),
            Record::new("https://b.com").with_tags(["y"]),
        ]);
        let report = sync_to(&buffer, &mut cache).unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.merged, 1);
        assert_eq!(cache.count().unwrap(), 2);
    }

    #[test]
    fn test_repeat_sync_is_byte_identical() {
        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_tags(["x"]))
            .unwrap();
        let buffer = buffer_with(&[
            Record::new("https://a.com").with_tags(["y"]),
            Record::new("https://b.com"),
        ]);

        sync_to(&buffer, &mut cache).unwrap();
        let first = dump(&cache);

        let report = sync_to(&buffer, &mut cache).unwrap();
        assert!(!report.changed());
        assert_eq!(report.unchanged, 2);
        assert_eq!(dump(&cache), first);
    }

    #[test]
    fn test_tags_never_shrink() {
        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_tags(["x", "y"]))
            .unwrap();

        let buffer = buffer_with(&[Record::new("https://a.com")]);
        sync_to(&buffer, &mut cache).unwrap();

        let stored = cache.get("https://a.com").unwrap().unwrap();
        assert!(stored.tags.contains("x"));
        assert!(stored.tags.contains("y"));
    }

    #[test]
    fn test_empty_description_keeps_stored_one() {
        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_description("notes"))
            .unwrap();

        let buffer = buffer_with(&[Record::new("https://a.com").with_title("A")]);
        sync_to(&buffer, &mut cache).unwrap();

        let stored = cache.get("https://a.com").unwrap().unwrap();
        assert_eq!(stored.description, "notes");
        assert_eq!(stored.title, "A");
    }

    #[test]
    fn test_mirror_and_restore() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("marksync.db");

        let mut cache = Tier::open_cache().unwrap();
        cache
            .upsert(&Record::new("https://a.com").with_tags(["x"]))
            .unwrap();
        mirror_to_disk(&cache, &path).unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());

        let disk = Tier::open_disk(&path).unwrap();
        assert_eq!(dump(&disk), dump(&cache));

        let mut fresh = Tier::open_cache().unwrap();
        assert!(restore_from_disk(&path, &mut fresh).unwrap());
        assert_eq!(dump(&fresh), dump(&cache));
    }

    #[test]
    fn test_mirror_replaces_previous_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("marksync.db");

        let mut cache = Tier::open_cache().unwrap();
        cache.upsert(&Record::new("https://a.com")).unwrap();
        mirror_to_disk(&cache, &path).unwrap();

        cache.upsert(&Record::new("https://b.com")).unwrap();
        mirror_to_disk(&cache, &path).unwrap();

        let disk = Tier::open_disk(&path).unwrap();
        assert_eq!(disk.count().unwrap(), 2);
    }

    #[test]
    fn test_restore_missing_disk_tier() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = Tier::open_cache().unwrap();
        let restored = restore_from_disk(&temp_dir.path().join("none.db"), &mut cache).unwrap();
        assert!(!restored);
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/data/marksync.db"));
        assert_eq!(tmp, PathBuf::from("/data/marksync.db.tmp"));
    }
}
