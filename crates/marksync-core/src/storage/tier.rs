//! Keyed record stores: buffer, cache and disk
//!
//! A `Tier` is one SQLite database holding the `bookmarks` table. The buffer
//! is private to a source and lives in memory; the cache is shared by all
//! sources and also lives in memory; the disk tier is a file that mirrors the
//! cache.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::error::{is_constraint_violation, StorageError, StorageResult};
use super::schema::{get_schema_version, init_schema, needs_init, SCHEMA_VERSION};
use crate::models::{now_secs, Record, Tags};

/// Name of the shared cache tier
pub const CACHE_NAME: &str = "memcache";

pub(crate) const SELECT_COLUMNS: &str =
    "SELECT url, metadata, tags, description, modified, flags, module FROM bookmarks";

pub(crate) const INSERT_RECORD: &str = "INSERT INTO bookmarks \
     (url, metadata, tags, description, modified, flags, module) \
     VALUES (?, ?, ?, ?, ?, ?, ?)";

/// Which level of the tiered store a database plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Buffer,
    Cache,
    Disk,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TierKind::Buffer => "buffer",
            TierKind::Cache => "cache",
            TierKind::Disk => "disk",
        };
        f.write_str(name)
    }
}

/// What an upsert did to the target row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// One SQLite-backed record store
pub struct Tier {
    kind: TierKind,
    name: String,
    conn: Connection,
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

impl Tier {
    /// Open a private in-memory buffer for one source
    ///
    /// The name carries a random suffix so several instances of the same
    /// source kind stay distinguishable in logs.
    pub fn open_buffer(source: &str) -> StorageResult<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("buffer_{}_{}", source, &suffix[..8]);
        debug!(buffer = %name, "creating buffer");
        Self::open_in_memory(TierKind::Buffer, name)
    }

    /// Open the in-memory cache tier
    pub fn open_cache() -> StorageResult<Self> {
        Self::open_in_memory(TierKind::Cache, CACHE_NAME.to_string())
    }

    /// Open (or create) the on-disk tier at `path`
    pub fn open_disk(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
            }
        }

        let name = path.display().to_string();
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            tier: TierKind::Disk,
            name: name.clone(),
            source,
        })?;
        Self::with_connection(TierKind::Disk, name, conn)
    }

    fn open_in_memory(kind: TierKind, name: String) -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StorageError::Open {
            tier: kind,
            name: name.clone(),
            source,
        })?;
        Self::with_connection(kind, name, conn)
    }

    fn with_connection(kind: TierKind, name: String, conn: Connection) -> StorageResult<Self> {
        let tier = Self { kind, name, conn };
        tier.ensure_schema()?;
        Ok(tier)
    }

    /// Create the schema if missing and refuse databases from a newer build
    pub(crate) fn ensure_schema(&self) -> StorageResult<()> {
        if let Some(found) = get_schema_version(&self.conn).ok().flatten() {
            if found > SCHEMA_VERSION {
                return Err(StorageError::SchemaVersion {
                    found,
                    current: SCHEMA_VERSION,
                });
            }
        }
        if needs_init(&self.conn) {
            init_schema(&self.conn)?;
        }
        Ok(())
    }

    pub fn kind(&self) -> TierKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Number of records
    pub fn count(&self) -> StorageResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM bookmarks", [], |row| row.get(0))?)
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM bookmarks LIMIT 1")?
            .exists([])?;
        Ok(!exists)
    }

    /// Get the record for a URL
    pub fn get(&self, url: &str) -> StorageResult<Option<Record>> {
        let sql = format!("{SELECT_COLUMNS} WHERE url = ?");
        Ok(self
            .conn
            .query_row(&sql, params![url], record_from_row)
            .optional()?)
    }

    /// All records ordered by URL
    pub fn records(&self) -> StorageResult<Vec<Record>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY url");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Records carrying `tag`
    pub fn records_with_tag(&self, tag: &str) -> StorageResult<Vec<Record>> {
        let wanted: Tags = [tag].into_iter().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{SELECT_COLUMNS} WHERE instr(tags, ?) > 0 ORDER BY url");
        let needle = wanted.to_stored();
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![needle], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Insert a record, or merge it into the existing row for its URL
    ///
    /// Tags are unioned with what is stored; title and description are
    /// replaced. Rows that would not change are left untouched.
    pub fn upsert(&mut self, record: &Record) -> StorageResult<Upsert> {
        let tx = self.conn.transaction()?;
        let outcome = upsert_in(&tx, record)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Upsert a batch of records in one transaction
    pub fn upsert_many<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        for record in records {
            if upsert_in(&tx, record)? != Upsert::Unchanged {
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Remove every record (schema is kept)
    pub fn clear(&mut self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM bookmarks", [])?;
        Ok(())
    }
}

fn upsert_in(tx: &rusqlite::Transaction<'_>, record: &Record) -> StorageResult<Upsert> {
    let inserted = tx.execute(
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

    match inserted {
        Ok(_) => Ok(Upsert::Inserted),
        Err(e) if is_constraint_violation(&e) => {
            let (title, stored_tags, description): (String, String, String) = tx.query_row(
                "SELECT metadata, tags, description FROM bookmarks WHERE url = ?",
                params![record.url],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let tags = Tags::from_stored(&stored_tags).union(&record.tags);
            if title == record.title
                && description == record.description
                && tags.to_stored() == stored_tags
            {
                return Ok(Upsert::Unchanged);
            }

            tx.execute(
                "UPDATE bookmarks SET metadata = ?, tags = ?, description = ?, modified = ? \
                 WHERE url = ?",
                params![
                    record.title,
                    tags.to_stored(),
                    record.description,
                    now_secs().timestamp(),
                    record.url,
                ],
            )?;
            Ok(Upsert::Updated)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let modified: i64 = row.get(4)?;
    let tags: String = row.get(2)?;
    Ok(Record {
        url: row.get(0)?,
        title: row.get(1)?,
        tags: Tags::from_stored(&tags),
        description: row.get(3)?,
        modified: from_unix(modified),
        flags: row.get(5)?,
        module: row.get(6)?,
    })
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}
