//! Persistent, transactional catalog of paths, their remote segments, and scalar
//! configuration — the single source of truth the [`crate::controller::Controller`] consults
//! and mutates.

mod path;
mod segment;

use std::path::Path as FsPath;

use rusqlite::{params, Connection, OptionalExtension};

pub use path::{PathEntry, PathType};
pub use segment::{RemoteSegment, SegmentEdit};

use crate::error::{Error, Result};

/// Current metadata schema version. Bumping this requires an upgrade path in
/// [`MetadataStore::open`]; none exist yet.
pub const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed implementation of the metadata store described in the core spec.
///
/// Transaction nesting is reference-counted: only the outermost [`MetadataStore::begin`]
/// issues `BEGIN IMMEDIATE`, only the outermost [`MetadataStore::commit`] issues `COMMIT`, and
/// [`MetadataStore::rollback`] always unwinds every level of depth.
pub struct MetadataStore {
    conn: Connection,
    tx_depth: u32,
}

impl MetadataStore {
    /// Open (or create) the metadata database at `db_path`.
    pub fn open(db_path: &FsPath) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = MetadataStore { conn, tx_depth: 0 };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests that don't want a temp file on disk.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = MetadataStore { conn, tx_depth: 0 };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&mut self) -> Result<()> {
        let table_exists: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'config'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        if !table_exists {
            self.create_empty_db()?;
            return Ok(());
        }

        match self.get_config_integer("version")? {
            None => Err(Error::MetadataCorruption("missing config.version row".into())),
            Some(version) if version < SCHEMA_VERSION => {
                Err(Error::MetadataCorruption(format!(
                    "metadata schema version {version} is older than {SCHEMA_VERSION}; no upgrade path implemented"
                )))
            }
            Some(version) if version > SCHEMA_VERSION => Err(Error::MetadataCorruption(format!(
                "metadata schema version {version} is newer than this binary supports ({SCHEMA_VERSION})"
            ))),
            Some(_) => Ok(()),
        }
    }

    fn create_empty_db(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE config (name TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE path (
                 pathId INTEGER PRIMARY KEY,
                 dirname TEXT NOT NULL,
                 basename TEXT NOT NULL,
                 type TEXT NOT NULL,
                 size INTEGER NOT NULL,
                 mode INTEGER NOT NULL,
                 atime INTEGER NOT NULL,
                 mtime INTEGER NOT NULL,
                 isSynced INTEGER NOT NULL,
                 UNIQUE (dirname, basename)
             );
             CREATE TABLE remoteSegment (
                 remoteSegmentId INTEGER PRIMARY KEY,
                 path INTEGER NOT NULL REFERENCES path (pathId),
                 begin INTEGER NOT NULL,
                 end INTEGER NOT NULL
             );
             CREATE INDEX remoteSegment_path_idx ON remoteSegment (path);",
        )?;
        self.set_config("version", &SCHEMA_VERSION.to_string())?;
        Ok(())
    }

    // -- transactions --------------------------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        self.tx_depth += 1;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            return Err(Error::MetadataCorruption("commit with no active transaction".into()));
        }
        self.tx_depth -= 1;
        if self.tx_depth == 0 {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            return Err(Error::MetadataCorruption("rollback with no active transaction".into()));
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.tx_depth = 0;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_depth > 0
    }

    // -- paths -----------------------------------------------------------------------------

    pub fn add_path(
        &self,
        dirname: &str,
        basename: &str,
        path_type: PathType,
        size: u64,
        mode: u32,
        atime: i64,
        mtime: i64,
        is_synced: bool,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO path (dirname, basename, type, size, mode, atime, mtime, isSynced)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                dirname,
                basename,
                path_type.as_str(),
                size as i64,
                mode,
                atime,
                mtime,
                is_synced as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_path_synced(&self, path_id: i64) -> Result<()> {
        self.conn.execute("UPDATE path SET isSynced = 1 WHERE pathId = ?1", params![path_id])?;
        Ok(())
    }

    pub fn get_path(&self, dirname: &str, basename: &str) -> Result<Option<PathEntry>> {
        self.conn
            .query_row(
                "SELECT pathId, dirname, basename, type, size, mode, atime, mtime, isSynced
                 FROM path WHERE dirname = ?1 AND basename = ?2",
                params![dirname, basename],
                Self::row_to_path_entry,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn get_sub_paths(&self, dirname: &str) -> Result<Vec<PathEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT pathId, dirname, basename, type, size, mode, atime, mtime, isSynced
             FROM path WHERE dirname = ?1 AND basename <> ''",
        )?;
        let rows = stmt.query_map(params![dirname], Self::row_to_path_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_path_entry(row: &rusqlite::Row) -> rusqlite::Result<PathEntry> {
        let type_str: String = row.get(3)?;
        let path_type = PathType::from_str(&type_str).unwrap_or(PathType::File);
        let size: i64 = row.get(4)?;
        let is_synced: i64 = row.get(8)?;
        Ok(PathEntry {
            path_id: row.get(0)?,
            dirname: row.get(1)?,
            basename: row.get(2)?,
            path_type,
            size: size as u64,
            mode: row.get(5)?,
            atime: row.get(6)?,
            mtime: row.get(7)?,
            is_synced: is_synced != 0,
        })
    }

    // -- remote segments ---------------------------------------------------------------------

    pub fn add_remote_segment(&self, path_id: i64, begin: u64, end: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO remoteSegment (path, begin, end) VALUES (?1, ?2, ?3)",
            params![path_id, begin as i64, end as i64],
        )?;
        Ok(())
    }

    pub fn get_remote_segments(&self, path_id: i64) -> Result<Vec<RemoteSegment>> {
        let mut stmt = self
            .conn
            .prepare("SELECT remoteSegmentId, begin, end FROM remoteSegment WHERE path = ?1")?;
        let rows = stmt.query_map(params![path_id], Self::row_to_segment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn get_remote_segments_range(
        &self,
        path_id: i64,
        range_begin: u64,
        range_end: u64,
    ) -> Result<Vec<RemoteSegment>> {
        let mut stmt = self.conn.prepare(
            "SELECT remoteSegmentId, begin, end FROM remoteSegment
             WHERE path = ?1 AND begin <= ?2 AND end >= ?3
             ORDER BY begin ASC",
        )?;
        let rows = stmt.query_map(
            params![path_id, range_end as i64, range_begin as i64],
            Self::row_to_segment,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn row_to_segment(row: &rusqlite::Row) -> rusqlite::Result<RemoteSegment> {
        let begin: i64 = row.get(1)?;
        let end: i64 = row.get(2)?;
        Ok(RemoteSegment { segment_id: row.get(0)?, begin: begin as u64, end: end as u64 })
    }

    /// Shrink, split or delete every segment of `path_id` overlapping `[del_begin, del_end]`,
    /// and mark the path synced in the same transaction if no segments remain afterwards.
    pub fn remove_remote_segments(&mut self, path_id: i64, del_begin: u64, del_end: u64) -> Result<()> {
        self.begin()?;
        let result = self.remove_remote_segments_inner(path_id, del_begin, del_end);
        match result {
            Ok(()) => self.commit(),
            Err(err) => {
                let _ = self.rollback();
                Err(err)
            }
        }
    }

    fn remove_remote_segments_inner(&self, path_id: i64, del_begin: u64, del_end: u64) -> Result<()> {
        for segment in self.get_remote_segments_range(path_id, del_begin, del_end)? {
            match SegmentEdit::classify(segment, del_begin, del_end) {
                Some(SegmentEdit::Delete) => {
                    self.conn.execute(
                        "DELETE FROM remoteSegment WHERE remoteSegmentId = ?1",
                        params![segment.segment_id],
                    )?;
                }
                Some(SegmentEdit::Split { left_end, right_begin }) => {
                    self.conn.execute(
                        "UPDATE remoteSegment SET end = ?1 WHERE remoteSegmentId = ?2",
                        params![left_end as i64, segment.segment_id],
                    )?;
                    self.add_remote_segment(path_id, right_begin, segment.end)?;
                }
                Some(SegmentEdit::TruncateEnd { new_end }) => {
                    self.conn.execute(
                        "UPDATE remoteSegment SET end = ?1 WHERE remoteSegmentId = ?2",
                        params![new_end as i64, segment.segment_id],
                    )?;
                }
                Some(SegmentEdit::TruncateBegin { new_begin }) => {
                    self.conn.execute(
                        "UPDATE remoteSegment SET begin = ?1 WHERE remoteSegmentId = ?2",
                        params![new_begin as i64, segment.segment_id],
                    )?;
                }
                None => {
                    return Err(Error::MetadataCorruption(format!(
                        "segment [{},{}] of path {} does not cleanly intersect deletion range [{},{}]",
                        segment.begin, segment.end, path_id, del_begin, del_end
                    )));
                }
            }
        }

        if self.get_remote_segments(path_id)?.is_empty() {
            self.set_path_synced(path_id)?;
        }
        Ok(())
    }

    // -- config ------------------------------------------------------------------------------

    pub fn get_config_string(&self, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM config WHERE name = ?1", params![name], |row| row.get(0))
            .optional()
            .map_err(Error::from)
    }

    pub fn get_config_integer(&self, name: &str) -> Result<Option<i64>> {
        match self.get_config_string(name)? {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::MetadataCorruption(format!("config {name:?} is not an integer: {v:?}"))),
        }
    }

    pub fn set_config(&self, name: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO config (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        if self.tx_depth > 0 {
            tracing::warn!("metadata store dropped with an open transaction; rolling back");
            let _ = self.conn.execute_batch("ROLLBACK");
            self.tx_depth = 0;
        }
    }
}
