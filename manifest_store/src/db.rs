use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::StoreError;

/// WAL pages between automatic checkpoints.
const WAL_AUTOCHECKPOINT_PAGES: u32 = 512;

/// Row data needed to serve a read.
pub(crate) struct RecordRow {
    pub inline_value: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub expire_at: Option<f64>,
}

/// A record selected for deletion by a trim pass.
pub(crate) struct DoomedRecord {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

/// Seconds since `UNIX_EPOCH` as a double, the manifest's time representation.
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The manifest database: one row per cached key, configured for write-ahead
/// logging with normal (not full) durability and periodic checkpointing.
pub(crate) struct ManifestDb {
    conn: Connection,
}

impl ManifestDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // journal_mode and wal_autocheckpoint return a result row, so they
        // cannot go through execute()
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.query_row(&format!("PRAGMA wal_autocheckpoint = {WAL_AUTOCHECKPOINT_PAGES}"), [], |_| Ok(()))?;

        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create missing tables/indexes and add any optional column an older
    /// manifest predates.
    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                key                TEXT PRIMARY KEY,
                filename           TEXT,
                size               INTEGER NOT NULL,
                last_access_time   REAL NOT NULL,
                last_modified_time REAL NOT NULL,
                extended           BLOB,
                inline_value       BLOB,
                expire_at          REAL
            );
            CREATE INDEX IF NOT EXISTS idx_records_last_access ON records(last_access_time);",
        )?;

        let mut stmt = self.conn.prepare("PRAGMA table_info(records)")?;
        let present: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        for (column, definition) in [("extended", "BLOB"), ("expire_at", "REAL")] {
            if !present.contains(column) {
                info!("manifest schema missing column {column}, adding");
                self.conn
                    .execute(&format!("ALTER TABLE records ADD COLUMN {column} {definition}"), [])?;
            }
        }
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Option<RecordRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT inline_value, filename, expire_at FROM records WHERE key = ?1",
                params![key],
                |row| {
                    Ok(RecordRow {
                        inline_value: row.get(0)?,
                        filename: row.get(1)?,
                        expire_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Probe a row without loading payload columns. Returns the row's
    /// `expire_at` when present.
    pub fn lookup_meta(&self, key: &str) -> Result<Option<Option<f64>>, StoreError> {
        let row = self
            .conn
            .query_row("SELECT expire_at FROM records WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(row)
    }

    pub fn lookup_filename(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .conn
            .query_row("SELECT filename FROM records WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(row.flatten())
    }

    pub fn upsert_inline(
        &self,
        key: &str,
        bytes: &[u8],
        now: f64,
        expire_at: Option<f64>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO records
             (key, filename, size, last_access_time, last_modified_time, extended, inline_value, expire_at)
             VALUES (?1, NULL, ?2, ?3, ?3, NULL, ?4, ?5)",
            params![key, bytes.len() as i64, now, bytes, expire_at],
        )?;
        Ok(())
    }

    pub fn upsert_sidecar(
        &self,
        key: &str,
        filename: &str,
        size: u64,
        now: f64,
        expire_at: Option<f64>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO records
             (key, filename, size, last_access_time, last_modified_time, extended, inline_value, expire_at)
             VALUES (?1, ?2, ?3, ?4, ?4, NULL, NULL, ?5)",
            params![key, filename, size as i64, now, expire_at],
        )?;
        Ok(())
    }

    pub fn touch(&self, key: &str, now: f64) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE records SET last_access_time = ?1 WHERE key = ?2", params![now, key])?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn delete_all(&self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM records", [])?;
        Ok(())
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        self.conn.execute("VACUUM", [])?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn total_size(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Rows whose TTL has elapsed, capped per trim pass.
    pub fn expired_batch(&self, now: f64, limit: u64) -> Result<Vec<DoomedRecord>, StoreError> {
        self.doomed_query(
            "SELECT key, filename, size FROM records
             WHERE expire_at IS NOT NULL AND expire_at <= ?1 LIMIT ?2",
            params![now, limit as i64],
        )
    }

    /// Rows not accessed since `cutoff`, oldest first, capped per trim pass.
    pub fn aged_batch(&self, cutoff: f64, limit: u64) -> Result<Vec<DoomedRecord>, StoreError> {
        self.doomed_query(
            "SELECT key, filename, size FROM records
             WHERE last_access_time <= ?1 ORDER BY last_access_time ASC LIMIT ?2",
            params![cutoff, limit as i64],
        )
    }

    /// The `n` least recently accessed rows.
    pub fn oldest_batch(&self, n: u64) -> Result<Vec<DoomedRecord>, StoreError> {
        self.doomed_query(
            "SELECT key, filename, size FROM records ORDER BY last_access_time ASC LIMIT ?1",
            params![n as i64],
        )
    }

    /// Least recently accessed rows until the selected sizes accumulate to at
    /// least `excess` bytes.
    pub fn oldest_until(&self, excess: u64) -> Result<Vec<DoomedRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, filename, size FROM records ORDER BY last_access_time ASC")?;
        let mut rows = stmt.query([])?;
        let mut doomed = Vec::new();
        let mut selected = 0u64;
        while selected < excess {
            let Some(row) = rows.next()? else {
                break;
            };
            let size: i64 = row.get(2)?;
            selected += size as u64;
            doomed.push(DoomedRecord {
                key: row.get(0)?,
                filename: row.get(1)?,
                size: size as u64,
            });
        }
        Ok(doomed)
    }

    fn doomed_query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DoomedRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let doomed = stmt
            .query_map(params, |row| {
                Ok(DoomedRecord {
                    key: row.get(0)?,
                    filename: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open_db(dir: &TempDir) -> ManifestDb {
        ManifestDb::open(&dir.path().join("manifest.sqlite3")).unwrap()
    }

    #[test]
    fn test_upsert_lookup_inline() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.upsert_inline("k", b"value", now_secs(), None).unwrap();

        let row = db.lookup("k").unwrap().unwrap();
        assert_eq!(row.inline_value.as_deref(), Some(&b"value"[..]));
        assert!(row.filename.is_none());
        assert!(row.expire_at.is_none());
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.total_size().unwrap(), 5);
    }

    #[test]
    fn test_replace_flips_placement() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let now = now_secs();
        db.upsert_sidecar("k", "abc123", 100, now, None).unwrap();
        db.upsert_inline("k", b"tiny", now, None).unwrap();

        // exactly one of inline_value / filename survives the replace
        let row = db.lookup("k").unwrap().unwrap();
        assert_eq!(row.inline_value.as_deref(), Some(&b"tiny"[..]));
        assert!(row.filename.is_none());
        assert_eq!(db.total_size().unwrap(), 4);
    }

    #[test]
    fn test_expired_and_aged_batches() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let now = now_secs();
        db.upsert_inline("live", b"a", now, Some(now + 100.0)).unwrap();
        db.upsert_inline("dead", b"bb", now, Some(now - 1.0)).unwrap();
        db.upsert_inline("forever", b"ccc", now, None).unwrap();

        let expired = db.expired_batch(now, 512).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "dead");
        assert_eq!(expired[0].size, 2);

        db.touch("forever", now - 50.0).unwrap();
        let aged = db.aged_batch(now - 10.0, 256).unwrap();
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].key, "forever");
    }

    #[test]
    fn test_oldest_until_accumulates() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let now = now_secs();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            db.upsert_inline(key, &[0u8; 10], now + i as f64, None).unwrap();
        }
        let doomed = db.oldest_until(15).unwrap();
        assert_eq!(doomed.len(), 2);
        assert_eq!(doomed[0].key, "a");
        assert_eq!(doomed[1].key, "b");
    }

    #[test]
    fn test_migration_adds_missing_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.sqlite3");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE records (
                    key TEXT PRIMARY KEY,
                    filename TEXT,
                    size INTEGER NOT NULL,
                    last_access_time REAL NOT NULL,
                    last_modified_time REAL NOT NULL,
                    inline_value BLOB
                );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO records (key, filename, size, last_access_time, last_modified_time, inline_value)
                 VALUES ('old', NULL, 1, 0.0, 0.0, x'00')",
                [],
            )
            .unwrap();
        }

        let db = ManifestDb::open(&path).unwrap();
        let row = db.lookup("old").unwrap().unwrap();
        assert!(row.expire_at.is_none());
        db.upsert_inline("new", b"x", now_secs(), Some(now_secs() + 5.0)).unwrap();
        assert!(db.lookup("new").unwrap().unwrap().expire_at.is_some());
    }
}
