//! SQLite-backed visitor store.
//!
//! One row per visitor. Reference embeddings are stored as a JSON array of
//! arrays; timestamps as Unix nanoseconds so reloads are exact.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use revisit_core::{Embedding, VisitorId, VisitorRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::{StoreError, VisitorStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS visitors (
    id            INTEGER PRIMARY KEY,
    display_name  TEXT    NOT NULL,
    embeddings    TEXT    NOT NULL,
    visit_count   INTEGER NOT NULL CHECK (visit_count >= 1),
    first_seen_ns INTEGER NOT NULL,
    last_seen_ns  INTEGER NOT NULL CHECK (last_seen_ns >= first_seen_ns)
);
CREATE INDEX IF NOT EXISTS idx_visitors_seen ON visitors (first_seen_ns, last_seen_ns);
";

const SELECT_COLUMNS: &str =
    "SELECT id, display_name, embeddings, visit_count, first_seen_ns, last_seen_ns FROM visitors";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal, "opened visitor database");
        Self::init(conn)
    }

    /// Volatile database, lost when the store is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl VisitorStore for SqliteStore {
    fn get(&self, id: VisitorId) -> Result<Option<VisitorRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id_to_sql(id)?],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn put(&self, record: &VisitorRecord) -> Result<(), StoreError> {
        let embeddings = serde_json::to_string(&record.embeddings)?;
        let first_seen = ts_to_sql(record.first_seen)?;
        let last_seen = ts_to_sql(record.last_seen)?;
        let id = id_to_sql(record.id)?;

        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO visitors (id, display_name, embeddings, visit_count, first_seen_ns, last_seen_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 display_name  = excluded.display_name,
                 embeddings    = excluded.embeddings,
                 visit_count   = excluded.visit_count,
                 first_seen_ns = excluded.first_seen_ns,
                 last_seen_ns  = excluded.last_seen_ns",
            params![
                id,
                record.display_name,
                embeddings,
                record.visit_count,
                first_seen,
                last_seen
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<VisitorRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))?;
        let rows = stmt.query_map([], RawRow::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

/// Column values as read, before decoding.
struct RawRow {
    id: i64,
    display_name: String,
    embeddings: String,
    visit_count: u32,
    first_seen_ns: i64,
    last_seen_ns: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            embeddings: row.get(2)?,
            visit_count: row.get(3)?,
            first_seen_ns: row.get(4)?,
            last_seen_ns: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<VisitorRecord, StoreError> {
        let embeddings: Vec<Embedding> = serde_json::from_str(&self.embeddings)?;
        Ok(VisitorRecord {
            id: VisitorId(u64::try_from(self.id).map_err(|_| StoreError::OutOfRange("visitor id"))?),
            display_name: self.display_name,
            embeddings,
            visit_count: self.visit_count,
            first_seen: DateTime::from_timestamp_nanos(self.first_seen_ns),
            last_seen: DateTime::from_timestamp_nanos(self.last_seen_ns),
        })
    }
}

fn id_to_sql(id: VisitorId) -> Result<i64, StoreError> {
    i64::try_from(id.0).map_err(|_| StoreError::OutOfRange("visitor id"))
}

fn ts_to_sql(ts: DateTime<Utc>) -> Result<i64, StoreError> {
    ts.timestamp_nanos_opt()
        .ok_or(StoreError::OutOfRange("timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(id: u64, refs: usize) -> VisitorRecord {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        VisitorRecord {
            id: VisitorId(id),
            display_name: format!("visitor-{id}"),
            embeddings: (0..refs)
                .map(|i| Embedding::new(vec![0.1 * i as f32, 1.0 / 3.0, -2.5e-7]))
                .collect(),
            visit_count: 3,
            first_seen: first,
            last_seen: first + Duration::hours(2),
        }
    }

    #[test]
    fn test_put_get_exact() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = record(42, 3);
        store.put(&r).unwrap();
        assert_eq!(store.get(VisitorId(42)).unwrap(), Some(r));
        assert_eq!(store.get(VisitorId(43)).unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut r = record(1, 1);
        store.put(&r).unwrap();
        r.visit_count = 4;
        r.display_name = "Alice".into();
        store.put(&r).unwrap();

        let all = store.scan().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].visit_count, 4);
        assert_eq!(all[0].display_name, "Alice");
    }

    #[test]
    fn test_schema_rejects_zero_visits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut r = record(1, 1);
        r.visit_count = 0;
        assert!(matches!(store.put(&r), Err(StoreError::Sqlite(_))));
        assert!(store.scan().unwrap().is_empty());
    }

    #[test]
    fn test_id_out_of_range() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = record(u64::MAX, 1);
        assert!(matches!(store.put(&r), Err(StoreError::OutOfRange(_))));
    }

    #[test]
    fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("visitors.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&record(2, 2)).unwrap();
            store.put(&record(1, 1)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let all = store.scan().unwrap();
        assert_eq!(all, vec![record(1, 1), record(2, 2)]);
    }
}
