//! SQLite key-value backend.

use crate::store::{KeyValue, KvError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Key-value table in a SQLite database. Iteration follows insertion order;
/// overwriting a key keeps its position.
pub struct SqliteKv {
    conn: Connection,
}

impl SqliteKv {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KvError::Backend(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).map_err(read_error)?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::init(Connection::open_in_memory().map_err(read_error)?)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(SCHEMA_SQL).map_err(read_error)?;
        Ok(Self { conn })
    }
}

fn read_error(e: rusqlite::Error) -> KvError {
    KvError::Backend(e.to_string())
}

fn write_error(e: rusqlite::Error) -> KvError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => KvError::Full(e.to_string()),
        _ => KvError::Backend(e.to_string()),
    }
}

impl KeyValue for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(read_error)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, KvError> {
        let deleted = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(write_error)?;
        Ok(deleted > 0)
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv ORDER BY rowid")
            .map_err(read_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(read_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(read_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvLabelStore, LabelRecord, LabelStore, StoreError};
    use crate::types::{Descriptor, Sample};
    use chrono::DateTime;

    #[test]
    fn test_roundtrip_and_order() {
        let mut kv = SqliteKv::open_in_memory().unwrap();
        kv.set("b", "1").unwrap();
        kv.set("a", "2").unwrap();
        kv.set("b", "3").unwrap();
        assert_eq!(kv.keys().unwrap(), vec!["b", "a"]);
        assert_eq!(kv.get("b").unwrap().as_deref(), Some("3"));
        assert_eq!(kv.get("missing").unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let mut kv = SqliteKv::open_in_memory().unwrap();
        kv.set("a", "1").unwrap();
        assert!(kv.remove("a").unwrap());
        assert!(!kv.remove("a").unwrap());
    }

    #[test]
    fn test_full_database_is_storage_quota() {
        let kv = SqliteKv::open_in_memory().unwrap();
        let pages: i64 = kv
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap();
        let capped: i64 = kv
            .conn
            .query_row(&format!("PRAGMA max_page_count = {pages}"), [], |row| row.get(0))
            .unwrap();
        assert_eq!(capped, pages);

        let mut store = KvLabelStore::new(kv);
        let record = LabelRecord {
            label: "Alice".into(),
            samples: (0..64)
                .map(|i| {
                    Sample::new(
                        vec![],
                        Descriptor::new(vec![0.123_456; 128]),
                        DateTime::from_timestamp_millis(i).unwrap(),
                    )
                })
                .collect(),
            collected_at: DateTime::from_timestamp_millis(0).unwrap(),
        };
        let err = store.put(&record).unwrap_err();
        assert!(matches!(err, StoreError::StorageQuota { .. }), "got {err:?}");
        assert!(matches!(store.get("Alice"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("facekeep-sqlite-{}", std::process::id()));
        let path = dir.join("nested").join("faces.db");
        let mut kv = SqliteKv::open(&path).unwrap();
        kv.set("k", "v").unwrap();
        drop(kv);
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
