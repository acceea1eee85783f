use rusqlite::Connection;
use tracing::warn;

use crate::error::StorageError;
use crate::traits::KeyValueStore;

fn checksum(value: &str) -> [u8; 32] {
    *blake3::hash(value.as_bytes()).as_bytes()
}

/// File-backed key-value storage. Every connection opened on the same path
/// sees the same rows, which is how separate browsing contexts share a cart.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Milliseconds timestamp of the last write to `key`, if present.
    pub fn updated_at(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT updated_at FROM kv_entries WHERE key = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![key], |row| row.get::<_, i64>(0))?;
        match rows.next() {
            Some(Ok(ts)) => Ok(Some(ts)),
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }
}

impl KeyValueStore for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value, checksum FROM kv_entries WHERE key = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![key], |row| {
            let value: String = row.get(0)?;
            let sum: Vec<u8> = row.get(1)?;
            Ok((value, sum))
        })?;

        match rows.next() {
            Some(Ok((value, sum))) => {
                if sum.as_slice() != checksum(&value).as_slice() {
                    warn!(key, "stored value does not match its checksum");
                    return Err(StorageError::ChecksumMismatch {
                        key: key.to_string(),
                    });
                }
                Ok(Some(value))
            }
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO kv_entries (key, value, checksum, updated_at)
             VALUES (?1, ?2, ?3, CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, checksum = excluded.checksum, updated_at = excluded.updated_at",
            rusqlite::params![key, value, &checksum(value)[..]],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr comparison avoids LIKE wildcard escaping in product ids.
        let mut stmt = self.conn.prepare(
            "SELECT key FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(rusqlite::params![prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
