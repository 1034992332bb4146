//! SQLite-backed key-value store for durable assistant state.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::helpers::{parse_datetime, parse_schema_version};
use crate::migrations;
use crate::models::StateRecord;

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new database connection
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the connection
    /// fails to open, or migrations fail
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open database connection")?;
        migrations::init_schema(&conn)?;

        log::info!("Database initialized at: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a throwaway in-memory database
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrations::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get default database path
    #[must_use]
    pub fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("hark");
        path.push("hark.db");
        path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection lock poisoned"))
    }

    // ==================== State Record Methods ====================

    /// Insert or replace a raw state record
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails
    pub fn put_record(&self, record: &StateRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state_records (key, schema_version, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                schema_version = excluded.schema_version,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![
                record.key,
                i64::from(record.schema_version),
                record.payload,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a raw state record by key
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored row is corrupted
    pub fn get_record(&self, key: &str) -> Result<Option<StateRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT key, schema_version, payload, updated_at
                 FROM state_records WHERE key = ?1",
                params![key],
                |row| {
                    Ok(StateRecord {
                        key: row.get(0)?,
                        schema_version: parse_schema_version(row.get(1)?)?,
                        payload: row.get(2)?,
                        updated_at: parse_datetime(&row.get::<_, String>(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// List every stored record, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn list_records(&self) -> Result<Vec<StateRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, schema_version, payload, updated_at
             FROM state_records
             ORDER BY updated_at DESC",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(StateRecord {
                    key: row.get(0)?,
                    schema_version: parse_schema_version(row.get(1)?)?,
                    payload: row.get(2)?,
                    updated_at: parse_datetime(&row.get::<_, String>(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Delete a record, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails
    pub fn delete_record(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM state_records WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Serialize `value` as JSON and store it under `key` with its schema version
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the database write fails
    pub fn put_json<T: Serialize>(&self, key: &str, schema_version: u32, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value).context("Failed to serialize state record")?;
        self.put_record(&StateRecord::new(key, schema_version, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_put_and_get_record() {
        let db = Database::open_in_memory().unwrap();
        db.put_record(&StateRecord::new("alpha", 1, "{}".to_string()))
            .unwrap();

        let record = db.get_record("alpha").unwrap().unwrap();
        assert_eq!(record.key, "alpha");
        assert_eq!(record.schema_version, 1);
        assert_eq!(record.payload, "{}");
    }

    #[test]
    fn test_put_record_overwrites_existing_key() {
        let db = Database::open_in_memory().unwrap();
        db.put_record(&StateRecord::new("alpha", 1, "\"old\"".to_string()))
            .unwrap();
        db.put_record(&StateRecord::new("alpha", 2, "\"new\"".to_string()))
            .unwrap();

        let records = db.list_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].schema_version, 2);
        assert_eq!(records[0].payload, "\"new\"");
    }

    #[test]
    fn test_missing_record_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_record("nothing").unwrap().is_none());
    }

    #[test]
    fn test_json_roundtrip_keeps_version() {
        let db = Database::open_in_memory().unwrap();
        let sample = Sample {
            name: "context".to_string(),
            count: 3,
        };
        db.put_json("sample", 7, &sample).unwrap();

        let record = db.get_record("sample").unwrap().unwrap();
        assert_eq!(record.schema_version, 7);
        assert_eq!(record.decode::<Sample>().unwrap(), sample);
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.put_record(&StateRecord::new("broken", 1, "not json".to_string()))
            .unwrap();
        let record = db.get_record("broken").unwrap().unwrap();
        assert_eq!(record.payload_len(), 8);
        assert!(record.decode::<Sample>().is_err());
    }

    #[test]
    fn test_delete_record() {
        let db = Database::open_in_memory().unwrap();
        db.put_record(&StateRecord::new("gone", 1, "1".to_string()))
            .unwrap();
        assert!(db.delete_record("gone").unwrap());
        assert!(!db.delete_record("gone").unwrap());
    }

    #[test]
    fn test_file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hark.db");

        {
            let db = Database::new(Some(path.clone())).unwrap();
            db.put_record(&StateRecord::new("kept", 1, "42".to_string()))
                .unwrap();
        }

        let db = Database::new(Some(path)).unwrap();
        let record = db.get_record("kept").unwrap().unwrap();
        assert_eq!(record.payload, "42");
    }
}
