use anyhow::Result;
use rusqlite::Connection;

/// Newest on-disk layout this build knows how to create.
pub const CURRENT_SCHEMA: i32 = 1;

/// Initialize database schema
///
/// # Errors
///
/// Returns an error if table creation fails or the file was written by a
/// newer build with an unknown layout
pub fn init_schema(conn: &Connection) -> Result<()> {
    let on_disk: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if on_disk > CURRENT_SCHEMA {
        anyhow::bail!(
            "Database schema version {on_disk} is newer than supported version {CURRENT_SCHEMA}"
        );
    }

    // State records - versioned key-value snapshots (conversation context, reminders)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS state_records (
            key TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_state_records_updated ON state_records(updated_at)",
        [],
    )?;

    if on_disk < CURRENT_SCHEMA {
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA)?;
        log::info!("Migrated database schema from version {on_disk} to {CURRENT_SCHEMA}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA);
    }

    #[test]
    fn test_init_schema_refuses_newer_layout() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA + 1)
            .unwrap();
        assert!(init_schema(&conn).is_err());
    }
}
