use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Handle to the SQLite task store.
///
/// rusqlite connections are not `Sync`, so the single connection sits behind
/// a parking_lot mutex and every access goes through [`Database::with_conn`].
/// Clones share the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open the store at `path`, creating the file and any missing parent
    /// directories on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let db = Self::from_connection(Connection::open(path)?, path.to_owned())?;
        info!(path = %path.display(), "task store opened");
        Ok(db)
    }

    /// Private in-memory store, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        conn.execute_batch(schema::CREATE_TABLES)?;

        // Version stamp lives in the SQLite header, not a table.
        let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version == 0 {
            conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
        } else if version != schema::SCHEMA_VERSION {
            return Err(StoreError::Database(format!(
                "unsupported schema version {version} (expected {})",
                schema::SCHEMA_VERSION
            )));
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_reports_sentinel_path() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn user_version_stamped_on_create() {
        let db = Database::in_memory().unwrap();
        let version: u32 = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn task_and_machine_tables_exist() {
        let db = Database::in_memory().unwrap();
        for table in ["tasks", "machines"] {
            let count: u32 = db
                .with_conn(|conn| {
                    Ok(conn.query_row(
                        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [table],
                        |row| row.get(0),
                    )?)
                })
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn reopening_a_file_store_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("drover-store-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("test.db");

        let first = Database::open(&path).unwrap();
        assert!(path.exists());
        drop(first);
        Database::open(&path).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
