use std::path::Path;
use std::time::Duration;

use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::CatMergeError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Tables whose contents the engine reads or writes. Used for checksums.
const ENGINE_TABLES: [&str; 11] = [
    "containers",
    "items",
    "ownerships",
    "wishlists",
    "listings",
    "price_cache",
    "pending_review_images",
    "migration_logs",
    "migration_log_items",
    "dedup_logs",
    "dedup_log_entries",
];

/// Owns the connection pool. Passed explicitly to every operation; there is no global instance.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

    pub fn open(db_path: &Path, busy_timeout_ms: u64) -> Result<Self, CatMergeError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(CatMergeError::Validation(format!(
                    "Database folder '{}' does not exist or is not a directory",
                    parent.display()
                )));
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(move |c| Self::init_connection(c, busy_timeout_ms));
        let pool = Pool::builder().max_size(4).build(manager)?;

        info!("Database opened at: {}", db_path.display());

        let db = Database { pool };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Single-connection in-memory database. A larger pool would hand out
    /// separate, empty databases.
    pub fn open_in_memory() -> Result<Self, CatMergeError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| Self::init_connection(c, Self::DEFAULT_BUSY_TIMEOUT_MS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let db = Database { pool };
        db.ensure_schema()?;
        Ok(db)
    }

    fn init_connection(conn: &mut Connection, busy_timeout_ms: u64) -> Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
    }

    pub fn get_connection(&self) -> Result<DbConnection, CatMergeError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), CatMergeError> {
        let conn = self.get_connection()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        match Self::get_meta_value_locked(&conn, "schema_version")?.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(CatMergeError::Error(format!(
                "Schema version mismatch: database has '{}', expected '{}'",
                other, SCHEMA_VERSION
            ))),
            None => Err(CatMergeError::Error("Schema version missing".to_string())),
        }
    }

    pub fn get_meta_value_locked(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<String>, CatMergeError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Run `f` inside `BEGIN IMMEDIATE`. Commits on success, rolls back on any error.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, CatMergeError>
    where
        F: FnOnce(&Connection) -> Result<T, CatMergeError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = f(conn).and_then(|value| {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        });

        if result.is_err() && !conn.is_autocommit() {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                error!("Rollback failed: {}", rollback_err);
            }
        }

        result
    }

    /// SHA-256 over every row of every engine table, in rowid order.
    ///
    /// Read-only. Two equal checksums mean the engine-visible state is identical.
    pub fn checksum(conn: &Connection) -> Result<String, CatMergeError> {
        let mut hasher = Sha256::new();

        for table in ENGINE_TABLES {
            hasher.update(table.as_bytes());

            // Table names come from the fixed list above
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", table))?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query([])?;

            while let Some(row) = rows.next()? {
                for i in 0..column_count {
                    match row.get_ref(i)? {
                        ValueRef::Null => hasher.update(b"N"),
                        ValueRef::Integer(v) => {
                            hasher.update(b"I");
                            hasher.update(v.to_le_bytes());
                        }
                        ValueRef::Real(v) => {
                            hasher.update(b"R");
                            hasher.update(v.to_le_bytes());
                        }
                        ValueRef::Text(v) => {
                            hasher.update(b"T");
                            hasher.update((v.len() as u64).to_le_bytes());
                            hasher.update(v);
                        }
                        ValueRef::Blob(v) => {
                            hasher.update(b"B");
                            hasher.update((v.len() as u64).to_le_bytes());
                            hasher.update(v);
                        }
                    }
                }
                hasher.update(b"\n");
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}
