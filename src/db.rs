//! SQLite connection for the page graph and content type table.
//!
//! File databases run in WAL mode with foreign keys on, so the localization
//! pass can read pages while fetches commit theirs. Migrations under
//! `migrations/` run on every open.
//!
//! # Example
//!
//! ```no_run
//! use webmirror_core::{Database, SqliteStore};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("mirror/webmirror.db")).await?;
//! let store = SqliteStore::new(db);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file databases. SQLite serializes writers anyway.
const FILE_POOL_SIZE: u32 = 4;

/// How long a connection waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors opening the database.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to open database: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A migrated connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens or creates the database file at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] when the file cannot be opened and
    /// [`DbError::Migration`] when the schema cannot be brought up to date.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds one connection, since each SQLite memory connection
    /// is its own database.
    ///
    /// # Errors
    ///
    /// See [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("database ready");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Journal mode reported by SQLite, lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
