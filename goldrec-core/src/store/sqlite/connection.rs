//! SQLite connection handling.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/goldrec.db`, `sqlite://./relative.db` or
//!   a bare path ending in `.db`, `.sqlite` or `.sqlite3`
//! - In-memory: `sqlite::memory:` or `:memory:`
//!
//! File databases are created on first open and use WAL journaling. An
//! in-memory database lives in a single connection that is never recycled.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::{GoldrecError, Result};

/// Pool settings for a SQLite store.
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a writer waits on a locked database
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteStoreConfig {
    /// Sets the pool size, at least one connection.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        if max_connections == 0 {
            tracing::warn!("max_connections of 0 is not usable, using 1");
        }
        self.max_connections = max_connections.max(1);
        self
    }
}

/// Whether a connection string names an in-memory database.
pub fn is_in_memory(connection_string: &str) -> bool {
    connection_string.contains(":memory:") || connection_string.contains("mode=memory")
}

/// Validates SQLite connection string format.
///
/// # Errors
/// Returns a configuration error for strings that are neither a SQLite URL,
/// a database file path, nor `:memory:`.
pub fn validate_connection_string(connection_string: &str) -> Result<()> {
    if connection_string == ":memory:" || connection_string.starts_with("sqlite:") {
        return Ok(());
    }
    if connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        return Ok(());
    }
    Err(GoldrecError::configuration(
        "Invalid SQLite connection string format: expected sqlite:// URL, file path, or :memory:",
    ))
}

/// Normalizes connection string to SQLite URL format.
fn normalize_connection_string(connection_string: &str) -> String {
    if connection_string == ":memory:" {
        return "sqlite::memory:".to_string();
    }
    if connection_string.starts_with("sqlite:") {
        return connection_string.to_string();
    }
    format!("sqlite://{}", connection_string)
}

/// Opens a connection pool for the store.
pub(super) async fn connect(connection_string: &str, config: &SqliteStoreConfig) -> Result<SqlitePool> {
    validate_connection_string(connection_string)?;
    let in_memory = is_in_memory(connection_string);

    let mut options = SqliteConnectOptions::from_str(&normalize_connection_string(connection_string))
        .map_err(|e| {
            GoldrecError::configuration(format!("Invalid SQLite connection string: {}", e))
        })?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(config.acquire_timeout);
    pool_options = if in_memory {
        // each connection would otherwise see its own empty database
        pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(config.max_connections.max(1))
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| GoldrecError::store_unavailable("Failed to open SQLite database", e))?;

    tracing::debug!(in_memory, "Opened SQLite entity store");
    Ok(pool)
}
