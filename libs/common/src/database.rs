//! Database module for handling SQLite connections and operations
//!
//! This module provides connection pooling, configuration, and health checks
//! for the SQLite database file that backs the portal.

use crate::error::{DatabaseError, DatabaseResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Path used when `EV_DB_PATH` is unset
pub const DEFAULT_DATABASE_PATH: &str = "/data/ev_portal.db";

/// Path value selecting a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// Database configuration struct
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file, or `:memory:`
    pub database_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Create a new DatabaseConfig from environment variables
    pub fn from_env() -> DatabaseResult<Self> {
        let database_path =
            env::var("EV_DB_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());

        let max_connections = env::var("EV_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        if database_path.trim().is_empty() {
            return Err(DatabaseError::Configuration(
                "EV_DB_PATH must not be empty".to_string(),
            ));
        }

        Ok(Self {
            database_path,
            max_connections,
        })
    }

    /// Create a config for a private in-memory database
    pub fn in_memory() -> Self {
        Self {
            database_path: IN_MEMORY.to_string(),
            max_connections: 1,
        }
    }

    /// Whether this config points at an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_path == IN_MEMORY
    }
}

/// Initialize a SQLite connection pool
///
/// File databases are created if missing (including the parent directory)
/// and opened in WAL mode. An in-memory database lives only as long as its
/// single pooled connection.
///
/// # Arguments
///
/// * `config` - Database configuration
///
/// # Returns
///
/// * `DatabaseResult<SqlitePool>` - SQLite connection pool or error
pub async fn init_pool(config: &DatabaseConfig) -> DatabaseResult<SqlitePool> {
    let (options, max_connections) = if config.is_in_memory() {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::Configuration(format!("Invalid database URL: {}", e)))?;
        (options, 1)
    } else {
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Configuration(format!(
                        "Cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        (options, config.max_connections.max(1))
    };

    // Keep the in-memory connection alive for the lifetime of the pool
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(if config.is_in_memory() { 1 } else { 0 })
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(DatabaseError::Connection)?;

    Ok(pool)
}

/// Check database connectivity
///
/// # Arguments
///
/// * `pool` - SQLite connection pool
///
/// # Returns
///
/// * `DatabaseResult<bool>` - True if connection is successful, false otherwise
pub async fn health_check(pool: &SqlitePool) -> DatabaseResult<bool> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(DatabaseError::Query)?;

    Ok(true)
}
