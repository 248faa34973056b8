//! Custom error types for the common library
//!
//! This module defines the errors reported by the database and MQTT layers.

use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// A uniqueness constraint rejected the write
    #[error("Database constraint violation: {0}")]
    Conflict(String),

    /// A stored value could not be decoded into its domain type
    #[error("Database decode error: {0}")]
    Decode(String),

    /// Error occurred during database migration
    #[error("Database migration error: {0}")]
    Migration(String),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

impl DatabaseError {
    /// Map a query error, turning unique-index violations into `Conflict`
    pub fn from_query(err: SqlxError) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => Self::Conflict(db.message().to_string()),
            _ => Self::Query(err),
        }
    }
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors reported by the MQTT gateway
#[derive(Error, Debug)]
pub enum BusError {
    /// The client is not connected to the broker
    #[error("MQTT broker not connected")]
    Disconnected,

    /// The client rejected the request
    #[error("MQTT publish failed: {0}")]
    Publish(#[source] rumqttc::ClientError),

    /// The payload could not be encoded
    #[error("MQTT payload encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The request was not accepted before the deadline
    #[error("MQTT publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Type alias for Result with BusError
pub type BusResult<T> = Result<T, BusError>;
