//! Common library for the EV charger portal
//!
//! This crate provides the infrastructure shared by the portal service:
//! SQLite connectivity, the MQTT gateway, and the error types they report.

pub mod database;
pub mod error;
pub mod mqtt;

/// Example usage of the database module
///
/// ```rust,no_run
/// use common::database::{DatabaseConfig, init_pool, health_check};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DatabaseConfig::from_env()?;
///     let pool = init_pool(&config).await?;
///     let is_healthy = health_check(&pool).await?;
///     println!("Database health check: {}", is_healthy);
///     Ok(())
/// }
/// ```
pub fn example_usage() {}
