//! Execution persistence.
//!
//! This module provides:
//! - The [`ExecutionStore`] capability with conditional (versioned) updates
//! - An in-memory store for development and tests
//! - A Postgres store plus connection pool management and migrations

mod error;
mod memory;
mod postgres;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryExecutionStore;
pub use postgres::PgExecutionStore;
pub use store::ExecutionStore;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl DbConfig {
    pub fn new(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/orchestrator/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get an execution store handle.
    pub fn execution_store(&self) -> PgExecutionStore {
        PgExecutionStore::new(self.pool.clone())
    }
}
