//! Execution store error types.

use drx_id::{ExecutionId, RecordVersion};
use thiserror::Error;

/// Execution store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("execution already exists: {0}")]
    AlreadyExists(ExecutionId),

    /// Conditional update lost against a newer writer.
    #[error("version conflict on {execution_id}: expected {expected}, found {actual}")]
    VersionConflict {
        execution_id: ExecutionId,
        expected: RecordVersion,
        actual: RecordVersion,
    },

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/orchestrator.")]
    MigrationDirNotFound { tried: String, last_error: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
