//! Postgres execution store.
//!
//! The full record lives in a JSONB column. `status` and `version` are kept
//! beside it so listing and conditional updates never parse JSON.

use async_trait::async_trait;
use chrono::Utc;
use drx_id::{ExecutionId, PlanId, RecordVersion};
use sqlx::postgres::PgPool;
use tracing::debug;

use super::{ExecutionStore, StoreError, StoreResult};
use crate::model::{Execution, ExecutionStatus, RecoveryPlan};

const DRIVEN_STATUSES: [ExecutionStatus; 3] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Polling,
    ExecutionStatus::Cancelling,
];

const TERMINAL_STATUSES: [ExecutionStatus; 5] = [
    ExecutionStatus::Cancelled,
    ExecutionStatus::Completed,
    ExecutionStatus::Partial,
    ExecutionStatus::Failed,
    ExecutionStatus::Timeout,
];

fn status_names(statuses: &[ExecutionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn version_column(version: RecordVersion) -> i64 {
    version.value() as i64
}

#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(record: serde_json::Value) -> StoreResult<Execution> {
        Ok(serde_json::from_value(record)?)
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert(&self, execution: &Execution, plan: &RecoveryPlan) -> StoreResult<()> {
        let record = serde_json::to_value(execution)?;
        let plan_json = serde_json::to_value(plan)?;

        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (execution_id, plan_id, status, version, record, plan, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(execution.plan_id.to_string())
        .bind(execution.status.as_str())
        .bind(version_column(execution.version))
        .bind(record)
        .bind(plan_json)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(execution.execution_id));
        }
        Ok(())
    }

    async fn get(&self, execution_id: &ExecutionId) -> StoreResult<Execution> {
        let record: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT record FROM executions WHERE execution_id = $1")
                .bind(execution_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Query)?;

        Self::decode(record.ok_or(StoreError::NotFound(*execution_id))?)
    }

    async fn plan_for(&self, execution_id: &ExecutionId) -> StoreResult<RecoveryPlan> {
        let plan: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT plan FROM executions WHERE execution_id = $1")
                .bind(execution_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Query)?;

        let plan = plan.ok_or(StoreError::NotFound(*execution_id))?;
        Ok(serde_json::from_value(plan)?)
    }

    async fn update(
        &self,
        execution: &Execution,
        expected: RecordVersion,
    ) -> StoreResult<Execution> {
        let mut record = execution.clone();
        record.version = expected.next();
        record.updated_at = Utc::now();
        let json = serde_json::to_value(&record)?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET record = $1, status = $2, version = $3, updated_at = $4
            WHERE execution_id = $5 AND version = $6
            "#,
        )
        .bind(json)
        .bind(record.status.as_str())
        .bind(version_column(record.version))
        .bind(record.updated_at)
        .bind(execution.execution_id.to_string())
        .bind(version_column(expected))
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 1 {
            return Ok(record);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM executions WHERE execution_id = $1")
                .bind(execution.execution_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Query)?;

        match actual {
            None => Err(StoreError::NotFound(execution.execution_id)),
            Some(actual) => {
                debug!(
                    execution_id = %execution.execution_id,
                    expected = %expected,
                    actual,
                    "Conditional update rejected"
                );
                Err(StoreError::VersionConflict {
                    execution_id: execution.execution_id,
                    expected,
                    actual: RecordVersion::new(actual.max(0) as u64),
                })
            }
        }
    }

    async fn list_active(&self) -> StoreResult<Vec<Execution>> {
        let records: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT record FROM executions WHERE status = ANY($1) ORDER BY created_at",
        )
        .bind(status_names(&DRIVEN_STATUSES))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        records.into_iter().map(Self::decode).collect()
    }

    async fn active_for_plan(&self, plan_id: &PlanId) -> StoreResult<Option<Execution>> {
        let record: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT record FROM executions
            WHERE plan_id = $1 AND NOT (status = ANY($2))
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(plan_id.to_string())
        .bind(status_names(&TERMINAL_STATUSES))
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        record.map(Self::decode).transpose()
    }
}
