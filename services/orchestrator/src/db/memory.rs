//! In-memory execution store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use drx_id::{ExecutionId, PlanId, RecordVersion};
use tokio::sync::RwLock;

use super::{ExecutionStore, StoreError, StoreResult};
use crate::model::{Execution, RecoveryPlan};

#[derive(Debug, Clone)]
struct StoredExecution {
    record: Execution,
    plan: RecoveryPlan,
}

/// Process-local store used by the dev binary and the tests.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, StoredExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: &Execution, plan: &RecoveryPlan) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.execution_id) {
            return Err(StoreError::AlreadyExists(execution.execution_id));
        }
        executions.insert(
            execution.execution_id,
            StoredExecution {
                record: execution.clone(),
                plan: plan.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, execution_id: &ExecutionId) -> StoreResult<Execution> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|s| s.record.clone())
            .ok_or(StoreError::NotFound(*execution_id))
    }

    async fn plan_for(&self, execution_id: &ExecutionId) -> StoreResult<RecoveryPlan> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|s| s.plan.clone())
            .ok_or(StoreError::NotFound(*execution_id))
    }

    async fn update(
        &self,
        execution: &Execution,
        expected: RecordVersion,
    ) -> StoreResult<Execution> {
        let mut executions = self.executions.write().await;
        let stored = executions
            .get_mut(&execution.execution_id)
            .ok_or(StoreError::NotFound(execution.execution_id))?;

        if stored.record.version != expected {
            return Err(StoreError::VersionConflict {
                execution_id: execution.execution_id,
                expected,
                actual: stored.record.version,
            });
        }

        let mut record = execution.clone();
        record.version = expected.next();
        record.updated_at = Utc::now();
        stored.record = record.clone();
        Ok(record)
    }

    async fn list_active(&self) -> StoreResult<Vec<Execution>> {
        let mut active: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|s| s.record.status.is_driven())
            .map(|s| s.record.clone())
            .collect();
        active.sort_by_key(|e| e.start_time);
        Ok(active)
    }

    async fn active_for_plan(&self, plan_id: &PlanId) -> StoreResult<Option<Execution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .find(|s| s.record.plan_id == *plan_id && !s.record.is_terminal())
            .map(|s| s.record.clone()))
    }
}
