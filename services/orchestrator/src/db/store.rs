//! The execution store capability.

use async_trait::async_trait;
use drx_id::{ExecutionId, PlanId, RecordVersion};

use super::StoreResult;
use crate::model::{Execution, RecoveryPlan};

/// Persistence for execution records.
///
/// Every write after `insert` is conditional on the caller's view of the
/// record version, so a stale writer is rejected instead of overwriting
/// newer progress.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a new execution together with a frozen copy of its plan.
    async fn insert(&self, execution: &Execution, plan: &RecoveryPlan) -> StoreResult<()>;

    async fn get(&self, execution_id: &ExecutionId) -> StoreResult<Execution>;

    /// The plan snapshot taken when the execution was created.
    async fn plan_for(&self, execution_id: &ExecutionId) -> StoreResult<RecoveryPlan>;

    /// Replace the record if its stored version still equals `expected`.
    ///
    /// Returns the stored record, whose version is `expected.next()`.
    async fn update(&self, execution: &Execution, expected: RecordVersion)
        -> StoreResult<Execution>;

    /// Executions the tick driver should advance (PENDING, POLLING, CANCELLING).
    async fn list_active(&self) -> StoreResult<Vec<Execution>>;

    /// Any non-terminal execution of the plan.
    async fn active_for_plan(&self, plan_id: &PlanId) -> StoreResult<Option<Execution>>;
}
