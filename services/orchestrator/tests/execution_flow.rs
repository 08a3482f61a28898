//! Integration tests for the execution lifecycle.
//!
//! These tests drive the controller and the tick worker against the
//! in-memory store and the mock provider:
//! 1. Control operations record intent (start, pause, cancel, ...)
//! 2. Ticks advance executions wave by wave
//! 3. Commits go through the conditional update
//!
//! No network or database is required.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drx_events::{event_types, ActorType, ExecutionEvent};
use drx_id::{ExecutionId, PlanId};
use drx_orchestrator::codes;
use drx_orchestrator::controller::{CommitOutcome, ExecutionController};
use drx_orchestrator::db::{ExecutionStore, InMemoryExecutionStore};
use drx_orchestrator::model::{
    AccountContext, ExecutionStatus, ExecutionType, LaunchStatus, RecoveryPlan, Wave, WaveResult,
    WaveStatus,
};
use drx_orchestrator::notify::ChannelNotifier;
use drx_orchestrator::providers::{MockBroker, MockProvider, ProviderError};
use drx_orchestrator::quota::{QuotaGuard, QuotaLimits};
use drx_orchestrator::scheduler::{SchedulerSettings, TickWorker};
use drx_orchestrator::state::Capabilities;
use proptest::prelude::*;
use rstest::rstest;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    provider: Arc<MockProvider>,
    broker: Arc<MockBroker>,
    controller: Arc<ExecutionController>,
    events: UnboundedReceiver<ExecutionEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(QuotaLimits::default())
    }

    fn with_limits(limits: QuotaLimits) -> Self {
        let provider = Arc::new(MockProvider::new());
        let broker = Arc::new(MockBroker::new(provider.clone()));
        let (notifier, events) = ChannelNotifier::new();
        let caps = Capabilities::new(
            Arc::new(InMemoryExecutionStore::new()),
            broker.clone(),
            Arc::new(notifier),
            QuotaGuard::new(limits),
            SchedulerSettings::default(),
        );
        Self {
            provider,
            broker,
            controller: Arc::new(ExecutionController::new(caps)),
            events,
        }
    }

    async fn start(&self, plan: &RecoveryPlan) -> ExecutionId {
        self.controller
            .start(plan.clone(), ExecutionType::Drill, "ops@example.com", None)
            .await
            .unwrap()
            .data
            .execution_id
    }

    async fn tick(&self, id: &ExecutionId) -> CommitOutcome {
        let report = self.controller.tick(id).await.unwrap();
        assert!(report.error.is_none(), "unexpected soft error: {:?}", report.error);
        report.commit
    }

    fn launch_current_job(&self) {
        let job_id = self.provider.last_job_id().unwrap();
        self.provider.launch_all(&job_id);
    }

    fn event_types(&mut self) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event.event_type);
        }
        seen
    }

    fn worker(&self) -> TickWorker {
        TickWorker::new(
            self.controller.clone(),
            Duration::from_secs(30),
            3,
            Duration::from_secs(600),
        )
    }
}

fn servers(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("s-{prefix}{i}")).collect()
}

fn two_wave_plan() -> RecoveryPlan {
    RecoveryPlan::new(
        PlanId::new(),
        "payments failover",
        vec![
            Wave::new(0, "databases", servers("db", 2)),
            Wave::new(1, "app tier", servers("app", 2)),
        ],
    )
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_two_wave_drill_completes() {
    let mut h = Harness::new();
    let plan = two_wave_plan();

    let started = h
        .controller
        .start(plan.clone(), ExecutionType::Drill, "ops@example.com", None)
        .await
        .unwrap();
    assert_eq!(started.status_code, 202);
    assert_eq!(started.code, codes::EXECUTION_STARTED);
    assert_eq!(started.data.status, ExecutionStatus::Pending);
    assert_eq!(started.data.total_waves, 2);
    let id = started.data.execution_id;

    // Wave 0 starts.
    assert!(matches!(h.tick(&id).await, CommitOutcome::Persisted(_)));
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Polling);
    assert_eq!(exec.wave_result(0).unwrap().status, WaveStatus::InProgress);

    // Wave 0 converges and wave 1 starts in the same tick.
    h.launch_current_job();
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.completed_waves, 1);
    assert_eq!(exec.current_wave_number, 1);
    let wave0 = exec.wave_result(0).unwrap();
    assert_eq!(wave0.status, WaveStatus::Completed);
    assert!(wave0.end_time.is_some());
    for server in &wave0.server_statuses {
        assert_eq!(server.launch_status, LaunchStatus::Launched);
        assert!(server.instance_id.is_some());
        assert!(server.private_ip.is_some());
        assert!(server.hostname.is_some());
    }
    assert_eq!(exec.wave_result(1).unwrap().status, WaveStatus::InProgress);

    h.launch_current_job();
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.completed_waves, 2);
    assert!(exec.end_time.is_some());
    assert!(exec.duration_seconds.is_some());

    // Nothing left to do.
    assert_eq!(h.tick(&id).await, CommitOutcome::Unchanged);

    assert_eq!(
        h.event_types(),
        vec![
            event_types::EXECUTION_STARTED,
            event_types::WAVE_STARTED,
            event_types::WAVE_FINISHED,
            event_types::WAVE_STARTED,
            event_types::WAVE_FINISHED,
            event_types::EXECUTION_FINISHED,
        ]
    );
}

#[tokio::test]
async fn test_scheduler_events_are_attributed_to_system() {
    let mut h = Harness::new();
    let plan = two_wave_plan();
    let id = h.start(&plan).await;
    h.tick(&id).await;

    let started = h.events.try_recv().unwrap();
    assert_eq!(started.actor_type, ActorType::User);
    let wave = h.events.try_recv().unwrap();
    assert_eq!(wave.event_type, event_types::WAVE_STARTED);
    assert_eq!(wave.actor_type, ActorType::System);
    assert!(wave.event_id > started.event_id);
}

// =============================================================================
// Start validation
// =============================================================================

#[rstest]
#[case(100, true)]
#[case(101, false)]
#[tokio::test]
async fn test_wave_size_limit_at_start(#[case] size: usize, #[case] accepted: bool) {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "large",
        vec![Wave::new(0, "fleet", servers("x", size))],
    );

    let result = h
        .controller
        .start(plan, ExecutionType::Recovery, "ops", None)
        .await;
    match result {
        Ok(response) => {
            assert!(accepted);
            assert_eq!(response.data.status, ExecutionStatus::Pending);
        }
        Err(err) => {
            assert!(!accepted);
            assert_eq!(err.status_code, 400);
            assert_eq!(err.code, codes::VALIDATION_ERROR);
        }
    }
}

#[tokio::test]
async fn test_empty_plan_is_rejected() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(PlanId::new(), "empty", vec![]);
    let err = h
        .controller
        .start(plan, ExecutionType::Drill, "ops", None)
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::VALIDATION_ERROR);
}

#[tokio::test]
async fn test_one_active_execution_per_plan() {
    let h = Harness::new();
    let plan = two_wave_plan();
    let first = h.start(&plan).await;

    let err = h
        .controller
        .start(plan.clone(), ExecutionType::Drill, "ops", None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code, 409);
    assert_eq!(err.code, codes::PLAN_ALREADY_EXECUTING);

    // A finished execution no longer blocks the plan.
    h.controller.cancel(&first, None).await.unwrap();
    h.tick(&first).await;
    assert_eq!(
        h.controller.get(&first).await.unwrap().data.status,
        ExecutionStatus::Cancelled
    );
    h.start(&plan).await;
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn test_unknown_execution_and_wave() {
    let h = Harness::new();
    let err = h.controller.get(&ExecutionId::new()).await.unwrap_err();
    assert_eq!(err.status_code, 404);
    assert_eq!(err.code, codes::EXECUTION_NOT_FOUND);

    let id = h.start(&two_wave_plan()).await;
    let err = h.controller.wave_result(&id, 0).await.unwrap_err();
    assert_eq!(err.code, codes::TARGET_NOT_FOUND);

    h.tick(&id).await;
    let result = h.controller.wave_result(&id, 0).await.unwrap().data;
    assert_eq!(result.status, WaveStatus::InProgress);
}

#[tokio::test]
async fn test_live_view_never_changes_stored_status() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;
    let job_id = h.provider.last_job_id().unwrap();
    h.provider.launch_server(&job_id, "s-db0");

    let stored = h.controller.get(&id).await.unwrap().data;
    let view = h.controller.live_view(&id).await.unwrap().data;

    assert_eq!(view.execution.status, stored.status);
    assert_eq!(view.execution.version, stored.version);
    let live = view.execution.wave_result(0).unwrap();
    assert_eq!(live.status, WaveStatus::InProgress);
    assert_eq!(live.server_statuses[0].launch_status, LaunchStatus::Launched);
    assert_eq!(live.server_statuses[1].launch_status, LaunchStatus::Pending);
    assert!(view.compatibility_fallback);

    // The store still holds the last committed tick.
    let again = h.controller.get(&id).await.unwrap().data;
    assert_eq!(again, stored);
}

#[tokio::test]
async fn test_cross_account_context_is_resolved() {
    let h = Harness::new();
    let plan = two_wave_plan();
    let context = AccountContext::cross_account("444455556666", "DrxRecoveryRole", None);
    let id = h
        .controller
        .start(plan, ExecutionType::Recovery, "ops", Some(context))
        .await
        .unwrap()
        .data
        .execution_id;

    h.tick(&id).await;
    assert_eq!(h.broker.resolved_accounts(), vec!["444455556666".to_string()]);

    let view = h.controller.live_view(&id).await.unwrap().data;
    assert!(!view.compatibility_fallback);
}

// =============================================================================
// Cancel / pause / resume
// =============================================================================

#[tokio::test]
async fn test_cancel_is_cooperative_and_idempotent() {
    let mut h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;

    let response = h
        .controller
        .cancel(&id, Some("drill aborted".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status_code, 202);
    assert_eq!(response.code, codes::CANCEL_REQUESTED);
    assert_eq!(response.data.status, ExecutionStatus::Cancelling);

    let again = h.controller.cancel(&id, None).await.unwrap();
    assert_eq!(again.status_code, 202);
    assert_eq!(again.data.version, response.data.version);

    let describes = h.provider.describe_job_calls();
    h.tick(&id).await;
    assert_eq!(h.provider.describe_job_calls(), describes);

    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    let wave0 = exec.wave_result(0).unwrap();
    assert_eq!(wave0.status, WaveStatus::Cancelled);
    assert_eq!(wave0.status_message.as_deref(), Some("drill aborted"));

    let err = h.controller.cancel(&id, None).await.unwrap_err();
    assert_eq!(err.code, codes::INVALID_STATE_TRANSITION);

    let types = h.event_types();
    assert!(types.contains(&event_types::EXECUTION_CANCEL_REQUESTED.to_string()));
    assert_eq!(types.last().map(String::as_str), Some(event_types::EXECUTION_FINISHED));
}

#[tokio::test]
async fn test_pause_at_wave_boundary_then_resume() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;

    let response = h.controller.pause(&id).await.unwrap();
    assert_eq!(response.status_code, 202);
    assert!(response.data.pause_requested);
    assert_eq!(response.data.status, ExecutionStatus::Polling);

    // The running wave finishes; the next one does not start.
    h.launch_current_job();
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Paused);
    assert_eq!(exec.paused_before_wave, Some(1));
    assert_eq!(exec.completed_waves, 1);
    assert_eq!(exec.wave_result(1).unwrap().status, WaveStatus::Paused);
    assert!(!exec.pause_requested);
    assert_eq!(h.provider.start_calls(), 1);

    // Paused executions are left alone by ticks.
    assert_eq!(h.tick(&id).await, CommitOutcome::Unchanged);

    let resumed = h.controller.resume(&id).await.unwrap();
    assert_eq!(resumed.code, codes::EXECUTION_RESUMED);
    assert_eq!(resumed.data.status, ExecutionStatus::Polling);
    assert_eq!(resumed.data.paused_before_wave, None);
    assert_eq!(resumed.data.wave_result(1).unwrap().status, WaveStatus::NotStarted);

    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.wave_result(1).unwrap().status, WaveStatus::InProgress);
    assert_eq!(h.provider.start_calls(), 2);
}

#[tokio::test]
async fn test_pause_before_wave_flag_and_cancel_while_paused() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "gated",
        vec![Wave::new(0, "db", servers("db", 1)).with_pause_before()],
    );
    let id = h.start(&plan).await;
    h.tick(&id).await;
    assert_eq!(
        h.controller.get(&id).await.unwrap().data.status,
        ExecutionStatus::Paused
    );

    // Pausing twice is harmless.
    assert_eq!(h.controller.pause(&id).await.unwrap().status_code, 202);

    let response = h.controller.cancel(&id, None).await.unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.code, codes::EXECUTION_CANCELLED);
    assert_eq!(response.data.status, ExecutionStatus::Cancelled);
    assert_eq!(response.data.wave_result(0).unwrap().status, WaveStatus::Cancelled);
    assert_eq!(h.provider.start_calls(), 0);
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    let err = h.controller.resume(&id).await.unwrap_err();
    assert_eq!(err.status_code, 409);
    assert_eq!(err.code, codes::INVALID_STATE_TRANSITION);
}

#[tokio::test]
async fn test_pause_rejected_after_cancel() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    h.controller.cancel(&id, None).await.unwrap();
    let err = h.controller.pause(&id).await.unwrap_err();
    assert_eq!(err.code, codes::INVALID_STATE_TRANSITION);
}

// =============================================================================
// Timeouts and failures
// =============================================================================

#[tokio::test]
async fn test_wave_times_out_after_accrued_wait() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "slow",
        vec![Wave::new(0, "db", servers("db", 1)).with_max_wait(60)],
    );
    let id = h.start(&plan).await;

    h.tick(&id).await;
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Polling);
    assert_eq!(exec.wave_result(0).unwrap().elapsed_seconds, 30);

    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Timeout);
    assert_eq!(exec.error_code.as_deref(), Some(codes::WAVE_TIMEOUT));
    assert_eq!(exec.wave_result(0).unwrap().status, WaveStatus::Timeout);
}

#[tokio::test]
async fn test_missing_job_fails_execution() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;
    h.provider.forget_job(&h.provider.last_job_id().unwrap());

    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error_code.as_deref(), Some(codes::JOB_NOT_FOUND));
    assert_eq!(exec.wave_result(0).unwrap().status, WaveStatus::Failed);
}

#[tokio::test]
async fn test_concurrent_job_quota_fails_at_admission() {
    let h = Harness::with_limits(QuotaLimits {
        max_concurrent_jobs: 2,
        ..QuotaLimits::default()
    });
    h.provider.seed_active_job("us-east-1", 3);
    h.provider.seed_active_job("us-east-1", 3);

    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error_code.as_deref(), Some("CONCURRENT_JOBS_EXCEEDED"));
    assert_eq!(h.provider.start_calls(), 0);
}

#[tokio::test]
async fn test_unhealthy_replication_blocks_wave() {
    let h = Harness::new();
    h.provider.set_replication_state("s-db1", "STALLED");

    let id = h.start(&two_wave_plan()).await;
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error_code.as_deref(), Some("UNHEALTHY_REPLICATION"));
    assert!(exec.error_message.unwrap().contains("s-db1"));
}

// =============================================================================
// Finalize and termination
// =============================================================================

#[tokio::test]
async fn test_finalize_rejects_waves_that_never_started() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "manual close",
        vec![
            Wave::new(0, "db", servers("db", 1)),
            Wave::new(1, "app", servers("app", 1)),
        ],
    );
    let id = h.start(&plan).await;

    let err = h.controller.finalize(&id).await.unwrap_err();
    assert_eq!(err.status_code, 409);
    assert_eq!(err.code, codes::WAVES_NOT_COMPLETE);
    assert_eq!(err.details.unwrap()["unsettledWaves"], json!([0, 1]));

    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Pending);
    assert_eq!(h.provider.start_calls(), 0);
}

#[tokio::test]
async fn test_finalize_rejects_wave_held_by_wait_time() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "manual close",
        vec![
            Wave::new(0, "db", servers("db", 1)),
            Wave::new(1, "app", servers("app", 1)).with_wait_time(3600),
        ],
    );
    let id = h.start(&plan).await;
    h.tick(&id).await;

    let err = h.controller.finalize(&id).await.unwrap_err();
    assert_eq!(err.code, codes::WAVES_NOT_COMPLETE);

    // Wave 0 completes; wave 1 is held back by its wait time.
    h.launch_current_job();
    h.tick(&id).await;
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.completed_waves, 1);
    assert!(exec.wave_result(1).is_none());

    let err = h.controller.finalize(&id).await.unwrap_err();
    assert_eq!(err.code, codes::WAVES_NOT_COMPLETE);
    assert_eq!(err.details.unwrap()["unsettledWaves"], json!([1]));
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Polling);
}

#[tokio::test]
async fn test_finalize_closes_settled_execution_once() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "manual close",
        vec![Wave::new(0, "db", servers("db", 1))],
    );
    let id = h.start(&plan).await;

    // Every plan wave settled while the record is still open.
    let store = h.controller.capabilities().store().clone();
    let mut exec = store.get(&id).await.unwrap();
    let mut result = WaveResult::for_wave(&plan.waves[0], "us-east-1", WaveStatus::NotStarted);
    result.settle(WaveStatus::Completed, None, Utc::now());
    exec.upsert_wave_result(result);
    exec.status = ExecutionStatus::Polling;
    store.update(&exec, exec.version).await.unwrap();

    let first = h.controller.finalize(&id).await.unwrap();
    assert_eq!(first.code, codes::EXECUTION_FINALIZED);
    assert!(!first.data.already_finalized);
    assert_eq!(first.data.execution.status, ExecutionStatus::Completed);

    let second = h.controller.finalize(&id).await.unwrap();
    assert_eq!(second.status_code, 200);
    assert_eq!(second.code, codes::ALREADY_FINALIZED);
    assert!(second.data.already_finalized);
    assert_eq!(second.data.execution.version, first.data.execution.version);
}

#[tokio::test]
async fn test_terminate_instances_across_regions() {
    let mut h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "multi region",
        vec![
            Wave::new(0, "east", servers("e", 2)),
            Wave::new(1, "west", servers("w", 1)).with_region("us-west-2"),
        ],
    );
    let id = h.start(&plan).await;

    let err = h.controller.terminate_instances(&id).await.unwrap_err();
    assert_eq!(err.code, codes::NO_INSTANCES);

    h.tick(&id).await;
    h.launch_current_job();
    h.tick(&id).await;
    h.launch_current_job();
    h.tick(&id).await;
    h.event_types();

    let response = h.controller.terminate_instances(&id).await.unwrap();
    assert_eq!(response.status_code, 202);
    assert_eq!(response.data.requested, 3);
    assert_eq!(response.data.terminated.len(), 3);
    assert_eq!(response.data.regions, vec!["us-east-1", "us-west-2"]);
    assert!(response.data.failed_regions.is_empty());
    assert_eq!(h.provider.terminated_instances().len(), 3);

    let exec = h.controller.get(&id).await.unwrap().data;
    assert!(exec.instances_terminated);
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(
        h.event_types(),
        vec![event_types::EXECUTION_INSTANCES_TERMINATED]
    );
}

#[tokio::test]
async fn test_terminate_reports_failed_regions() {
    let h = Harness::new();
    let plan = RecoveryPlan::new(
        PlanId::new(),
        "multi region",
        vec![
            Wave::new(0, "east", servers("e", 1)),
            Wave::new(1, "west", servers("w", 1)).with_region("us-west-2"),
        ],
    );
    let id = h.start(&plan).await;
    h.tick(&id).await;
    h.launch_current_job();
    h.tick(&id).await;
    h.launch_current_job();
    h.tick(&id).await;

    h.provider.fail_terminate_in("us-west-2");
    let response = h.controller.terminate_instances(&id).await.unwrap();
    assert_eq!(response.data.terminated.len(), 1);
    assert_eq!(response.data.failed_regions.len(), 1);
    assert_eq!(response.data.failed_regions[0].region, "us-west-2");
    assert!(!h.controller.get(&id).await.unwrap().data.instances_terminated);

    h.provider.fail_terminate_in("us-east-1");
    let err = h.controller.terminate_instances(&id).await.unwrap_err();
    assert_eq!(err.status_code, 502);
    assert_eq!(err.code, codes::PROVIDER_ERROR);
}

// =============================================================================
// Commit protocol
// =============================================================================

#[tokio::test]
async fn test_stale_tick_candidate_is_discarded() {
    let h = Harness::new();
    let plan = two_wave_plan();
    let id = h.start(&plan).await;
    let store = h.controller.capabilities().store().clone();
    let snapshot = store.get(&id).await.unwrap();

    let first = h.controller.scheduler().tick(&snapshot, &plan).await.execution;
    let second = h.controller.scheduler().tick(&snapshot, &plan).await.execution;

    let committed = h.controller.commit_tick(&snapshot, first).await.unwrap();
    let CommitOutcome::Persisted(stored) = committed else {
        panic!("first candidate should persist");
    };
    assert_eq!(stored.version, snapshot.version.next());

    let outcome = h.controller.commit_tick(&snapshot, second).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Discarded);

    let current = store.get(&id).await.unwrap();
    assert_eq!(current, stored);
}

#[tokio::test]
async fn test_control_write_during_tick_is_kept() {
    let h = Harness::new();
    let plan = two_wave_plan();
    let id = h.start(&plan).await;
    let store = h.controller.capabilities().store().clone();
    let snapshot = store.get(&id).await.unwrap();

    let candidate = h.controller.scheduler().tick(&snapshot, &plan).await.execution;
    h.controller
        .cancel(&id, Some("operator".to_string()))
        .await
        .unwrap();

    let outcome = h.controller.commit_tick(&snapshot, candidate).await.unwrap();
    let CommitOutcome::Persisted(stored) = outcome else {
        panic!("candidate should be rebased onto the cancel request");
    };
    assert!(stored.cancel_requested);
    assert_eq!(stored.status, ExecutionStatus::Cancelling);
    assert_eq!(stored.wave_result(0).unwrap().status, WaveStatus::InProgress);

    h.tick(&id).await;
    assert_eq!(
        store.get(&id).await.unwrap().status,
        ExecutionStatus::Cancelled
    );
}

// =============================================================================
// Tick worker
// =============================================================================

#[tokio::test]
async fn test_worker_drives_to_completion() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    let worker = h.worker();

    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.persisted, 1);

    h.launch_current_job();
    worker.run_once().await.unwrap();
    h.launch_current_job();
    worker.run_once().await.unwrap();

    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.executions, 0);
}

#[tokio::test]
async fn test_worker_fails_execution_after_retries_exhausted() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    let worker = h.worker();
    worker.run_once().await.unwrap();

    h.provider
        .fail_describes(Some(ProviderError::Transient("throttled".into())));
    for _ in 0..3 {
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.soft_errors, 1);
        assert_eq!(stats.retries_exhausted, 0);
        assert_eq!(
            h.controller.get(&id).await.unwrap().data.status,
            ExecutionStatus::Polling
        );
    }

    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.retries_exhausted, 1);
    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.error_code.as_deref(),
        Some(codes::PROVIDER_RETRIES_EXHAUSTED)
    );
    assert_eq!(exec.wave_result(0).unwrap().status, WaveStatus::Failed);
}

#[tokio::test]
async fn test_worker_success_resets_retry_count() {
    let h = Harness::new();
    let id = h.start(&two_wave_plan()).await;
    let worker = h.worker();
    worker.run_once().await.unwrap();

    for _ in 0..2 {
        h.provider
            .fail_describes(Some(ProviderError::Transient("throttled".into())));
        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();
        h.provider.fail_describes(None);
        worker.run_once().await.unwrap();
    }

    let exec = h.controller.get(&id).await.unwrap().data;
    assert_eq!(exec.status, ExecutionStatus::Polling);
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Debug, Clone)]
enum Step {
    Tick,
    LaunchAll,
    FailOne,
    Pause,
    Resume,
    Cancel,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Tick),
        2 => Just(Step::LaunchAll),
        1 => Just(Step::FailOne),
        1 => Just(Step::Pause),
        1 => Just(Step::Resume),
        1 => Just(Step::Cancel),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_progress_is_monotonic(steps in proptest::collection::vec(step_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = Harness::new();
            let plan = RecoveryPlan::new(
                PlanId::new(),
                "three waves",
                vec![
                    Wave::new(0, "a", servers("a", 2)),
                    Wave::new(1, "b", servers("b", 2)),
                    Wave::new(2, "c", servers("c", 1)),
                ],
            );
            let id = h.start(&plan).await;
            let mut last = h.controller.get(&id).await.unwrap().data;

            for step in steps {
                match step {
                    Step::Tick => {
                        let _ = h.controller.tick(&id).await.unwrap();
                    }
                    Step::LaunchAll => {
                        if let Some(job_id) = h.provider.last_job_id() {
                            h.provider.launch_all(&job_id);
                        }
                    }
                    Step::FailOne => {
                        if let Some(job_id) = h.provider.last_job_id() {
                            let current = last.current_wave_number as usize;
                            let server = &plan.waves[current].server_ids[0];
                            h.provider.fail_server(&job_id, server);
                        }
                    }
                    Step::Pause => {
                        let _ = h.controller.pause(&id).await;
                    }
                    Step::Resume => {
                        let _ = h.controller.resume(&id).await;
                    }
                    Step::Cancel => {
                        let _ = h.controller.cancel(&id, None).await;
                    }
                }

                let current = h.controller.get(&id).await.unwrap().data;
                assert!(current.completed_waves >= last.completed_waves);
                assert!(current.completed_waves <= current.total_waves);
                assert!(current.version >= last.version);
                if last.is_terminal() {
                    assert_eq!(current.status, last.status);
                    assert_eq!(current.completed_waves, last.completed_waves);
                }
                last = current;
            }
        });
    }
}
