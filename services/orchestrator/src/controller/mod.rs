//! Execution controller.
//!
//! The only writer of execution records. Control operations run as
//! read-modify-write cycles against the store's conditional update and
//! retry on version conflicts. Scheduler ticks produce candidates that
//! reach the store only through [`ExecutionController::commit_tick`].
//!
//! Every persisted transition is diffed against the previous record and
//! reported to the notifier.

mod response;

pub use response::{
    ControlError, ControlResponse, ControlResult, FinalizeOutcome, RegionFailure,
    StartedExecution, TerminationReport,
};

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use drx_events::{
    ActorType, CancelRequestedPayload, EventPayload, ExecutionEvent, ExecutionFinishedPayload,
    ExecutionPausedPayload, ExecutionResumedPayload, ExecutionStartedPayload,
    InstancesTerminatedPayload, WaveFinishedPayload, WaveStartedPayload,
};
use drx_id::{EventId, ExecutionId};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::codes;
use crate::db::StoreError;
use crate::model::{
    AccountContext, Execution, ExecutionStatus, ExecutionType, RecoveryPlan, WaveResult,
    WaveStatus,
};
use crate::providers::resolve_clients;
use crate::reconciler::{LiveReconciler, LiveView};
use crate::scheduler::{cancel_in_place, TickError, WaveScheduler};
use crate::state::Capabilities;

/// Attempts at a read-modify-write before reporting a conflict.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Actor id recorded for control operations.
const CONTROL_ACTOR: &str = "control-api";

/// Actor id recorded for scheduler ticks.
const SCHEDULER_ACTOR: &str = "scheduler";

/// What happened to a tick's candidate snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The candidate was stored.
    Persisted(Execution),
    /// The tick changed nothing.
    Unchanged,
    /// A newer writer got there first; the candidate was dropped.
    Discarded,
}

/// Result of one controller-driven tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub commit: CommitOutcome,
    pub error: Option<TickError>,
}

/// A committed read-modify-write.
struct Mutation<T> {
    before: Execution,
    after: Execution,
    value: T,
}

enum CancelKind {
    Requested,
    AlreadyRequested,
    Cancelled,
}

pub struct ExecutionController {
    caps: Capabilities,
    scheduler: WaveScheduler,
    reconciler: LiveReconciler,
    event_seq: AtomicU64,
}

impl ExecutionController {
    pub fn new(caps: Capabilities) -> Self {
        let scheduler = WaveScheduler::new(
            caps.broker().clone(),
            caps.quota().clone(),
            caps.scheduler_settings().clone(),
        );
        let reconciler = LiveReconciler::new(caps.broker().clone());
        Self {
            caps,
            scheduler,
            reconciler,
            event_seq: AtomicU64::new(0),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn scheduler(&self) -> &WaveScheduler {
        &self.scheduler
    }

    // =========================================================================
    // Control operations
    // =========================================================================

    /// Validates the plan and records a PENDING execution. The first tick
    /// comes from the driver.
    #[instrument(skip(self, plan, account_context), fields(plan_id = %plan.plan_id))]
    pub async fn start(
        &self,
        plan: RecoveryPlan,
        execution_type: ExecutionType,
        initiated_by: &str,
        account_context: Option<AccountContext>,
    ) -> ControlResult<StartedExecution> {
        plan.validate()
            .map_err(|e| ControlError::bad_request(codes::VALIDATION_ERROR, e.to_string()))?;

        let oversized = self.caps.quota().validate_wave_sizes(&plan);
        if !oversized.is_empty() {
            let messages: Vec<String> = oversized.iter().map(|v| v.to_string()).collect();
            return Err(
                ControlError::bad_request(codes::VALIDATION_ERROR, messages.join("; "))
                    .with_details(json!({ "violations": messages })),
            );
        }

        if let Some(active) = self.caps.store().active_for_plan(&plan.plan_id).await? {
            return Err(ControlError::conflict(
                codes::PLAN_ALREADY_EXECUTING,
                format!(
                    "plan {} already has active execution {}",
                    plan.plan_id, active.execution_id
                ),
            )
            .with_details(json!({
                "executionId": active.execution_id,
                "status": active.status,
            })));
        }

        let execution = Execution::pending(
            &plan,
            execution_type,
            initiated_by,
            account_context,
            Utc::now(),
        );
        self.caps.store().insert(&execution, &plan).await?;

        self.publish(
            &execution.execution_id,
            ActorType::User,
            initiated_by,
            EventPayload::ExecutionStarted(ExecutionStartedPayload {
                plan_id: plan.plan_id,
                execution_type,
                initiated_by: initiated_by.to_string(),
                total_waves: execution.total_waves,
            }),
        );
        info!(
            execution_id = %execution.execution_id,
            execution_type = %execution_type,
            total_waves = execution.total_waves,
            "Execution created"
        );

        Ok(ControlResponse::accepted(
            codes::EXECUTION_STARTED,
            "execution created; waves start on the next tick",
            StartedExecution {
                execution_id: execution.execution_id,
                plan_id: execution.plan_id,
                status: execution.status,
                total_waves: execution.total_waves,
            },
        ))
    }

    /// The stored record.
    pub async fn get(&self, execution_id: &ExecutionId) -> ControlResult<Execution> {
        let execution = self.caps.store().get(execution_id).await?;
        Ok(ControlResponse::ok(codes::OK, "execution", execution))
    }

    /// One wave's stored result.
    pub async fn wave_result(
        &self,
        execution_id: &ExecutionId,
        wave_number: u32,
    ) -> ControlResult<WaveResult> {
        let execution = self.caps.store().get(execution_id).await?;
        let result = execution.wave_result(wave_number).cloned().ok_or_else(|| {
            ControlError::not_found(
                codes::TARGET_NOT_FOUND,
                format!("execution {execution_id} has no result for wave {wave_number}"),
            )
        })?;
        Ok(ControlResponse::ok(codes::OK, "wave result", result))
    }

    /// The stored record with live provider state overlaid.
    pub async fn live_view(&self, execution_id: &ExecutionId) -> ControlResult<LiveView> {
        let execution = self.caps.store().get(execution_id).await?;
        let view = self
            .reconciler
            .reconcile(&execution, execution.account_context.as_ref())
            .await
            .map_err(|e| ControlError::provider(&e))?;
        Ok(ControlResponse::ok(codes::OK, "live view", view))
    }

    /// Requests cooperative cancellation, observed by the next tick.
    /// A paused execution has no tick coming and is cancelled directly.
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        execution_id: &ExecutionId,
        reason: Option<String>,
    ) -> ControlResult<Execution> {
        let mutation = self
            .mutate(execution_id, |execution| {
                if execution.is_terminal() {
                    return Err(ControlError::conflict(
                        codes::INVALID_STATE_TRANSITION,
                        format!("execution is {}; nothing to cancel", execution.status),
                    ));
                }
                if execution.cancel_requested {
                    return Ok(CancelKind::AlreadyRequested);
                }

                execution.cancel_requested = true;
                execution.cancel_reason = reason.clone();
                if execution.status == ExecutionStatus::Paused {
                    cancel_in_place(execution, Utc::now());
                    return Ok(CancelKind::Cancelled);
                }
                execution.status = ExecutionStatus::Cancelling;
                Ok(CancelKind::Requested)
            })
            .await?;

        self.emit_transitions(&mutation.before, &mutation.after, ActorType::User, CONTROL_ACTOR);
        let execution = mutation.after;
        Ok(match mutation.value {
            CancelKind::Cancelled => ControlResponse::ok(
                codes::EXECUTION_CANCELLED,
                "paused execution cancelled",
                execution,
            ),
            CancelKind::AlreadyRequested => ControlResponse::accepted(
                codes::CANCEL_REQUESTED,
                "cancellation already requested",
                execution,
            ),
            CancelKind::Requested => ControlResponse::accepted(
                codes::CANCEL_REQUESTED,
                "cancellation requested; applied on the next tick",
                execution,
            ),
        })
    }

    /// Requests a pause at the next wave boundary.
    #[instrument(skip(self))]
    pub async fn pause(&self, execution_id: &ExecutionId) -> ControlResult<Execution> {
        let mutation = self
            .mutate(execution_id, |execution| {
                if execution.is_terminal() || execution.cancel_requested {
                    return Err(ControlError::conflict(
                        codes::INVALID_STATE_TRANSITION,
                        format!("execution is {}; cannot pause", execution.status),
                    ));
                }
                if execution.status == ExecutionStatus::Paused || execution.pause_requested {
                    return Ok(false);
                }
                execution.pause_requested = true;
                Ok(true)
            })
            .await?;

        let message = if mutation.value {
            "pause requested; applied before the next wave"
        } else {
            "pause already in effect"
        };
        Ok(ControlResponse::accepted(
            codes::PAUSE_REQUESTED,
            message,
            mutation.after,
        ))
    }

    /// PAUSED -> POLLING.
    #[instrument(skip(self))]
    pub async fn resume(&self, execution_id: &ExecutionId) -> ControlResult<Execution> {
        let mutation = self
            .mutate(execution_id, |execution| {
                if execution.status != ExecutionStatus::Paused {
                    return Err(ControlError::conflict(
                        codes::INVALID_STATE_TRANSITION,
                        format!("execution is {}; only PAUSED can resume", execution.status),
                    ));
                }

                let wave_number = execution
                    .paused_before_wave
                    .unwrap_or(execution.current_wave_number);
                if let Some(result) = execution.wave_result_mut(wave_number) {
                    if result.status == WaveStatus::Paused {
                        result.status = WaveStatus::NotStarted;
                    }
                }
                execution.paused_before_wave = None;
                execution.pause_requested = false;
                execution.status = ExecutionStatus::Polling;
                Ok(wave_number)
            })
            .await?;

        self.emit_transitions(&mutation.before, &mutation.after, ActorType::User, CONTROL_ACTOR);
        Ok(ControlResponse::ok(
            codes::EXECUTION_RESUMED,
            format!("resuming at wave {}", mutation.value),
            mutation.after,
        ))
    }

    /// Best-effort termination of every recovered instance, grouped by
    /// region. Allowed in any status.
    #[instrument(skip(self))]
    pub async fn terminate_instances(
        &self,
        execution_id: &ExecutionId,
    ) -> ControlResult<TerminationReport> {
        let execution = self.caps.store().get(execution_id).await?;
        let by_region = execution.instance_ids_by_region();
        if by_region.is_empty() {
            return Err(ControlError::bad_request(
                codes::NO_INSTANCES,
                format!("execution {execution_id} has no recovered instances"),
            ));
        }

        let clients = resolve_clients(
            self.caps.broker().as_ref(),
            execution.account_context.as_ref(),
        )
        .await
        .map_err(|e| ControlError::provider(&e))?;

        let mut report = TerminationReport::default();
        for (region, ids) in by_region {
            report.requested += ids.len();
            match clients.compute.terminate_instances(&region, &ids).await {
                Ok(accepted) => {
                    info!(region = %region, requested = ids.len(), accepted = accepted.len(), "Termination requested");
                    report.terminated.extend(accepted);
                }
                Err(e) => {
                    warn!(region = %region, error = %e, "Termination failed in region");
                    report.failed_regions.push(RegionFailure {
                        region: region.clone(),
                        error: e.to_string(),
                    });
                }
            }
            report.regions.push(region);
        }

        if report.terminated.is_empty() && !report.failed_regions.is_empty() {
            return Err(ControlError::bad_gateway("termination failed in every region")
                .with_details(json!({ "failedRegions": report.failed_regions })));
        }

        if report.failed_regions.is_empty() {
            self.mutate(execution_id, |execution| {
                execution.instances_terminated = true;
                Ok(())
            })
            .await?;
        }

        self.publish(
            execution_id,
            ActorType::User,
            CONTROL_ACTOR,
            EventPayload::InstancesTerminated(InstancesTerminatedPayload {
                requested: report.requested as u32,
                regions: report.regions.clone(),
                failed_regions: report
                    .failed_regions
                    .iter()
                    .map(|f| f.region.clone())
                    .collect(),
            }),
        );

        Ok(ControlResponse::accepted(
            codes::TERMINATION_REQUESTED,
            format!(
                "termination requested for {} of {} instances",
                report.terminated.len(),
                report.requested
            ),
            report,
        ))
    }

    /// Idempotent completion. Terminal records come back unchanged.
    #[instrument(skip(self))]
    pub async fn finalize(&self, execution_id: &ExecutionId) -> ControlResult<FinalizeOutcome> {
        let plan = self.caps.store().plan_for(execution_id).await?;
        let mutation = self
            .mutate(execution_id, |execution| {
                if execution.is_terminal() {
                    return Ok(true);
                }

                let unsettled = execution.unsettled_waves(&plan);
                if !unsettled.is_empty() {
                    return Err(ControlError::conflict(
                        codes::WAVES_NOT_COMPLETE,
                        format!("waves not yet terminal: {unsettled:?}"),
                    )
                    .with_details(json!({ "unsettledWaves": unsettled })));
                }

                execution.finish(ExecutionStatus::Completed, Utc::now());
                Ok(false)
            })
            .await?;

        self.emit_transitions(&mutation.before, &mutation.after, ActorType::User, CONTROL_ACTOR);
        let already_finalized = mutation.value;
        let message = if already_finalized {
            "execution already finalized"
        } else {
            "execution finalized"
        };
        let code = if already_finalized {
            codes::ALREADY_FINALIZED
        } else {
            codes::EXECUTION_FINALIZED
        };
        Ok(ControlResponse::ok(
            code,
            message,
            FinalizeOutcome {
                execution: mutation.after,
                already_finalized,
            },
        ))
    }

    // =========================================================================
    // Driver hooks
    // =========================================================================

    /// Loads a fresh snapshot, ticks it once and commits the candidate.
    pub async fn tick(&self, execution_id: &ExecutionId) -> Result<TickReport, StoreError> {
        let snapshot = self.caps.store().get(execution_id).await?;
        let plan = self.caps.store().plan_for(execution_id).await?;
        let outcome = self.scheduler.tick(&snapshot, &plan).await;
        let commit = self.commit_tick(&snapshot, outcome.execution).await?;
        Ok(TickReport {
            commit,
            error: outcome.error,
        })
    }

    /// Persists a tick candidate computed from `before`.
    ///
    /// When a control call wrote in between and the wave state is still what
    /// the tick saw, the candidate is rebased onto the newer control flags.
    /// Any other interleaving discards the candidate; the next tick starts
    /// from the newer record.
    #[instrument(skip_all, fields(execution_id = %before.execution_id))]
    pub async fn commit_tick(
        &self,
        before: &Execution,
        candidate: Execution,
    ) -> Result<CommitOutcome, StoreError> {
        if candidate == *before {
            return Ok(CommitOutcome::Unchanged);
        }
        if candidate.completed_waves < before.completed_waves {
            warn!(
                before = before.completed_waves,
                candidate = candidate.completed_waves,
                "Tick candidate lowers completed waves, discarding"
            );
            return Ok(CommitOutcome::Discarded);
        }

        let store = self.caps.store();
        match store.update(&candidate, before.version).await {
            Ok(stored) => {
                self.emit_transitions(before, &stored, ActorType::System, SCHEDULER_ACTOR);
                return Ok(CommitOutcome::Persisted(stored));
            }
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "Tick lost the conditional update");
            }
            Err(e) => return Err(e),
        }

        let latest = store.get(&before.execution_id).await?;
        let Some(rebased) = rebase(before, candidate, &latest) else {
            info!(version = %latest.version, "Stale tick candidate discarded");
            return Ok(CommitOutcome::Discarded);
        };

        match store.update(&rebased, latest.version).await {
            Ok(stored) => {
                self.emit_transitions(&latest, &stored, ActorType::System, SCHEDULER_ACTOR);
                Ok(CommitOutcome::Persisted(stored))
            }
            Err(e) if e.is_conflict() => Ok(CommitOutcome::Discarded),
            Err(e) => Err(e),
        }
    }

    /// Fails a non-terminal execution and its current wave.
    pub async fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        code: &'static str,
        message: String,
    ) -> ControlResult<Execution> {
        let mutation = self
            .mutate(execution_id, |execution| {
                if execution.is_terminal() {
                    return Ok(());
                }
                let now = Utc::now();
                let wave_number = execution.current_wave_number;
                if let Some(result) = execution.wave_result_mut(wave_number) {
                    if !result.status.is_terminal() {
                        result.settle(WaveStatus::Failed, Some(message.clone()), now);
                    }
                }
                execution.fail(code, message.clone(), now);
                Ok(())
            })
            .await?;

        self.emit_transitions(
            &mutation.before,
            &mutation.after,
            ActorType::System,
            SCHEDULER_ACTOR,
        );
        Ok(ControlResponse::ok(code, "execution failed", mutation.after))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Read-modify-write with conflict retry. Writes nothing when `f` leaves
    /// the record unchanged.
    async fn mutate<T, F>(
        &self,
        execution_id: &ExecutionId,
        mut f: F,
    ) -> Result<Mutation<T>, ControlError>
    where
        F: FnMut(&mut Execution) -> Result<T, ControlError>,
    {
        let store = self.caps.store();
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let before = store.get(execution_id).await?;
            let mut next = before.clone();
            let value = f(&mut next)?;
            if next == before {
                return Ok(Mutation {
                    after: before.clone(),
                    before,
                    value,
                });
            }

            match store.update(&next, before.version).await {
                Ok(after) => {
                    return Ok(Mutation {
                        before,
                        after,
                        value,
                    })
                }
                Err(e) if e.is_conflict() => {
                    debug!(attempt, error = %e, "Control write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControlError::conflict(
            codes::VERSION_CONFLICT,
            format!("execution {execution_id} kept changing; try again"),
        )
        .retryable())
    }

    fn publish(
        &self,
        execution_id: &ExecutionId,
        actor_type: ActorType,
        actor_id: &str,
        payload: EventPayload,
    ) {
        let event_id = EventId::new(self.event_seq.fetch_add(1, Ordering::SeqCst) + 1);
        match ExecutionEvent::builder()
            .event_id(event_id)
            .execution_id(*execution_id)
            .actor(actor_type, actor_id)
            .payload(payload)
            .build()
        {
            Ok(event) => self.caps.notifier().notify(event),
            Err(e) => warn!(error = %e, "Could not build execution event"),
        }
    }

    /// Publishes one event per observable difference between two records.
    fn emit_transitions(
        &self,
        before: &Execution,
        after: &Execution,
        actor_type: ActorType,
        actor_id: &str,
    ) {
        let id = &after.execution_id;

        for result in &after.wave_results {
            let previous = before.wave_result(result.wave_number).map(|r| r.status);
            if previous == Some(result.status) {
                continue;
            }
            if result.status == WaveStatus::InProgress {
                if let Some(job_id) = &result.job_id {
                    self.publish(
                        id,
                        actor_type,
                        actor_id,
                        EventPayload::WaveStarted(WaveStartedPayload {
                            wave_number: result.wave_number,
                            job_id: job_id.clone(),
                            region: result.region.clone(),
                            server_count: result.server_statuses.len() as u32,
                        }),
                    );
                }
            } else if result.status.is_terminal() {
                self.publish(
                    id,
                    actor_type,
                    actor_id,
                    EventPayload::WaveFinished(WaveFinishedPayload {
                        wave_number: result.wave_number,
                        status: result.status,
                        job_id: result.job_id.clone(),
                        message: result.status_message.clone(),
                    }),
                );
            }
        }

        if after.cancel_requested && !before.cancel_requested {
            self.publish(
                id,
                actor_type,
                actor_id,
                EventPayload::CancelRequested(CancelRequestedPayload {
                    reason: after.cancel_reason.clone(),
                }),
            );
        }

        if after.status == before.status {
            return;
        }
        if after.status == ExecutionStatus::Paused {
            if let Some(wave_number) = after.paused_before_wave {
                self.publish(
                    id,
                    actor_type,
                    actor_id,
                    EventPayload::ExecutionPaused(ExecutionPausedPayload {
                        paused_before_wave: wave_number,
                    }),
                );
            }
        } else if before.status == ExecutionStatus::Paused && !after.is_terminal() {
            self.publish(
                id,
                actor_type,
                actor_id,
                EventPayload::ExecutionResumed(ExecutionResumedPayload {
                    resumed_wave: after.current_wave_number,
                }),
            );
        } else if after.is_terminal() {
            self.publish(
                id,
                actor_type,
                actor_id,
                EventPayload::ExecutionFinished(ExecutionFinishedPayload {
                    status: after.status,
                    completed_waves: after.completed_waves,
                    duration_seconds: after.duration_seconds,
                    error_code: after.error_code.clone(),
                    error_message: after.error_message.clone(),
                }),
            );
        }
    }
}

/// Rebases a tick candidate onto a record that only differs from the
/// tick's input in control flags.
fn rebase(before: &Execution, mut candidate: Execution, latest: &Execution) -> Option<Execution> {
    let progress_unchanged = latest.wave_results == before.wave_results
        && latest.completed_waves == before.completed_waves
        && latest.current_wave_number == before.current_wave_number;
    if latest.is_terminal() || !progress_unchanged {
        return None;
    }

    if latest.cancel_requested && !candidate.cancel_requested {
        candidate.cancel_requested = true;
        candidate.cancel_reason = latest.cancel_reason.clone();
        if matches!(
            candidate.status,
            ExecutionStatus::Pending | ExecutionStatus::Polling
        ) {
            candidate.status = ExecutionStatus::Cancelling;
        }
    }

    // A pause the tick consumed stays consumed.
    let pause_consumed = before.pause_requested && !candidate.pause_requested;
    candidate.pause_requested = latest.pause_requested && !pause_consumed;
    candidate.instances_terminated |= latest.instances_terminated;
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use drx_id::PlanId;

    use super::*;
    use crate::model::Wave;

    fn exec() -> Execution {
        let plan = RecoveryPlan::new(
            PlanId::new(),
            "p",
            vec![Wave::new(0, "db", vec!["s-1".to_string()])],
        );
        Execution::pending(&plan, ExecutionType::Drill, "ops", None, Utc::now())
    }

    #[test]
    fn test_rebase_carries_cancel_flag() {
        let before = exec();
        let mut candidate = before.clone();
        candidate.status = ExecutionStatus::Polling;
        let mut latest = before.clone();
        latest.cancel_requested = true;
        latest.status = ExecutionStatus::Cancelling;

        let rebased = rebase(&before, candidate, &latest).unwrap();
        assert!(rebased.cancel_requested);
        assert_eq!(rebased.status, ExecutionStatus::Cancelling);
    }

    #[test]
    fn test_rebase_refuses_diverged_progress() {
        let before = exec();
        let candidate = before.clone();
        let mut latest = before.clone();
        latest.completed_waves = 1;
        assert!(rebase(&before, candidate, &latest).is_none());
    }

    #[test]
    fn test_rebase_keeps_consumed_pause() {
        let mut before = exec();
        before.pause_requested = true;
        let mut candidate = before.clone();
        candidate.pause_requested = false;
        candidate.status = ExecutionStatus::Paused;
        let mut latest = before.clone();
        latest.instances_terminated = true;

        let rebased = rebase(&before, candidate, &latest).unwrap();
        assert!(!rebased.pause_requested);
        assert!(rebased.instances_terminated);
    }
}
