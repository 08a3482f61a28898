//! The wave state machine.
//!
//! [`WaveScheduler::tick`] takes an execution snapshot and its frozen plan,
//! performs at most one unit of remote work and hands back a candidate next
//! snapshot. It never persists anything: the controller commits the
//! candidate through a conditional update, and a driver outside this module
//! decides when the next tick happens.
//!
//! A tick runs the first step that applies:
//!
//! 1. cancellation requested: settle the current wave CANCELLED, finish
//!    the execution CANCELLED, no remote calls
//! 2. current wave not started: pause if asked to, honour the wave's wait
//!    time, run the quota guard, start the recovery job
//! 3. current wave in progress: describe the job, classify its servers,
//!    accrue wait time or settle the wave, then continue to the next wave
//!    (starting its job in the same tick, never polling it)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use drx_reconcile::{ConvergenceStatus, WaitBudget};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::codes;
use crate::model::{
    Execution, ExecutionStatus, LaunchStatus, RecoveryPlan, ServerStatus, Wave, WaveResult,
    WaveStatus,
};
use crate::providers::{
    resolve_clients, CredentialBroker, InstanceDescription, JobDescription, JobStatus,
    ProviderClients, ProviderError,
};
use crate::quota::{AdmissionError, QuotaGuard};

/// A tick that could not make progress.
///
/// Soft errors leave the snapshot as it was before the failing remote call;
/// the driver decides whether to try again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("could not resolve provider credentials: {0}")]
    Credentials(#[source] ProviderError),

    #[error("admission checks for wave {wave_number} unavailable: {source}")]
    Admission {
        wave_number: u32,
        source: ProviderError,
    },

    #[error("starting the job for wave {wave_number} failed: {source}")]
    JobStart {
        wave_number: u32,
        source: ProviderError,
    },

    #[error("describing job {job_id} failed: {source}")]
    JobDescribe {
        job_id: String,
        source: ProviderError,
    },
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Candidate next snapshot. Equal to the input when nothing changed.
    pub execution: Execution,
    pub error: Option<TickError>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Interval between ticks; also the wait accrued per in-progress tick.
    pub tick_interval: Duration,
    /// Region for waves that do not name one.
    pub default_region: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: drx_reconcile::DEFAULT_TICK_INTERVAL,
            default_region: "us-east-1".to_string(),
        }
    }
}

/// Server tallies for one describe of a wave's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Classification {
    status: ConvergenceStatus,
    total: usize,
    launched: usize,
    failed: usize,
}

/// All LAUNCHED converges. Any terminal failure diverges, as does a job the
/// provider reports COMPLETED while some servers never launched.
fn classify(job: &JobDescription) -> Classification {
    let total = job.participating_servers.len();
    let launched = job
        .participating_servers
        .iter()
        .filter(|s| s.launch_status == LaunchStatus::Launched)
        .count();
    let mut failed = job
        .participating_servers
        .iter()
        .filter(|s| s.launch_status.is_failure())
        .count();

    let status = if launched == total {
        ConvergenceStatus::Converged
    } else if failed > 0 {
        ConvergenceStatus::Diverged
    } else if job.status == JobStatus::Completed {
        failed = total - launched;
        ConvergenceStatus::Diverged
    } else {
        ConvergenceStatus::Converging
    };

    Classification {
        status,
        total,
        launched,
        failed,
    }
}

/// Overlays live launch state onto the recorded server statuses.
pub(crate) fn merge_job(result: &mut WaveResult, job: &JobDescription) {
    for live in &job.participating_servers {
        let idx = match result
            .server_statuses
            .iter()
            .position(|s| s.source_server_id == live.source_server_id)
        {
            Some(idx) => idx,
            None => {
                result
                    .server_statuses
                    .push(ServerStatus::pending(live.source_server_id.clone()));
                result.server_statuses.len() - 1
            }
        };
        let status = &mut result.server_statuses[idx];
        status.launch_status = live.launch_status;
        if live.instance_id.is_some() {
            status.instance_id = live.instance_id.clone();
        }
    }
}

fn fill(slot: &mut Option<String>, live: &Option<String>) {
    if let Some(value) = live {
        *slot = Some(value.clone());
    }
}

/// Merges instance details. Fields the live response omits keep their
/// recorded value.
pub(crate) fn merge_instances(result: &mut WaveResult, instances: &[InstanceDescription]) {
    for instance in instances {
        for status in result
            .server_statuses
            .iter_mut()
            .filter(|s| s.instance_id.as_deref() == Some(instance.instance_id.as_str()))
        {
            fill(&mut status.private_ip, &instance.private_ip);
            fill(&mut status.hostname, &instance.hostname);
            fill(&mut status.instance_type, &instance.instance_type);
            fill(&mut status.instance_state, &instance.state);
            if instance.launch_time.is_some() {
                status.launch_time = instance.launch_time;
            }
            if status.server_name.is_none() {
                status.server_name = instance.hostname.clone();
            }
        }
    }
}

/// Settles the current wave CANCELLED (unless already terminal) and
/// finishes the execution CANCELLED.
pub(crate) fn cancel_in_place(execution: &mut Execution, now: DateTime<Utc>) {
    let message = execution
        .cancel_reason
        .clone()
        .unwrap_or_else(|| "cancelled by request".to_string());
    let wave_number = execution.current_wave_number;
    if let Some(result) = execution.wave_result_mut(wave_number) {
        if !result.status.is_terminal() {
            result.settle(WaveStatus::Cancelled, Some(message), now);
        }
    }
    execution.paused_before_wave = None;
    execution.finish(ExecutionStatus::Cancelled, now);
}

/// Drives executions one bounded step at a time.
pub struct WaveScheduler {
    broker: Arc<dyn CredentialBroker>,
    quota: QuotaGuard,
    settings: SchedulerSettings,
}

impl WaveScheduler {
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        quota: QuotaGuard,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            broker,
            quota,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Advances `snapshot` by at most one unit of remote work.
    #[instrument(
        skip_all,
        fields(execution_id = %snapshot.execution_id, wave_number = snapshot.current_wave_number)
    )]
    pub async fn tick(&self, snapshot: &Execution, plan: &RecoveryPlan) -> TickOutcome {
        let mut execution = snapshot.clone();
        let result = self.step(&mut execution, plan, Utc::now()).await;
        if let Err(e) = &result {
            warn!(error = %e, "Tick could not make progress");
        }
        TickOutcome {
            execution,
            error: result.err(),
        }
    }

    async fn step(
        &self,
        execution: &mut Execution,
        plan: &RecoveryPlan,
        now: DateTime<Utc>,
    ) -> Result<(), TickError> {
        if execution.is_terminal() {
            return Ok(());
        }

        // Flags are read from the snapshot the driver just loaded.
        if execution.cancel_requested {
            info!("Cancellation observed");
            cancel_in_place(execution, now);
            return Ok(());
        }

        if execution.status == ExecutionStatus::Paused {
            debug!("Execution paused, awaiting resume");
            return Ok(());
        }

        let Some(wave) = plan.wave(execution.current_wave_number) else {
            let message = format!(
                "wave {} is not defined in the plan snapshot",
                execution.current_wave_number
            );
            execution.fail(codes::WAVE_NOT_IN_PLAN, message, now);
            return Ok(());
        };

        let (status, partial) = match execution.wave_result(wave.number) {
            Some(result) => (Some(result.status), result.partial_failure),
            None => (None, false),
        };

        match status {
            None | Some(WaveStatus::NotStarted) => self.begin_wave(execution, plan, wave, now).await,
            Some(WaveStatus::InProgress) => self.poll_wave(execution, plan, wave, now).await,
            Some(WaveStatus::Paused) => Ok(()),
            Some(WaveStatus::Completed) => self.advance(execution, plan, wave, now).await,
            Some(WaveStatus::Failed) if partial => self.advance(execution, plan, wave, now).await,
            Some(WaveStatus::Failed) | Some(WaveStatus::Cancelled) => {
                let message = format!("wave {} did not complete", wave.number);
                execution.fail(codes::NO_INSTANCES_LAUNCHED, message, now);
                Ok(())
            }
            Some(WaveStatus::Timeout) => {
                execution.finish(ExecutionStatus::Timeout, now);
                Ok(())
            }
        }
    }

    async fn clients(&self, execution: &Execution) -> Result<ProviderClients, TickError> {
        resolve_clients(self.broker.as_ref(), execution.account_context.as_ref())
            .await
            .map_err(TickError::Credentials)
    }

    /// Pauses, waits, or admits and starts the wave's job.
    async fn begin_wave(
        &self,
        execution: &mut Execution,
        plan: &RecoveryPlan,
        wave: &Wave,
        now: DateTime<Utc>,
    ) -> Result<(), TickError> {
        let region = wave.region_or(&self.settings.default_region).to_string();
        let has_result = execution.wave_result(wave.number).is_some();

        if !has_result && (wave.pause_before_wave || execution.pause_requested) {
            execution.upsert_wave_result(WaveResult::for_wave(wave, &region, WaveStatus::Paused));
            execution.status = ExecutionStatus::Paused;
            execution.paused_before_wave = Some(wave.number);
            execution.pause_requested = false;
            info!(wave_number = wave.number, "Paused before wave");
            return Ok(());
        }

        if wave.wait_time_seconds > 0 {
            let previous_end = plan
                .previous_wave(wave.number)
                .and_then(|p| execution.wave_result(p.number))
                .and_then(|r| r.end_time);
            if let Some(previous_end) = previous_end {
                let Some(ready_at) = ready_after(previous_end, wave.wait_time_seconds) else {
                    let message = format!(
                        "wave {} waitTimeSeconds {} is out of range",
                        wave.number, wave.wait_time_seconds
                    );
                    warn!(wave_number = wave.number, "Wait time cannot be scheduled");
                    execution.fail(codes::VALIDATION_ERROR, message, now);
                    return Ok(());
                };
                if now < ready_at {
                    debug!(wave_number = wave.number, ready_at = %ready_at, "Waiting before wave");
                    return Ok(());
                }
            }
        }

        let clients = self.clients(execution).await?;

        match self
            .quota
            .admit_wave(clients.jobs.as_ref(), &region, wave.number, &wave.server_ids)
            .await
        {
            Ok(()) => {}
            Err(AdmissionError::Violation(violation)) => {
                warn!(wave_number = wave.number, code = violation.code(), reason = %violation, "Wave refused admission");
                let mut result = WaveResult::for_wave(wave, &region, WaveStatus::NotStarted);
                result.settle(WaveStatus::Failed, Some(violation.to_string()), now);
                execution.upsert_wave_result(result);
                execution.fail(violation.code(), violation.to_string(), now);
                return Ok(());
            }
            Err(AdmissionError::Provider(source)) => {
                return Err(TickError::Admission {
                    wave_number: wave.number,
                    source,
                });
            }
        }

        let job_id = match clients.jobs.start_job(&region, &wave.server_ids).await {
            Ok(job_id) => job_id,
            Err(source @ (ProviderError::Rejected(_) | ProviderError::NotFound(_))) => {
                warn!(wave_number = wave.number, error = %source, "Recovery job refused");
                let mut result = WaveResult::for_wave(wave, &region, WaveStatus::NotStarted);
                result.settle(WaveStatus::Failed, Some(source.to_string()), now);
                execution.upsert_wave_result(result);
                execution.fail(codes::JOB_START_REJECTED, source.to_string(), now);
                return Ok(());
            }
            Err(source) => {
                return Err(TickError::JobStart {
                    wave_number: wave.number,
                    source,
                });
            }
        };

        let mut result = WaveResult::for_wave(wave, &region, WaveStatus::InProgress);
        result.job_id = Some(job_id.clone());
        result.start_time = Some(now);
        result.server_statuses = wave.server_ids.iter().map(ServerStatus::pending).collect();
        execution.upsert_wave_result(result);
        execution.status = ExecutionStatus::Polling;
        execution.paused_before_wave = None;

        info!(
            wave_number = wave.number,
            job_id = %job_id,
            region = %region,
            servers = wave.server_ids.len(),
            "Started recovery job"
        );
        Ok(())
    }

    /// Describes the wave's job and settles or accrues wait.
    async fn poll_wave(
        &self,
        execution: &mut Execution,
        plan: &RecoveryPlan,
        wave: &Wave,
        now: DateTime<Utc>,
    ) -> Result<(), TickError> {
        let Some(recorded) = execution.wave_result(wave.number) else {
            return Ok(());
        };
        let job_id = recorded.job_id.clone();
        let region = recorded.region.clone();
        let mut budget = WaitBudget::new(recorded.elapsed_seconds, wave.max_wait_seconds);

        let Some(job_id) = job_id else {
            fail_wave(execution, wave.number, codes::JOB_ID_MISSING, "no job id recorded", now);
            return Ok(());
        };

        if budget.is_exhausted() {
            time_out(execution, wave.number, &budget, now);
            return Ok(());
        }

        let clients = self.clients(execution).await?;
        let job = match clients.jobs.describe_job(&region, &job_id).await {
            Ok(job) => job,
            Err(ProviderError::NotFound(_)) => {
                fail_wave(execution, wave.number, codes::JOB_NOT_FOUND, "job not found", now);
                return Ok(());
            }
            Err(source) => return Err(TickError::JobDescribe { job_id, source }),
        };

        if job.participating_servers.is_empty() {
            fail_wave(
                execution,
                wave.number,
                codes::NO_PARTICIPATING_SERVERS,
                "no participating servers",
                now,
            );
            return Ok(());
        }

        let verdict = classify(&job);
        if let Some(result) = execution.wave_result_mut(wave.number) {
            merge_job(result, &job);
        }

        match verdict.status {
            ConvergenceStatus::Converged => {
                self.enrich(&clients, execution, wave.number, &region).await;
                if let Some(result) = execution.wave_result_mut(wave.number) {
                    result.settle(WaveStatus::Completed, None, now);
                }
                info!(wave_number = wave.number, job_id = %job_id, servers = verdict.total, "Wave completed");
                self.advance(execution, plan, wave, now).await
            }
            ConvergenceStatus::Diverged if verdict.launched > 0 => {
                self.enrich(&clients, execution, wave.number, &region).await;
                let message = format!(
                    "partial failure: {} of {} servers launched, {} failed",
                    verdict.launched, verdict.total, verdict.failed
                );
                if let Some(result) = execution.wave_result_mut(wave.number) {
                    result.settle(WaveStatus::Failed, Some(message.clone()), now);
                    result.partial_failure = true;
                }
                warn!(wave_number = wave.number, job_id = %job_id, reason = %message, "Wave partially failed");
                self.advance(execution, plan, wave, now).await
            }
            ConvergenceStatus::Diverged => {
                fail_wave(
                    execution,
                    wave.number,
                    codes::NO_INSTANCES_LAUNCHED,
                    "no recovery instances created",
                    now,
                );
                Ok(())
            }
            ConvergenceStatus::Converging | ConvergenceStatus::Unknown => {
                budget.accrue(self.settings.tick_interval);
                if let Some(result) = execution.wave_result_mut(wave.number) {
                    result.elapsed_seconds = budget.elapsed_secs();
                }
                if budget.is_exhausted() {
                    time_out(execution, wave.number, &budget, now);
                } else {
                    debug!(
                        wave_number = wave.number,
                        launched = verdict.launched,
                        total = verdict.total,
                        elapsed_secs = budget.elapsed_secs(),
                        "Wave still in progress"
                    );
                }
                Ok(())
            }
        }
    }

    /// Best-effort instance enrichment; failures only cost detail.
    async fn enrich(
        &self,
        clients: &ProviderClients,
        execution: &mut Execution,
        wave_number: u32,
        region: &str,
    ) {
        let Some(result) = execution.wave_result_mut(wave_number) else {
            return;
        };
        let ids = result.instance_ids();
        if ids.is_empty() {
            return;
        }
        match clients.compute.describe_instances(region, &ids).await {
            Ok(instances) => merge_instances(result, &instances),
            Err(e) => {
                warn!(wave_number, error = %e, "Instance details unavailable, keeping recorded fields");
            }
        }
    }

    /// Moves past a settled wave: finish, or begin the next wave.
    async fn advance(
        &self,
        execution: &mut Execution,
        plan: &RecoveryPlan,
        wave: &Wave,
        now: DateTime<Utc>,
    ) -> Result<(), TickError> {
        execution.completed_waves = (execution.completed_waves + 1).min(execution.total_waves);

        match plan.next_wave(wave.number) {
            None => {
                let status = if execution.has_partial_failure() {
                    ExecutionStatus::Partial
                } else {
                    ExecutionStatus::Completed
                };
                execution.finish(status, now);
                info!(status = %status, completed_waves = execution.completed_waves, "Execution finished");
                Ok(())
            }
            Some(next) => {
                execution.current_wave_number = next.number;
                execution.status = ExecutionStatus::Polling;
                self.begin_wave(execution, plan, next, now).await
            }
        }
    }
}

/// `start + seconds`, or `None` when the instant is not representable.
fn ready_after(start: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let delay = TimeDelta::try_seconds(i64::try_from(seconds).ok()?)?;
    start.checked_add_signed(delay)
}

fn fail_wave(
    execution: &mut Execution,
    wave_number: u32,
    code: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    if let Some(result) = execution.wave_result_mut(wave_number) {
        result.settle(WaveStatus::Failed, Some(message.to_string()), now);
    }
    warn!(wave_number, code, reason = message, "Wave failed");
    execution.fail(code, format!("wave {wave_number}: {message}"), now);
}

fn time_out(execution: &mut Execution, wave_number: u32, budget: &WaitBudget, now: DateTime<Utc>) {
    let message = match budget.check() {
        Err(e) => format!("wave {wave_number} {e}"),
        Ok(()) => format!("wave {wave_number} timed out"),
    };
    if let Some(result) = execution.wave_result_mut(wave_number) {
        result.settle(WaveStatus::Timeout, Some(message.clone()), now);
    }
    warn!(wave_number, elapsed_secs = budget.elapsed_secs(), "Wave timed out");
    execution.error_code = Some(codes::WAVE_TIMEOUT.to_string());
    execution.error_message = Some(message);
    execution.finish(ExecutionStatus::Timeout, now);
}
