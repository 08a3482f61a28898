//! Execution records, wave results and per-server status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use drx_events::{ExecutionStatus, ExecutionType, WaveStatus};
use drx_id::{ExecutionId, PlanId, RecordVersion};
use serde::{Deserialize, Serialize};

use super::plan::{RecoveryPlan, Wave};

/// Identity and credential scope for provider calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountContext {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub is_current_account: bool,
}

impl AccountContext {
    pub fn current(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            assume_role_name: None,
            external_id: None,
            is_current_account: true,
        }
    }

    pub fn cross_account(
        account_id: impl Into<String>,
        role: impl Into<String>,
        external_id: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            assume_role_name: Some(role.into()),
            external_id,
            is_current_account: false,
        }
    }
}

/// Launch state of one source server inside a recovery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchStatus {
    Pending,
    InProgress,
    Launched,
    Failed,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl LaunchStatus {
    /// Terminal states other than a successful launch.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Launched | Self::Failed | Self::Terminated)
    }
}

/// Per-server outcome inside a wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub source_server_id: String,
    pub launch_status: LaunchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<DateTime<Utc>>,
}

impl ServerStatus {
    pub fn pending(source_server_id: impl Into<String>) -> Self {
        Self {
            source_server_id: source_server_id.into(),
            launch_status: LaunchStatus::Pending,
            instance_id: None,
            server_name: None,
            private_ip: None,
            hostname: None,
            instance_type: None,
            instance_state: None,
            launch_time: None,
        }
    }
}

/// Execution-level record of one wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveResult {
    pub wave_number: u32,
    pub wave_name: String,
    pub status: WaveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub region: String,
    #[serde(default)]
    pub server_statuses: Vec<ServerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wait accrued while the job was in progress.
    #[serde(default)]
    pub elapsed_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Some servers launched and some failed.
    #[serde(default)]
    pub partial_failure: bool,
}

impl WaveResult {
    pub fn for_wave(wave: &Wave, region: &str, status: WaveStatus) -> Self {
        Self {
            wave_number: wave.number,
            wave_name: wave.name.clone(),
            status,
            job_id: None,
            region: region.to_string(),
            server_statuses: Vec::new(),
            start_time: None,
            end_time: None,
            elapsed_seconds: 0,
            status_message: None,
            partial_failure: false,
        }
    }

    /// Moves the wave into a terminal status.
    pub fn settle(&mut self, status: WaveStatus, message: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.status_message = message;
        self.end_time = Some(now);
    }

    /// Instance ids of launched servers.
    pub fn instance_ids(&self) -> Vec<String> {
        self.server_statuses
            .iter()
            .filter_map(|s| s.instance_id.clone())
            .collect()
    }
}

/// One run of a recovery plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub plan_id: PlanId,
    pub status: ExecutionStatus,
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_context: Option<AccountContext>,
    pub initiated_by: String,
    pub current_wave_number: u32,
    pub completed_waves: u32,
    pub total_waves: u32,
    #[serde(default)]
    pub wave_results: Vec<WaveResult>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_before_wave: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub instances_terminated: bool,
    pub version: RecordVersion,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh PENDING execution positioned at the plan's first wave.
    pub fn pending(
        plan: &RecoveryPlan,
        execution_type: ExecutionType,
        initiated_by: impl Into<String>,
        account_context: Option<AccountContext>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            plan_id: plan.plan_id,
            status: ExecutionStatus::Pending,
            execution_type,
            account_context,
            initiated_by: initiated_by.into(),
            current_wave_number: plan.first_wave().map(|w| w.number).unwrap_or_default(),
            completed_waves: 0,
            total_waves: plan.total_waves(),
            wave_results: Vec::new(),
            start_time: now,
            end_time: None,
            duration_seconds: None,
            paused_before_wave: None,
            error_code: None,
            error_message: None,
            cancel_requested: false,
            cancel_reason: None,
            pause_requested: false,
            instances_terminated: false,
            version: RecordVersion::INITIAL,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn wave_result(&self, wave_number: u32) -> Option<&WaveResult> {
        self.wave_results.iter().find(|r| r.wave_number == wave_number)
    }

    pub fn wave_result_mut(&mut self, wave_number: u32) -> Option<&mut WaveResult> {
        self.wave_results
            .iter_mut()
            .find(|r| r.wave_number == wave_number)
    }

    pub fn current_wave_result(&self) -> Option<&WaveResult> {
        self.wave_result(self.current_wave_number)
    }

    /// Inserts or replaces a wave result, keeping results ordered by wave number.
    pub fn upsert_wave_result(&mut self, result: WaveResult) {
        match self
            .wave_results
            .binary_search_by_key(&result.wave_number, |r| r.wave_number)
        {
            Ok(idx) => self.wave_results[idx] = result,
            Err(idx) => self.wave_results.insert(idx, result),
        }
    }

    pub fn has_partial_failure(&self) -> bool {
        self.wave_results.iter().any(|r| r.partial_failure)
    }

    /// Plan waves without a terminal result, including waves that never started.
    pub fn unsettled_waves(&self, plan: &RecoveryPlan) -> Vec<u32> {
        plan.waves
            .iter()
            .map(|w| w.number)
            .filter(|&n| !self.wave_result(n).is_some_and(|r| r.status.is_terminal()))
            .collect()
    }

    /// Launched instance ids grouped by region.
    pub fn instance_ids_by_region(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_region: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for result in &self.wave_results {
            let ids = result.instance_ids();
            if !ids.is_empty() {
                by_region
                    .entry(result.region.clone())
                    .or_default()
                    .extend(ids);
            }
        }
        by_region
    }

    /// Moves the execution into a terminal status and stamps its duration.
    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(now);
        self.duration_seconds = Some((now - self.start_time).num_seconds().max(0));
    }

    /// Finishes as FAILED with a machine code and message.
    pub fn fail(&mut self, code: &str, message: impl Into<String>, now: DateTime<Utc>) {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.into());
        self.finish(ExecutionStatus::Failed, now);
    }
}
