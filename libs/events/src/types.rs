//! Status enums and event payloads.

use drx_id::PlanId;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

pub mod event_types {
    pub const EXECUTION_STARTED: &str = "execution.started";
    pub const EXECUTION_PAUSED: &str = "execution.paused";
    pub const EXECUTION_RESUMED: &str = "execution.resumed";
    pub const EXECUTION_CANCEL_REQUESTED: &str = "execution.cancel_requested";
    pub const EXECUTION_FINISHED: &str = "execution.finished";
    pub const EXECUTION_INSTANCES_TERMINATED: &str = "execution.instances_terminated";

    pub const WAVE_STARTED: &str = "wave.started";
    pub const WAVE_FINISHED: &str = "wave.finished";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Execution-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Polling,
    Paused,
    Cancelling,
    Cancelled,
    Completed,
    Partial,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Polling => "POLLING",
            Self::Paused => "PAUSED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Completed | Self::Partial | Self::Failed | Self::Timeout
        )
    }

    /// Statuses the tick driver keeps advancing.
    pub fn is_driven(&self) -> bool {
        matches!(self, Self::Pending | Self::Polling | Self::Cancelling)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-wave status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaveStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Paused,
}

impl WaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl std::fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drill (non-destructive test) or recovery (production failover).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Drill,
    Recovery,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drill => "DRILL",
            Self::Recovery => "RECOVERY",
        }
    }
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStartedPayload {
    pub plan_id: PlanId,
    pub execution_type: ExecutionType,
    pub initiated_by: String,
    pub total_waves: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPausedPayload {
    pub paused_before_wave: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResumedPayload {
    pub resumed_wave: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequestedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFinishedPayload {
    pub status: ExecutionStatus,
    pub completed_waves: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesTerminatedPayload {
    pub requested: u32,
    pub regions: Vec<String>,
    pub failed_regions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveStartedPayload {
    pub wave_number: u32,
    pub job_id: String,
    pub region: String,
    pub server_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveFinishedPayload {
    pub wave_number: u32,
    pub status: WaveStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Any notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    ExecutionStarted(ExecutionStartedPayload),
    ExecutionPaused(ExecutionPausedPayload),
    ExecutionResumed(ExecutionResumedPayload),
    CancelRequested(CancelRequestedPayload),
    ExecutionFinished(ExecutionFinishedPayload),
    InstancesTerminated(InstancesTerminatedPayload),
    WaveStarted(WaveStartedPayload),
    WaveFinished(WaveFinishedPayload),
}

impl EventPayload {
    /// The `event_types` constant matching this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted(_) => event_types::EXECUTION_STARTED,
            Self::ExecutionPaused(_) => event_types::EXECUTION_PAUSED,
            Self::ExecutionResumed(_) => event_types::EXECUTION_RESUMED,
            Self::CancelRequested(_) => event_types::EXECUTION_CANCEL_REQUESTED,
            Self::ExecutionFinished(_) => event_types::EXECUTION_FINISHED,
            Self::InstancesTerminated(_) => event_types::EXECUTION_INSTANCES_TERMINATED,
            Self::WaveStarted(_) => event_types::WAVE_STARTED,
            Self::WaveFinished(_) => event_types::WAVE_FINISHED,
        }
    }
}
