//! Control operation results.
//!
//! Every control call answers with an HTTP-style status code, a stable
//! machine code and a human message, so a transport layer can map results
//! one to one.

use serde::Serialize;
use thiserror::Error;

use crate::codes;
use crate::db::StoreError;
use crate::model::Execution;
use crate::providers::ProviderError;

/// Successful control result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse<T> {
    pub status_code: u16,
    pub code: &'static str,
    pub message: String,
    pub data: T,
}

impl<T> ControlResponse<T> {
    pub fn ok(code: &'static str, message: impl Into<String>, data: T) -> Self {
        Self {
            status_code: 200,
            code,
            message: message.into(),
            data,
        }
    }

    /// The request was recorded; its effect lands on a later tick.
    pub fn accepted(code: &'static str, message: impl Into<String>, data: T) -> Self {
        Self {
            status_code: 202,
            code,
            message: message.into(),
            data,
        }
    }
}

/// Failed control result.
#[derive(Debug, Clone, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct ControlError {
    pub status_code: u16,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ControlError {
    fn new(status_code: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status_code,
            code,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(404, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(409, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, codes::INTERNAL_ERROR, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(502, codes::PROVIDER_ERROR, message)
    }

    /// The provider could not serve the request.
    pub fn provider(error: &ProviderError) -> Self {
        let mut err = Self::bad_gateway(error.to_string());
        err.retryable = error.is_retryable();
        err
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(
                codes::EXECUTION_NOT_FOUND,
                format!("execution {id} not found"),
            ),
            StoreError::VersionConflict { .. } => {
                Self::conflict(codes::VERSION_CONFLICT, err.to_string()).retryable()
            }
            other => Self::internal(other.to_string()),
        }
    }
}

pub type ControlResult<T> = Result<ControlResponse<T>, ControlError>;

/// Data returned by `start`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExecution {
    pub execution_id: drx_id::ExecutionId,
    pub plan_id: drx_id::PlanId,
    pub status: crate::model::ExecutionStatus,
    pub total_waves: u32,
}

/// Data returned by `finalize`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub execution: Execution,
    pub already_finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionFailure {
    pub region: String,
    pub error: String,
}

/// Data returned by `terminate_instances`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationReport {
    pub requested: usize,
    pub terminated: Vec<String>,
    pub regions: Vec<String>,
    pub failed_regions: Vec<RegionFailure>,
}
