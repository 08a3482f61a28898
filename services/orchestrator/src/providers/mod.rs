//! Provider capabilities consumed by the orchestrator.
//!
//! The orchestrator never talks to a cloud SDK directly. It is handed a
//! [`CredentialBroker`] once at startup and asks it for account-scoped
//! [`ProviderClients`] whenever a tick or control call needs remote work:
//!
//! - [`RecoveryJobService`]: start/describe recovery jobs, inspect replication
//! - [`ComputeInstanceService`]: describe/terminate recovered instances
//!
//! Two implementations ship with the crate: an HTTP gateway client and an
//! in-memory mock used by the dev binary and the tests.

mod broker;
mod http;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::LaunchStatus;

pub use broker::{resolve_clients, CredentialBroker, CredentialScope, ProviderClients, StaticBroker};
pub use http::{HttpBroker, HttpProvider};
pub use mock::{MockBroker, MockProvider};

/// Errors surfaced by provider capabilities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, 5xx, network failure. Safe to retry on a later tick.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused the request; retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("credential resolution failed: {0}")]
    Credentials(String),

    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Credentials(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider-side status of a recovery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Completed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipatingServer {
    pub source_server_id: String,
    pub launch_status: LaunchStatus,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub participating_servers: Vec<ParticipatingServer>,
}

/// A non-terminal job as seen by the quota guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub job_id: String,
    pub status: JobStatus,
    pub server_count: usize,
}

/// Replication state reported for a source server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceServer {
    pub source_server_id: String,
    pub replication_state: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Replication state in which a server may be recovered.
pub const HEALTHY_REPLICATION_STATE: &str = "CONTINUOUS";

impl SourceServer {
    pub fn is_healthy(&self) -> bool {
        self.replication_state == HEALTHY_REPLICATION_STATE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescription {
    pub instance_id: String,
    #[serde(default, rename = "type")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
}

/// Recovery job operations.
#[async_trait]
pub trait RecoveryJobService: Send + Sync {
    /// Start one recovery job covering `server_ids`. Returns the job id.
    async fn start_job(&self, region: &str, server_ids: &[String]) -> ProviderResult<String>;

    /// Describe a job. Unknown ids yield [`ProviderError::NotFound`].
    async fn describe_job(&self, region: &str, job_id: &str) -> ProviderResult<JobDescription>;

    /// Every job in the region that has not completed.
    async fn list_active_jobs(&self, region: &str) -> ProviderResult<Vec<ActiveJob>>;

    /// Replication state of the given source servers. Unknown ids are omitted.
    async fn describe_source_servers(
        &self,
        region: &str,
        server_ids: &[String],
    ) -> ProviderResult<Vec<SourceServer>>;
}

/// Compute instance operations.
#[async_trait]
pub trait ComputeInstanceService: Send + Sync {
    async fn describe_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceDescription>>;

    /// Request termination. Returns the ids the provider accepted.
    async fn terminate_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<String>>;
}

/// Shared handle types.
pub type JobServiceRef = Arc<dyn RecoveryJobService>;
pub type ComputeServiceRef = Arc<dyn ComputeInstanceService>;
