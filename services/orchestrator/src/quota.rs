//! Quota guard: admission limits checked before a recovery job is started.
//!
//! Wave size is a local, exact check. The concurrent-job and in-flight
//! server checks read live provider state and fail open when the provider
//! cannot answer, since they protect against overload rather than
//! correctness. Replication health is never skipped.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{RecoveryPlan, ValidationError};
use crate::providers::{ActiveJob, ProviderError, RecoveryJobService};

pub const DEFAULT_MAX_SERVERS_PER_JOB: usize = 100;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 20;
pub const DEFAULT_MAX_SERVERS_IN_ALL_JOBS: usize = 500;

/// Replication state reported for ids the provider does not know.
const MISSING_REPLICATION_STATE: &str = "NOT_FOUND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub max_servers_per_job: usize,
    pub max_concurrent_jobs: usize,
    pub max_servers_in_all_jobs: usize,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_servers_per_job: DEFAULT_MAX_SERVERS_PER_JOB,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            max_servers_in_all_jobs: DEFAULT_MAX_SERVERS_IN_ALL_JOBS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrentJobsCheck {
    pub valid: bool,
    pub current_jobs: usize,
    pub max_jobs: usize,
    pub available_slots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServersInFlightCheck {
    pub valid: bool,
    pub current_servers: usize,
    pub total_after: usize,
    pub max: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhealthyServer {
    pub source_server_id: String,
    pub replication_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationCheck {
    pub valid: bool,
    pub unhealthy: Vec<UnhealthyServer>,
}

/// Why a wave was refused admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaViolation {
    #[error("wave {wave_number} has {server_count} servers, the per-job limit is {max}")]
    WaveTooLarge {
        wave_number: u32,
        server_count: usize,
        max: usize,
    },

    #[error("{current} recovery jobs already active in {region}, the limit is {max}")]
    ConcurrentJobs {
        region: String,
        current: usize,
        max: usize,
    },

    #[error("{total_after} servers would be in flight in {region}, the limit is {max}")]
    ServersInFlight {
        region: String,
        total_after: usize,
        max: usize,
    },

    #[error("servers without healthy replication: {}", .servers.join(", "))]
    UnhealthyReplication { servers: Vec<String> },
}

impl QuotaViolation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::WaveTooLarge { .. } => "WAVE_SIZE_EXCEEDED",
            Self::ConcurrentJobs { .. } => "CONCURRENT_JOBS_EXCEEDED",
            Self::ServersInFlight { .. } => "SERVERS_IN_FLIGHT_EXCEEDED",
            Self::UnhealthyReplication { .. } => "UNHEALTHY_REPLICATION",
        }
    }
}

/// Admission outcome other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Violation(#[from] QuotaViolation),

    /// A check that may not fail open could not be answered.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A region's active jobs as read for one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveJobs {
    Listed(Vec<ActiveJob>),
    /// The provider could not list jobs; load checks fail open.
    Unavailable(String),
}

#[derive(Debug, Clone, Default)]
pub struct QuotaGuard {
    limits: QuotaLimits,
}

impl QuotaGuard {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Flags every wave above the per-job server cap.
    pub fn validate_wave_sizes(&self, plan: &RecoveryPlan) -> Vec<ValidationError> {
        let max = self.limits.max_servers_per_job;
        plan.waves
            .iter()
            .filter(|w| w.server_ids.len() > max)
            .map(|w| ValidationError::WaveTooLarge {
                wave_number: w.number,
                server_count: w.server_ids.len(),
                max,
            })
            .collect()
    }

    /// Lists the region's active jobs once; both load checks read this snapshot.
    pub async fn active_jobs(&self, jobs: &dyn RecoveryJobService, region: &str) -> ActiveJobs {
        match jobs.list_active_jobs(region).await {
            Ok(active) => ActiveJobs::Listed(active),
            Err(e) => {
                warn!(region, error = %e, "Active jobs unavailable, load checks admit");
                ActiveJobs::Unavailable(e.to_string())
            }
        }
    }

    /// Counts active jobs against the concurrent job cap.
    pub fn validate_concurrent_jobs(&self, active: &ActiveJobs) -> ConcurrentJobsCheck {
        let max = self.limits.max_concurrent_jobs;
        match active {
            ActiveJobs::Listed(jobs) => {
                let current = jobs.len();
                ConcurrentJobsCheck {
                    valid: current < max,
                    current_jobs: current,
                    max_jobs: max,
                    available_slots: max.saturating_sub(current),
                    warning: None,
                }
            }
            ActiveJobs::Unavailable(reason) => ConcurrentJobsCheck {
                valid: true,
                current_jobs: 0,
                max_jobs: max,
                available_slots: max,
                warning: Some(format!("could not verify concurrent jobs: {reason}")),
            },
        }
    }

    /// Sums servers across active jobs plus `additional` against the global cap.
    pub fn validate_servers_in_flight(
        &self,
        active: &ActiveJobs,
        additional: usize,
    ) -> ServersInFlightCheck {
        let max = self.limits.max_servers_in_all_jobs;
        match active {
            ActiveJobs::Listed(jobs) => {
                let current: usize = jobs.iter().map(|j| j.server_count).sum();
                let total_after = current.saturating_add(additional);
                ServersInFlightCheck {
                    valid: total_after <= max,
                    current_servers: current,
                    total_after,
                    max,
                    warning: None,
                }
            }
            ActiveJobs::Unavailable(reason) => ServersInFlightCheck {
                valid: true,
                current_servers: 0,
                total_after: additional,
                max,
                warning: Some(format!("could not verify servers in flight: {reason}")),
            },
        }
    }

    /// Every server must report a healthy replication state.
    pub async fn validate_replication_health(
        &self,
        jobs: &dyn RecoveryJobService,
        region: &str,
        server_ids: &[String],
    ) -> Result<ReplicationCheck, ProviderError> {
        let reported = jobs.describe_source_servers(region, server_ids).await?;
        let states: HashMap<&str, &str> = reported
            .iter()
            .map(|s| (s.source_server_id.as_str(), s.replication_state.as_str()))
            .collect();

        let unhealthy: Vec<UnhealthyServer> = server_ids
            .iter()
            .filter_map(|id| {
                let state = states
                    .get(id.as_str())
                    .copied()
                    .unwrap_or(MISSING_REPLICATION_STATE);
                (state != crate::providers::HEALTHY_REPLICATION_STATE).then(|| UnhealthyServer {
                    source_server_id: id.clone(),
                    replication_state: state.to_string(),
                })
            })
            .collect();

        Ok(ReplicationCheck {
            valid: unhealthy.is_empty(),
            unhealthy,
        })
    }

    /// Runs every admission check for one wave, cheapest first.
    pub async fn admit_wave(
        &self,
        jobs: &dyn RecoveryJobService,
        region: &str,
        wave_number: u32,
        server_ids: &[String],
    ) -> Result<(), AdmissionError> {
        let max = self.limits.max_servers_per_job;
        if server_ids.len() > max {
            return Err(QuotaViolation::WaveTooLarge {
                wave_number,
                server_count: server_ids.len(),
                max,
            }
            .into());
        }

        let active = self.active_jobs(jobs, region).await;

        let concurrent = self.validate_concurrent_jobs(&active);
        if !concurrent.valid {
            return Err(QuotaViolation::ConcurrentJobs {
                region: region.to_string(),
                current: concurrent.current_jobs,
                max: concurrent.max_jobs,
            }
            .into());
        }

        let in_flight = self.validate_servers_in_flight(&active, server_ids.len());
        if !in_flight.valid {
            return Err(QuotaViolation::ServersInFlight {
                region: region.to_string(),
                total_after: in_flight.total_after,
                max: in_flight.max,
            }
            .into());
        }

        let replication = self
            .validate_replication_health(jobs, region, server_ids)
            .await?;
        if !replication.valid {
            return Err(QuotaViolation::UnhealthyReplication {
                servers: replication
                    .unhealthy
                    .into_iter()
                    .map(|s| format!("{} ({})", s.source_server_id, s.replication_state))
                    .collect(),
            }
            .into());
        }

        debug!(
            region,
            wave_number,
            available_slots = concurrent.available_slots,
            "Wave admitted"
        );
        Ok(())
    }
}
