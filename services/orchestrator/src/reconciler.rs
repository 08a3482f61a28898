//! Read-side reconciler.
//!
//! Answers reads with live provider state overlaid on a copy of the stored
//! execution. It never writes and never touches wave or execution status,
//! so it can run alongside ticks without coordination.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::model::{AccountContext, Execution};
use crate::providers::{resolve_clients, CredentialBroker, CredentialScope, ProviderError};
use crate::scheduler::{merge_instances, merge_job};

/// A stored execution with live server details overlaid.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveView {
    pub execution: Execution,
    pub scope: CredentialScope,
    /// The record had no account context; the caller's credentials were used.
    pub compatibility_fallback: bool,
    pub refreshed_waves: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct LiveReconciler {
    broker: Arc<dyn CredentialBroker>,
}

impl LiveReconciler {
    pub fn new(broker: Arc<dyn CredentialBroker>) -> Self {
        Self { broker }
    }

    /// Re-fetches job and instance state for every unsettled wave with a job.
    #[instrument(skip_all, fields(execution_id = %execution.execution_id))]
    pub async fn reconcile(
        &self,
        execution: &Execution,
        account_context: Option<&AccountContext>,
    ) -> Result<LiveView, ProviderError> {
        let clients = resolve_clients(self.broker.as_ref(), account_context).await?;
        let mut view = execution.clone();
        let mut refreshed_waves = Vec::new();
        let mut warnings = Vec::new();

        for result in view
            .wave_results
            .iter_mut()
            .filter(|r| !r.status.is_terminal())
        {
            let Some(job_id) = result.job_id.clone() else {
                continue;
            };

            match clients.jobs.describe_job(&result.region, &job_id).await {
                Ok(job) => merge_job(result, &job),
                Err(e) => {
                    warn!(wave_number = result.wave_number, job_id = %job_id, error = %e, "Live job state unavailable");
                    warnings.push(format!("wave {}: {e}", result.wave_number));
                    continue;
                }
            }

            let ids = result.instance_ids();
            if !ids.is_empty() {
                match clients.compute.describe_instances(&result.region, &ids).await {
                    Ok(instances) => merge_instances(result, &instances),
                    Err(e) => {
                        warnings.push(format!("wave {} instances: {e}", result.wave_number));
                    }
                }
            }
            refreshed_waves.push(result.wave_number);
        }

        debug!(refreshed = refreshed_waves.len(), "Live view assembled");
        Ok(LiveView {
            execution: view,
            compatibility_fallback: clients.scope.is_fallback(),
            scope: clients.scope,
            refreshed_waves,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use drx_events::ExecutionType;
    use drx_id::PlanId;

    use super::*;
    use crate::model::{LaunchStatus, RecoveryPlan, ServerStatus, Wave, WaveResult, WaveStatus};
    use crate::providers::{MockBroker, MockProvider, RecoveryJobService};

    #[tokio::test]
    async fn test_live_view_overlays_without_changing_status() {
        let provider = Arc::new(MockProvider::new());
        let broker = Arc::new(MockBroker::new(provider.clone()));
        let reconciler = LiveReconciler::new(broker);

        let plan = RecoveryPlan::new(
            PlanId::new(),
            "p",
            vec![Wave::new(0, "db", vec!["s-1".to_string()])],
        );
        let mut exec = Execution::pending(&plan, ExecutionType::Drill, "ops", None, Utc::now());
        let job_id = provider
            .start_job("us-east-1", &["s-1".to_string()])
            .await
            .unwrap();
        let mut result = WaveResult::for_wave(&plan.waves[0], "us-east-1", WaveStatus::InProgress);
        result.job_id = Some(job_id.clone());
        result.server_statuses.push(ServerStatus::pending("s-1"));
        exec.upsert_wave_result(result);
        provider.launch_all(&job_id);

        let view = reconciler.reconcile(&exec, None).await.unwrap();
        assert!(view.compatibility_fallback);
        assert_eq!(view.refreshed_waves, vec![0]);
        assert_eq!(view.execution.status, exec.status);
        let live = view.execution.wave_result(0).unwrap();
        assert_eq!(live.status, WaveStatus::InProgress);
        assert_eq!(live.server_statuses[0].launch_status, LaunchStatus::Launched);
        assert!(live.server_statuses[0].private_ip.is_some());

        // The input snapshot is untouched.
        assert_eq!(
            exec.wave_result(0).unwrap().server_statuses[0].launch_status,
            LaunchStatus::Pending
        );
    }
}
