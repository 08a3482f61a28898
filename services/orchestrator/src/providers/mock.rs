//! In-memory provider for development and tests.
//!
//! Jobs stay in progress until a test (or the auto-launch setting used by
//! the dev binary) moves their servers forward. Every remote operation is
//! counted so callers can assert how many round-trips a tick made.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{
    ActiveJob, ComputeInstanceService, CredentialBroker, CredentialScope, InstanceDescription,
    JobDescription, JobStatus, ParticipatingServer, ProviderClients, ProviderError,
    ProviderResult, RecoveryJobService, SourceServer, HEALTHY_REPLICATION_STATE,
};
use crate::model::{AccountContext, LaunchStatus};

#[derive(Debug, Clone)]
struct MockJob {
    region: String,
    status: JobStatus,
    servers: Vec<ParticipatingServer>,
    describes: u32,
}

#[derive(Debug, Default)]
struct MockState {
    next_job: u64,
    next_instance: u64,
    jobs: HashMap<String, MockJob>,
    job_order: Vec<String>,
    instances: HashMap<String, InstanceDescription>,
    replication: HashMap<String, String>,
    fail_next_start: Option<ProviderError>,
    fail_describes: Option<ProviderError>,
    fail_list: Option<ProviderError>,
    fail_terminate_regions: HashSet<String>,
    terminated: Vec<String>,
}

/// Mock recovery provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,

    /// Launch every server of a job once it has been described this many times.
    auto_launch_after: Option<u32>,

    start_calls: AtomicUsize,
    describe_job_calls: AtomicUsize,
    describe_instance_calls: AtomicUsize,
    list_active_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose jobs launch on their own after `describes` polls.
    pub fn with_auto_launch(describes: u32) -> Self {
        Self {
            auto_launch_after: Some(describes),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Overrides a server's replication state. Servers without an override
    /// report CONTINUOUS.
    pub fn set_replication_state(&self, server_id: &str, state: &str) {
        self.state()
            .replication
            .insert(server_id.to_string(), state.to_string());
    }

    /// Launches every server of the job and completes it.
    pub fn launch_all(&self, job_id: &str) {
        let mut state = self.state();
        let server_ids: Vec<String> = match state.jobs.get(job_id) {
            Some(job) => job
                .servers
                .iter()
                .map(|s| s.source_server_id.clone())
                .collect(),
            None => return,
        };
        for server_id in server_ids {
            launch_server_locked(&mut state, job_id, &server_id);
        }
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = JobStatus::Completed;
        }
    }

    /// Launches one server of the job.
    pub fn launch_server(&self, job_id: &str, server_id: &str) {
        launch_server_locked(&mut self.state(), job_id, server_id);
    }

    /// Marks one server of the job as failed to launch.
    pub fn fail_server(&self, job_id: &str, server_id: &str) {
        let mut state = self.state();
        if let Some(job) = state.jobs.get_mut(job_id) {
            for server in job
                .servers
                .iter_mut()
                .filter(|s| s.source_server_id == server_id)
            {
                server.launch_status = LaunchStatus::Failed;
            }
        }
    }

    /// Sets the job-level status without touching its servers.
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = self.state().jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Drops the job so later describes return not-found.
    pub fn forget_job(&self, job_id: &str) {
        self.state().jobs.remove(job_id);
    }

    /// Empties the job's participating server list.
    pub fn clear_participants(&self, job_id: &str) {
        if let Some(job) = self.state().jobs.get_mut(job_id) {
            job.servers.clear();
        }
    }

    /// Registers a job started outside this orchestrator.
    pub fn seed_active_job(&self, region: &str, server_count: usize) -> String {
        let mut state = self.state();
        let servers = (0..server_count)
            .map(|i| ParticipatingServer {
                source_server_id: format!("s-external-{i}"),
                launch_status: LaunchStatus::Pending,
                instance_id: None,
            })
            .collect();
        insert_job(&mut state, region, servers)
    }

    pub fn fail_next_start(&self, error: ProviderError) {
        self.state().fail_next_start = Some(error);
    }

    pub fn fail_describes(&self, error: Option<ProviderError>) {
        self.state().fail_describes = error;
    }

    pub fn fail_list_jobs(&self, error: Option<ProviderError>) {
        self.state().fail_list = error;
    }

    pub fn fail_terminate_in(&self, region: &str) {
        self.state()
            .fail_terminate_regions
            .insert(region.to_string());
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Job ids in creation order.
    pub fn job_ids(&self) -> Vec<String> {
        self.state().job_order.clone()
    }

    pub fn last_job_id(&self) -> Option<String> {
        self.state().job_order.last().cloned()
    }

    pub fn terminated_instances(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn describe_job_calls(&self) -> usize {
        self.describe_job_calls.load(Ordering::SeqCst)
    }

    pub fn describe_instance_calls(&self) -> usize {
        self.describe_instance_calls.load(Ordering::SeqCst)
    }

    pub fn list_active_calls(&self) -> usize {
        self.list_active_calls.load(Ordering::SeqCst)
    }
}

fn insert_job(state: &mut MockState, region: &str, servers: Vec<ParticipatingServer>) -> String {
    state.next_job += 1;
    let job_id = format!("drsjob-{:04}", state.next_job);
    state.jobs.insert(
        job_id.clone(),
        MockJob {
            region: region.to_string(),
            status: JobStatus::Started,
            servers,
            describes: 0,
        },
    );
    state.job_order.push(job_id.clone());
    job_id
}

fn launch_server_locked(state: &mut MockState, job_id: &str, server_id: &str) {
    let Some(job) = state.jobs.get(job_id) else {
        return;
    };
    let already = job
        .servers
        .iter()
        .any(|s| s.source_server_id == server_id && s.instance_id.is_some());
    if already {
        return;
    }

    state.next_instance += 1;
    let n = state.next_instance;
    let instance_id = format!("i-{n:017x}");
    let octets = (n / 256 % 256, n % 256);
    state.instances.insert(
        instance_id.clone(),
        InstanceDescription {
            instance_id: instance_id.clone(),
            instance_type: Some("m5.large".to_string()),
            state: Some("running".to_string()),
            private_ip: Some(format!("10.0.{}.{}", octets.0, octets.1)),
            hostname: Some(format!("ip-10-0-{}-{}.ec2.internal", octets.0, octets.1)),
            launch_time: Some(Utc::now()),
        },
    );

    if let Some(job) = state.jobs.get_mut(job_id) {
        for server in job
            .servers
            .iter_mut()
            .filter(|s| s.source_server_id == server_id)
        {
            server.launch_status = LaunchStatus::Launched;
            server.instance_id = Some(instance_id.clone());
        }
    }
}

#[async_trait]
impl RecoveryJobService for MockProvider {
    async fn start_job(&self, region: &str, server_ids: &[String]) -> ProviderResult<String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.fail_next_start.take() {
            return Err(error);
        }

        let servers = server_ids
            .iter()
            .map(|id| ParticipatingServer {
                source_server_id: id.clone(),
                launch_status: LaunchStatus::Pending,
                instance_id: None,
            })
            .collect();
        let job_id = insert_job(&mut state, region, servers);
        info!(job_id = %job_id, region, servers = server_ids.len(), "[MOCK] Started recovery job");
        Ok(job_id)
    }

    async fn describe_job(&self, _region: &str, job_id: &str) -> ProviderResult<JobDescription> {
        self.describe_job_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.fail_describes.clone() {
            return Err(error);
        }

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProviderError::NotFound(format!("job {job_id}")))?;
        job.describes += 1;
        let due = self
            .auto_launch_after
            .is_some_and(|after| job.describes >= after);

        if due && job.status != JobStatus::Completed {
            debug!(job_id, "[MOCK] Auto-launching job servers");
            let server_ids: Vec<String> = job
                .servers
                .iter()
                .map(|s| s.source_server_id.clone())
                .collect();
            for server_id in server_ids {
                launch_server_locked(&mut state, job_id, &server_id);
            }
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.status = JobStatus::Completed;
            }
        }

        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| ProviderError::NotFound(format!("job {job_id}")))?;
        Ok(JobDescription {
            job_id: job_id.to_string(),
            status: job.status,
            participating_servers: job.servers.clone(),
        })
    }

    async fn list_active_jobs(&self, region: &str) -> ProviderResult<Vec<ActiveJob>> {
        self.list_active_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if let Some(error) = state.fail_list.clone() {
            return Err(error);
        }

        Ok(state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|job| (id, job)))
            .filter(|(_, job)| job.region == region && job.status.is_active())
            .map(|(id, job)| ActiveJob {
                job_id: id.clone(),
                status: job.status,
                server_count: job.servers.len(),
            })
            .collect())
    }

    async fn describe_source_servers(
        &self,
        _region: &str,
        server_ids: &[String],
    ) -> ProviderResult<Vec<SourceServer>> {
        let state = self.state();
        Ok(server_ids
            .iter()
            .map(|id| SourceServer {
                source_server_id: id.clone(),
                replication_state: state
                    .replication
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| HEALTHY_REPLICATION_STATE.to_string()),
                hostname: None,
            })
            .collect())
    }
}

#[async_trait]
impl ComputeInstanceService for MockProvider {
    async fn describe_instances(
        &self,
        _region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceDescription>> {
        self.describe_instance_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(instance_ids
            .iter()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect())
    }

    async fn terminate_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<String>> {
        let mut state = self.state();
        if state.fail_terminate_regions.contains(region) {
            return Err(ProviderError::Transient(format!(
                "terminate throttled in {region}"
            )));
        }

        let mut accepted = Vec::new();
        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.state = Some("shutting-down".to_string());
                accepted.push(id.clone());
            }
        }
        state.terminated.extend(accepted.iter().cloned());
        Ok(accepted)
    }
}

/// Broker over a single [`MockProvider`].
#[derive(Debug, Default)]
pub struct MockBroker {
    provider: Arc<MockProvider>,
    resolved: Mutex<Vec<String>>,
    fail_resolve: Mutex<Option<ProviderError>>,
}

impl MockBroker {
    pub fn new(provider: Arc<MockProvider>) -> Self {
        Self {
            provider,
            resolved: Mutex::new(Vec::new()),
            fail_resolve: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<MockProvider> {
        &self.provider
    }

    /// Makes every resolution fail until cleared with `None`.
    pub fn fail_resolve(&self, error: Option<ProviderError>) {
        *self
            .fail_resolve
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Account ids resolved so far.
    pub fn resolved_accounts(&self) -> Vec<String> {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clients(&self, scope: CredentialScope) -> ProviderClients {
        ProviderClients {
            jobs: self.provider.clone(),
            compute: self.provider.clone(),
            scope,
        }
    }
}

#[async_trait]
impl CredentialBroker for MockBroker {
    async fn resolve(&self, context: &AccountContext) -> ProviderResult<ProviderClients> {
        let failure = self
            .fail_resolve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }

        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context.account_id.clone());
        Ok(self.clients(CredentialScope::Account {
            account_id: context.account_id.clone(),
        }))
    }

    fn caller_clients(&self) -> ProviderClients {
        self.clients(CredentialScope::CallerFallback)
    }
}
