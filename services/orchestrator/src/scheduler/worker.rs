//! Tick driver.
//!
//! Loads every active execution on a periodic interval, ticks it once and
//! commits the result through the controller. Soft tick errors are retried
//! on later passes under one fixed policy for job start and job describe;
//! once that policy is spent the execution is failed.

use std::sync::Arc;
use std::time::Duration;

use drx_id::ExecutionId;
use drx_reconcile::{ReconcileError, RetryTracker};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::codes;
use crate::controller::{CommitOutcome, ExecutionController};
use crate::db::StoreError;

/// Counters for one pass over the active executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub executions: usize,
    pub persisted: usize,
    pub unchanged: usize,
    pub discarded: usize,
    pub soft_errors: usize,
    pub retries_exhausted: usize,
    pub failed: usize,
}

/// Periodic driver for the wave scheduler.
pub struct TickWorker {
    controller: Arc<ExecutionController>,
    interval: Duration,
    retries: Mutex<RetryTracker>,
}

impl TickWorker {
    pub fn new(
        controller: Arc<ExecutionController>,
        interval: Duration,
        max_retries: u32,
        retry_window: Duration,
    ) -> Self {
        Self {
            controller,
            interval,
            retries: Mutex::new(RetryTracker::new(max_retries, retry_window)),
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting tick worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats.executions > 0 => {
                            info!(
                                executions = stats.executions,
                                persisted = stats.persisted,
                                discarded = stats.discarded,
                                soft_errors = stats.soft_errors,
                                retries_exhausted = stats.retries_exhausted,
                                "Tick pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Tick pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Tick worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Ticks every active execution once.
    pub async fn run_once(&self) -> Result<TickStats, StoreError> {
        let active = self
            .controller
            .capabilities()
            .store()
            .list_active()
            .await?;
        let mut stats = TickStats {
            executions: active.len(),
            ..TickStats::default()
        };

        for execution in active {
            self.drive(&execution.execution_id, &mut stats).await;
        }

        self.retries.lock().await.prune();
        Ok(stats)
    }

    async fn drive(&self, execution_id: &ExecutionId, stats: &mut TickStats) {
        let report = match self.controller.tick(execution_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Tick failed before commit");
                stats.failed += 1;
                return;
            }
        };

        match &report.commit {
            CommitOutcome::Persisted(_) => stats.persisted += 1,
            CommitOutcome::Unchanged => stats.unchanged += 1,
            CommitOutcome::Discarded => stats.discarded += 1,
        }

        let key = execution_id.to_string();
        let Some(tick_error) = report.error else {
            self.retries.lock().await.clear(&key);
            return;
        };

        stats.soft_errors += 1;
        let exhausted = self.retries.lock().await.record_failure(&key);
        if !exhausted {
            debug!(execution_id = %execution_id, error = %tick_error, "Soft tick error, retrying next pass");
            return;
        }

        stats.retries_exhausted += 1;
        let reason = ReconcileError::RetriesExhausted(tick_error.to_string());
        warn!(execution_id = %execution_id, error = %reason, "Failing execution");
        if let Err(e) = self
            .controller
            .fail_execution(execution_id, codes::PROVIDER_RETRIES_EXHAUSTED, reason.to_string())
            .await
        {
            error!(execution_id = %execution_id, error = %e, "Could not record exhausted retries");
            return;
        }
        self.retries.lock().await.clear(&key);
    }
}
