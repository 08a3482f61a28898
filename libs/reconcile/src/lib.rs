//! Reconciliation primitives for tick-driven state machines.
//!
//! A tick observes remote state once and decides whether a unit of work
//! has converged. Nothing here sleeps or spawns; callers advance time by
//! telling the primitives how much of it passed between observations.
//!
//! # Invariants
//!
//! - Accrued wait time never decreases
//! - Decisions are deterministic given the same inputs
//! - Retry accounting lives with the driver, never inside a tick

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The wait budget was exhausted before convergence.
    #[error("timed out after {elapsed_secs}s (limit {limit_secs}s)")]
    Timeout { elapsed_secs: u64, limit_secs: u64 },

    /// Retries for a resource were exhausted.
    #[error("retries exhausted for {0}")]
    RetriesExhausted(String),
}

/// Convergence status of a unit of remote work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Every participant reached the desired state.
    Converged,

    /// Participants are still moving toward the desired state.
    Converging,

    /// At least one participant settled somewhere other than desired.
    Diverged,

    /// Not enough data to tell.
    Unknown,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }

    /// Returns true once no further observation can change the outcome.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Converged | Self::Diverged)
    }
}

/// Elapsed-time accounting against a fixed wait limit.
///
/// The budget is expressed in whole seconds because it is persisted with
/// the record it guards and restored on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    elapsed_secs: u64,
    limit_secs: u64,
}

impl WaitBudget {
    pub fn new(elapsed_secs: u64, limit_secs: u64) -> Self {
        Self {
            elapsed_secs,
            limit_secs,
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_secs
    }

    pub fn limit_secs(&self) -> u64 {
        self.limit_secs
    }

    /// Adds one observation interval.
    pub fn accrue(&mut self, interval: Duration) {
        self.elapsed_secs = self.elapsed_secs.saturating_add(interval.as_secs());
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed_secs >= self.limit_secs
    }

    /// Returns `Err(Timeout)` once the budget is spent.
    pub fn check(&self) -> Result<(), ReconcileError> {
        if self.is_exhausted() {
            return Err(ReconcileError::Timeout {
                elapsed_secs: self.elapsed_secs,
                limit_secs: self.limit_secs,
            });
        }
        Ok(())
    }
}

/// Retry tracker for failed operations.
///
/// Counts consecutive failures per resource inside a sliding window. A
/// success clears the resource.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,

    /// resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        self.record_failure_at(resource_key, Instant::now())
    }

    fn record_failure_at(&mut self, resource_key: &str, now: Instant) -> bool {
        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded for the resource in the current window.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures
            .get(resource_key)
            .filter(|(_, first)| first.elapsed() <= self.window)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        self.failures(resource_key) > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
    }
}

/// Default interval between ticks of one execution.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry limit for soft tick errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
