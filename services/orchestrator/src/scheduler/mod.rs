//! Wave scheduling.
//!
//! The scheduler is responsible for:
//! - Admitting waves through the quota guard and starting recovery jobs
//! - Polling in-progress jobs and classifying per-server outcomes
//! - Timeouts, cancellation and pause at wave boundaries
//! - Driving active executions on a fixed interval (the tick worker)

mod tick;
mod worker;

pub(crate) use tick::{cancel_in_place, merge_instances, merge_job};
pub use tick::{SchedulerSettings, TickError, TickOutcome, WaveScheduler};
pub use worker::{TickStats, TickWorker};
