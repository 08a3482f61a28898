//! Data model for plans and executions.
//!
//! Records serialise in camelCase because that is the persisted record
//! shape shared with the execution store and the query surface.

mod execution;
mod plan;

pub use drx_events::{ExecutionStatus, ExecutionType, WaveStatus};
pub use execution::{AccountContext, Execution, LaunchStatus, ServerStatus, WaveResult};
pub use plan::{
    RecoveryPlan, ValidationError, Wave, WaveExecutionType, DEFAULT_MAX_WAIT_SECONDS,
    MAX_WAIT_TIME_SECONDS,
};
