//! Stable machine codes carried by control responses and failed executions.

// Control operations.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const EXECUTION_NOT_FOUND: &str = "EXECUTION_NOT_FOUND";
pub const TARGET_NOT_FOUND: &str = "TARGET_NOT_FOUND";
pub const PLAN_ALREADY_EXECUTING: &str = "PLAN_ALREADY_EXECUTING";
pub const INVALID_STATE_TRANSITION: &str = "INVALID_STATE_TRANSITION";
pub const WAVES_NOT_COMPLETE: &str = "WAVES_NOT_COMPLETE";
pub const VERSION_CONFLICT: &str = "VERSION_CONFLICT";
pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
pub const NO_INSTANCES: &str = "NO_INSTANCES";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

// Success codes.
pub const EXECUTION_STARTED: &str = "EXECUTION_STARTED";
pub const CANCEL_REQUESTED: &str = "CANCEL_REQUESTED";
pub const EXECUTION_CANCELLED: &str = "EXECUTION_CANCELLED";
pub const PAUSE_REQUESTED: &str = "PAUSE_REQUESTED";
pub const EXECUTION_RESUMED: &str = "EXECUTION_RESUMED";
pub const TERMINATION_REQUESTED: &str = "TERMINATION_REQUESTED";
pub const EXECUTION_FINALIZED: &str = "EXECUTION_FINALIZED";
pub const ALREADY_FINALIZED: &str = "ALREADY_FINALIZED";
pub const OK: &str = "OK";

// Tick failures recorded on the execution.
pub const JOB_NOT_FOUND: &str = "JOB_NOT_FOUND";
pub const JOB_ID_MISSING: &str = "JOB_ID_MISSING";
pub const NO_PARTICIPATING_SERVERS: &str = "NO_PARTICIPATING_SERVERS";
pub const NO_INSTANCES_LAUNCHED: &str = "NO_INSTANCES_LAUNCHED";
pub const JOB_START_REJECTED: &str = "JOB_START_REJECTED";
pub const WAVE_TIMEOUT: &str = "WAVE_TIMEOUT";
pub const WAVE_NOT_IN_PLAN: &str = "WAVE_NOT_IN_PLAN";
pub const PROVIDER_RETRIES_EXHAUSTED: &str = "PROVIDER_RETRIES_EXHAUSTED";
