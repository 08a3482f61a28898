//! # drx-events
//!
//! Status vocabulary and notification events for recovery executions.
//!
//! ## Design Principles
//!
//! - Events describe transitions that were already persisted
//! - Delivery is fire-and-forget; nothing waits on a subscriber
//! - Every event belongs to exactly one execution
//! - Status names are the persisted names (`POLLING`, `IN_PROGRESS`, ...)
//!
//! ## Event Types
//!
//! - Execution lifecycle (`execution.*`)
//! - Wave lifecycle (`wave.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
