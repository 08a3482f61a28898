//! # drx-id
//!
//! Typed identifiers for the recovery orchestrator.
//!
//! Every identifier the orchestrator mints has the form `{prefix}_{ulid}`:
//!
//! - `plan_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `exec_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The prefix keeps a plan id from being passed where an execution id is
//! expected, and the ULID keeps ids sortable by creation time.
//!
//! Provider-assigned identifiers (recovery job ids, source server ids,
//! instance ids) are opaque strings and are not modelled here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
