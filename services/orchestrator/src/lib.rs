//! drx orchestrator library.
//!
//! This crate primarily ships a `drx-orchestrator` binary, but we expose the
//! core as a library so the controller, scheduler and stores can be driven
//! from integration tests and embedded in other transports.

pub mod codes;
pub mod config;
pub mod controller;
pub mod db;
pub mod model;
pub mod notify;
pub mod providers;
pub mod quota;
pub mod reconciler;
pub mod scheduler;
pub mod state;
