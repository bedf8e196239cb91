//! Core domain types for the optimisation job manager.
//!
//! This crate contains shared types used across all packages:
//! - JobRecord and JobState for optimisation jobs
//! - JobStore for the active list and the undo stack
//! - Events for real-time updates
//! - ManagerConfig for tuning the manager

mod config;
mod events;
mod job;
mod store;

pub use config::{ConfigError, ManagerConfig};
pub use events::JobEvent;
pub use job::{
    JobId, JobRecord, JobSource, JobState, OptimiseOptions, OptimisedOutput, TransitionError,
};
pub use store::JobStore;
