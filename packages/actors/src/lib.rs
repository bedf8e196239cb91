//! Actor system for the optimisation job manager.
//!
//! # Architecture
//!
//! - `ManagerActor` - Owns every job record, the FIFO queue and the undo
//!   stack; the only place state transitions happen
//! - `WorkerActor` - Backs up the original and runs the optimisation engine
//!   for one job at a time, reporting back by message
//! - `JobManager` - Cloneable handle with async methods over the manager
//!
//! # Usage
//!
//! ```ignore
//! use actors::start_manager;
//!
//! let manager = start_manager(config, engine, backups, None).await?;
//! let id = manager.submit_file("shot.png", OptimiseOptions::default()).await?;
//! let mut events = manager.subscribe();
//! ```

mod error;
mod handle;
mod manager_actor;
mod messages;
mod worker_actor;

pub use error::ManagerError;
pub use handle::{JobManager, start_manager};
pub use manager_actor::{ManagerActor, ManagerSnapshot};
pub use messages::{ManagerMessage, TerminalHook, WorkerMessage};
pub use worker_actor::{JOBS_DIR, WorkerActor, job_dir};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
