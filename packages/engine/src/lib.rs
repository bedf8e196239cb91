//! Media optimisation engine.
//!
//! Detects the payload format, plans a chain of external codec tools and
//! runs it under a cancellation token. Intermediate files live in a scratch
//! directory and are removed when a run ends, however it ends.

pub mod engine;
pub mod error;
pub mod format;
pub mod plan;
pub mod process;
pub mod tools;

pub use engine::{EngineFuture, EngineOutput, EngineRequest, FnEngine, OptimisationEngine, ToolEngine};
pub use error::{EngineError, EngineResult};
pub use format::{MediaFormat, MediaKind, detect_format};
pub use plan::{Step, StepMode, plan};
pub use tools::{Tool, ToolLocator};

pub use tokio_util::sync::CancellationToken;
