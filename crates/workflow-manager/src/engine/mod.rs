//! Workflow execution engine.
//!
//! - **Artifacts**: Resolves declared task artifacts to storage locations
//! - **Context**: Exposes instance state to destination conditions
//! - **Executor**: Creates instances and drives them on task updates

pub mod artifacts;
pub mod context;
pub mod executor;

pub use artifacts::{ArtifactError, ArtifactResolver, ResolveScope};
pub use context::DestinationContext;
pub use executor::{
    child_execution_id, CreateReport, ExecutorConfig, UpdateOutcome, WorkflowExecutor,
};
