//! Workflow definitions: revision types and the YAML parser.

pub mod parser;
pub mod types;

pub use parser::{parse_workflow, validate_workflow, WorkflowFile};
pub use types::*;
