//! Structural checks on inbound events.

use thiserror::Error;

use crate::events::{ExportCompleteEvent, TaskUpdateEvent, WorkflowRequestEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("request names neither workflows nor a called AE title")]
    NoWorkflowTarget,

    #[error("workflow id at position {0} is blank")]
    BlankWorkflowId(usize),
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

pub fn validate_request(event: &WorkflowRequestEvent) -> Result<(), ValidationError> {
    require(&event.payload_id, "payload_id")?;
    require(&event.bucket, "bucket")?;
    require(&event.correlation_id, "correlation_id")?;

    if let Some(index) = event.workflows.iter().position(|w| w.trim().is_empty()) {
        return Err(ValidationError::BlankWorkflowId(index));
    }

    let has_ae_title = event
        .called_ae_title
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    if event.workflows.is_empty() && !has_ae_title {
        return Err(ValidationError::NoWorkflowTarget);
    }
    Ok(())
}

pub fn validate_update(event: &TaskUpdateEvent) -> Result<(), ValidationError> {
    require(&event.workflow_instance_id, "workflow_instance_id")?;
    require(&event.task_id, "task_id")?;
    require(&event.execution_id, "execution_id")?;
    require(&event.correlation_id, "correlation_id")
}

pub fn validate_export_complete(event: &ExportCompleteEvent) -> Result<(), ValidationError> {
    require(&event.workflow_instance_id, "workflow_instance_id")?;
    require(&event.export_task_id, "export_task_id")
}
