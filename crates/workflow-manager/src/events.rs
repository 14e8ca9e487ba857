//! Message bodies exchanged over the bus.
//!
//! Bodies are carried inside a [`crate::nats::Message`] envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{ArtifactLocation, FailureReason, TaskExecutionStatus};
use crate::workflow::Artifact;

/// Inbound request to start workflows for a payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRequestEvent {
    #[serde(default)]
    pub payload_id: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub calling_ae_title: Option<String>,
    #[serde(default)]
    pub called_ae_title: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Explicit workflow ids; take precedence over the called AE title.
    #[serde(default)]
    pub workflows: Vec<String>,
    /// Study metadata extracted at ingest, including DICOM tags keyed as
    /// `GGGG,EEEE`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Progress or result reported by a task runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdateEvent {
    #[serde(default)]
    pub workflow_instance_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub correlation_id: String,
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub reason: FailureReason,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub execution_stats: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: Vec<Artifact>,
}

impl TaskUpdateEvent {
    /// Whether this update was synthesized by the timeout supervisor.
    pub fn is_timeout(&self) -> bool {
        self.reason == FailureReason::TimedOut
    }
}

/// Outcome of an export as reported by the exporter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportCompleteStatus {
    Success,
    Failure,
    PartialFailure,
    #[serde(other)]
    Unknown,
}

/// Completion of an export branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportCompleteEvent {
    #[serde(default)]
    pub workflow_instance_id: String,
    /// Execution id of the task whose outputs were exported.
    #[serde(default)]
    pub export_task_id: String,
    /// Destination closed by this event; all pending ones when absent.
    #[serde(default)]
    pub destination: Option<String>,
    pub status: ExportCompleteStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub file_statuses: HashMap<String, String>,
}

/// Instruction for a runner to execute a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDispatchEvent {
    pub workflow_instance_id: String,
    pub task_id: String,
    pub execution_id: String,
    pub task_type: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub input_artifacts: HashMap<String, ArtifactLocation>,
    #[serde(default)]
    pub output_artifacts: HashMap<String, ArtifactLocation>,
    pub bucket: String,
    pub payload_id: String,
    pub correlation_id: String,
}

/// Request for a runner to stop a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCancellationEvent {
    pub workflow_instance_id: String,
    pub task_id: String,
    pub execution_id: String,
    /// Runner identity taken from the task's `IdentityKey` statistic.
    #[serde(default)]
    pub target_identity: Option<String>,
    pub reason: FailureReason,
    #[serde(default)]
    pub message: Option<String>,
}

/// Request for an exporter to send task outputs to a destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRequestEvent {
    pub workflow_instance_id: String,
    pub export_task_id: String,
    pub destination: String,
    pub files: Vec<ArtifactLocation>,
    pub correlation_id: String,
}
