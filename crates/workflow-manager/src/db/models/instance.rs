//! Workflow instance and task execution documents.
//!
//! An instance is one run of one workflow revision for one payload. Its tasks
//! are stored in dispatch order; the instance `version` increases on every
//! write and guards status and export bookkeeping updates.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Dispatched,
    Succeeded,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Dispatched => "dispatched",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task execution status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    Created,
    Dispatched,
    Accepted,
    Succeeded,
    Failed,
    Canceled,
    /// Finished with partial results; waits for an external decision.
    PartialFail,
}

/// Statuses the timeout supervisor watches.
pub const ACTIVE_STATUSES: [TaskExecutionStatus; 3] = [
    TaskExecutionStatus::Created,
    TaskExecutionStatus::Dispatched,
    TaskExecutionStatus::Accepted,
];

impl TaskExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskExecutionStatus::Created => "created",
            TaskExecutionStatus::Dispatched => "dispatched",
            TaskExecutionStatus::Accepted => "accepted",
            TaskExecutionStatus::Succeeded => "succeeded",
            TaskExecutionStatus::Failed => "failed",
            TaskExecutionStatus::Canceled => "canceled",
            TaskExecutionStatus::PartialFail => "partial_fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskExecutionStatus::Succeeded
                | TaskExecutionStatus::Failed
                | TaskExecutionStatus::Canceled
        )
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(self)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Dispatched -> Succeeded` is allowed because the runner's `Accepted`
    /// update may arrive after its result.
    pub fn can_transition_to(&self, next: TaskExecutionStatus) -> bool {
        use TaskExecutionStatus::*;
        match self {
            Created => next != Created,
            Dispatched => matches!(next, Accepted | Succeeded | Failed | Canceled | PartialFail),
            Accepted => matches!(next, Succeeded | Failed | Canceled | PartialFail),
            PartialFail => matches!(next, Succeeded | Failed | Canceled),
            Succeeded | Failed | Canceled => false,
        }
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskExecutionStatus::Created),
            "dispatched" => Ok(TaskExecutionStatus::Dispatched),
            "accepted" => Ok(TaskExecutionStatus::Accepted),
            "succeeded" => Ok(TaskExecutionStatus::Succeeded),
            "failed" => Ok(TaskExecutionStatus::Failed),
            "canceled" => Ok(TaskExecutionStatus::Canceled),
            "partial_fail" => Ok(TaskExecutionStatus::PartialFail),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[default]
    None,
    TimedOut,
    Rejected,
    PluginError,
    ExternalServiceError,
    Unavailable,
    MissingArtifacts,
    Unknown,
}

/// State of one export branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Succeeded,
    Failed,
    PartialFailure,
}

/// Export bookkeeping for a destination taken by a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportExecution {
    pub destination: String,
    pub status: ExportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExportExecution {
    pub fn pending(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            status: ExportStatus::Pending,
            message: None,
        }
    }
}

/// Fully-qualified storage location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub bucket: String,
    pub path: String,
}

impl ArtifactLocation {
    pub fn new(bucket: &str, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.to_string(),
            path: path.into(),
        }
    }
}

/// One dispatch attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub execution_id: String,
    pub task_id: String,
    pub task_type: String,
    pub workflow_instance_id: String,
    #[serde(default)]
    pub previous_task_id: Option<String>,
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub reason: FailureReason,
    #[serde(default)]
    pub failure_message: Option<String>,
    pub task_start_time: DateTime<Utc>,
    #[serde(default)]
    pub task_end_time: Option<DateTime<Utc>>,
    /// Deadline after which the supervisor fails the task.
    pub timeout: DateTime<Utc>,
    /// Runner statistics; `IdentityKey` addresses cancellations.
    #[serde(default)]
    pub execution_stats: HashMap<String, String>,
    #[serde(default)]
    pub result_metadata: HashMap<String, serde_json::Value>,
    pub output_dir: String,
    #[serde(default)]
    pub input_artifacts: HashMap<String, ArtifactLocation>,
    #[serde(default)]
    pub output_artifacts: HashMap<String, ArtifactLocation>,
    #[serde(default)]
    pub exports: Vec<ExportExecution>,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

impl TaskExecution {
    pub fn identity(&self) -> Option<&str> {
        self.execution_stats.get(IDENTITY_KEY).map(String::as_str)
    }

    pub fn has_pending_exports(&self) -> bool {
        self.exports.iter().any(|e| e.status == ExportStatus::Pending)
    }

    pub fn has_failed_exports(&self) -> bool {
        self.exports
            .iter()
            .any(|e| matches!(e.status, ExportStatus::Failed | ExportStatus::PartialFailure))
    }
}

/// Execution statistics key holding the runner identity.
pub const IDENTITY_KEY: &str = "IdentityKey";

/// A running or finished workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: String,
    #[serde(default)]
    pub ae_title: Option<String>,
    pub workflow_name: String,
    pub workflow_id: String,
    pub revision: i32,
    pub payload_id: String,
    pub bucket_id: String,
    pub correlation_id: String,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub input_metadata: HashMap<String, String>,
    /// Tasks in dispatch order.
    pub tasks: Vec<TaskExecution>,
    /// Compare-and-swap counter.
    #[serde(default)]
    pub version: i64,
}

impl WorkflowInstance {
    pub fn task(&self, execution_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.execution_id == execution_id)
    }

    pub fn task_mut(&mut self, execution_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.execution_id == execution_id)
    }

    /// Most recent execution of a task template.
    pub fn latest_execution_of(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().rev().find(|t| t.task_id == task_id)
    }

    /// Status the instance should move to given its tasks, if any.
    ///
    /// Any failed or canceled task fails the instance. The instance succeeds
    /// only when every task succeeded and every export branch is closed
    /// without failure.
    pub fn evaluate_completion(&self) -> Option<Status> {
        if self.tasks.iter().any(|t| {
            matches!(
                t.status,
                TaskExecutionStatus::Failed | TaskExecutionStatus::Canceled
            ) || t.has_failed_exports()
        }) {
            return Some(Status::Failed);
        }

        let done = !self.tasks.is_empty()
            && self.tasks.iter().all(|t| {
                t.status == TaskExecutionStatus::Succeeded && !t.has_pending_exports()
            });

        done.then_some(Status::Succeeded)
    }
}
