//! Workflow definition types.
//!
//! A `WorkflowRevision` is immutable once saved; editing a workflow saves a
//! new revision with the next revision number. Running instances keep the
//! revision they were created from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One saved version of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRevision {
    /// Document id of this revision.
    pub id: String,
    /// Stable workflow id shared by all revisions.
    pub workflow_id: String,
    /// One-based revision number.
    pub revision: i32,
    pub workflow: WorkflowSpec,
}

impl WorkflowRevision {
    /// The task instances start with.
    pub fn first_task(&self) -> Option<&TaskTemplate> {
        self.workflow.tasks.first()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskTemplate> {
        self.workflow.tasks.iter().find(|t| t.id == task_id)
    }
}

/// Workflow body as written by users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub informatics_gateway: InformaticsGateway,
    pub tasks: Vec<TaskTemplate>,
}

fn default_version() -> String {
    "1".to_string()
}

/// Inbound matching rule and allowed export targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InformaticsGateway {
    /// Called AE title that routes requests to this workflow.
    #[serde(default)]
    pub ae_title: Option<String>,
    #[serde(default)]
    pub data_origins: Vec<String>,
    #[serde(default)]
    pub export_destinations: Vec<String>,
}

/// Template of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub artifacts: ArtifactMap,
    #[serde(default)]
    pub task_destinations: Vec<Destination>,
    #[serde(default)]
    pub export_destinations: Vec<Destination>,
    /// Minutes before the task is considered stalled.
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
}

/// Edge to a next task or an export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    /// Routing condition; `None` means the edge is always taken.
    #[serde(default, alias = "conditions")]
    pub condition: Option<String>,
}

impl Destination {
    pub fn to(name: &str) -> Self {
        Self {
            name: name.to_string(),
            condition: None,
        }
    }

    pub fn when(name: &str, condition: &str) -> Self {
        Self {
            name: name.to_string(),
            condition: Some(condition.to_string()),
        }
    }

    /// Blank conditions count as unconditional.
    pub fn condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Declared inputs and outputs of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMap {
    #[serde(default)]
    pub input: Vec<Artifact>,
    #[serde(default)]
    pub output: Vec<Artifact>,
}

/// A named artifact.
///
/// `value` is either a relative path or a reference such as
/// `{{ context.input.dicom }}` or `{{ context.executions.seg.output_dir }}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub value: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool {
    true
}

impl Artifact {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            mandatory: true,
        }
    }
}
