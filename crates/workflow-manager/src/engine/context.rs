//! Runtime values visible to destination conditions.

use crate::conditions::ParameterResolver;
use crate::db::models::WorkflowInstance;

use super::artifacts::input_dir;

/// Resolves `{{ context.* }}` placeholders against an instance.
///
/// Supported references:
///
/// - `context.correlation_id`, `context.workflow_instance_id`, `context.workflow_id`
/// - `context.input.payload_id`, `context.input.bucket`, `context.input.dicom`
/// - `context.input.<key>` from the request metadata
/// - `context.dicom.tags[('gggg','eeee')]` from the request metadata key `GGGG,EEEE`
/// - `context.executions.<task>.{execution_id,status,task_type,output_dir,previous_task_id}`
/// - `context.executions.<task>.execution_stats.<key>`
/// - `context.executions.<task>.result.<key>`
/// - `context.executions.<task>.artifacts.<name>`
///
/// `<task>` is a task id; the most recent execution of that task is used.
pub struct DestinationContext<'a> {
    instance: &'a WorkflowInstance,
}

impl<'a> DestinationContext<'a> {
    pub fn new(instance: &'a WorkflowInstance) -> Self {
        Self { instance }
    }

    fn execution_value(&self, rest: &str) -> Option<String> {
        let (task_id, field) = rest.split_once('.')?;
        let task = self.instance.latest_execution_of(task_id)?;

        match field {
            "execution_id" => return Some(task.execution_id.clone()),
            "status" => return Some(task.status.as_str().to_string()),
            "task_type" => return Some(task.task_type.clone()),
            "output_dir" => return Some(task.output_dir.clone()),
            "previous_task_id" => return task.previous_task_id.clone(),
            _ => {}
        }

        let (group, key) = field.split_once('.')?;
        match group {
            "execution_stats" => task.execution_stats.get(key).cloned(),
            "result" => task.result_metadata.get(key).map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            "artifacts" => task.output_artifacts.get(key).map(|l| l.path.clone()),
            _ => None,
        }
    }
}

impl ParameterResolver for DestinationContext<'_> {
    fn resolve(&self, reference: &str) -> Option<String> {
        let path = reference.strip_prefix("context.")?;

        match path {
            "correlation_id" => return Some(self.instance.correlation_id.clone()),
            "workflow_instance_id" => return Some(self.instance.id.clone()),
            "workflow_id" => return Some(self.instance.workflow_id.clone()),
            "input.payload_id" => return Some(self.instance.payload_id.clone()),
            "input.bucket" => return Some(self.instance.bucket_id.clone()),
            "input.dicom" => return Some(input_dir(&self.instance.payload_id)),
            _ => {}
        }

        if let Some(rest) = path.strip_prefix("executions.") {
            return self.execution_value(rest);
        }

        if let Some(selector) = path.strip_prefix("dicom.tags") {
            let key = dicom_tag_key(selector)?;
            return self.instance.input_metadata.get(&key).cloned();
        }

        path.strip_prefix("input.")
            .and_then(|key| self.instance.input_metadata.get(key).cloned())
    }
}

/// Normalize `[('0010','0040')]` to `0010,0040`.
fn dicom_tag_key(selector: &str) -> Option<String> {
    let inner = selector
        .trim()
        .strip_prefix('[')?
        .strip_suffix(']')?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let (group, element) = inner.split_once(',')?;

    let part = |raw: &str| {
        let hex = raw.trim().trim_matches(|c| c == '\'' || c == '"');
        (hex.len() == 4 && hex.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| hex.to_ascii_uppercase())
    };

    Some(format!("{},{}", part(group)?, part(element)?))
}
