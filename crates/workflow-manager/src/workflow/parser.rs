//! Workflow YAML parser.
//!
//! A workflow file carries the stable workflow id and the workflow body:
//!
//! ```yaml
//! workflow_id: liver-seg
//! workflow:
//!   name: liver segmentation
//!   informatics_gateway:
//!     ae_title: MONAISCU
//!     export_destinations: [PACS]
//!   tasks:
//!     - id: seg
//!       type: argo
//!       task_destinations:
//!         - name: report
//!           condition: "{{ context.executions.seg.result.organ }} == 'liver'"
//! ```
//!
//! Validation covers structure only; conditions are parsed here so broken
//! syntax is caught at load time, but placeholders resolve at run time.

use std::collections::HashSet;

use serde::Deserialize;

use crate::conditions::{ConditionError, Expression};
use crate::error::{AppError, AppResult};
use crate::workflow::types::{Destination, WorkflowSpec};

/// Parsed content of a workflow definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    pub workflow_id: String,
    pub workflow: WorkflowSpec,
}

/// Parse a YAML string into a workflow file.
pub fn parse_workflow(yaml_content: &str) -> AppResult<WorkflowFile> {
    let file: WorkflowFile =
        serde_yaml::from_str(yaml_content).map_err(|e| AppError::Parse(e.to_string()))?;

    if file.workflow_id.trim().is_empty() {
        return Err(AppError::Validation(
            "workflow_id must not be empty".to_string(),
        ));
    }

    validate_workflow(&file.workflow)?;

    Ok(file)
}

/// Validate a parsed workflow body.
pub fn validate_workflow(workflow: &WorkflowSpec) -> AppResult<()> {
    if workflow.name.trim().is_empty() {
        return Err(AppError::Validation(
            "Workflow name must not be empty".to_string(),
        ));
    }

    if workflow.tasks.is_empty() {
        return Err(AppError::Validation(format!(
            "Workflow '{}' has no tasks",
            workflow.name
        )));
    }

    let mut seen = HashSet::new();
    for task in &workflow.tasks {
        if task.id.trim().is_empty() {
            return Err(AppError::Validation("Task id must not be empty".to_string()));
        }
        if task.task_type.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Task '{}': type must not be empty",
                task.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate task id: {}",
                task.id
            )));
        }
        if let Some(minutes) = task.timeout_minutes {
            if minutes <= 0 {
                return Err(AppError::Validation(format!(
                    "Task '{}': timeout_minutes must be positive",
                    task.id
                )));
            }
        }
    }

    let allowed_exports = &workflow.informatics_gateway.export_destinations;

    for task in &workflow.tasks {
        reject_duplicate_destinations(&task.id, "destination", &task.task_destinations)?;
        reject_duplicate_destinations(&task.id, "export destination", &task.export_destinations)?;

        for dest in &task.task_destinations {
            if !seen.contains(dest.name.as_str()) {
                return Err(AppError::Validation(format!(
                    "Task '{}': destination '{}' does not reference a task",
                    task.id, dest.name
                )));
            }
            if dest.name == task.id {
                return Err(AppError::Validation(format!(
                    "Task '{}': destination must not reference itself",
                    task.id
                )));
            }
            validate_condition(dest, &task.id)?;
        }

        for dest in &task.export_destinations {
            if !allowed_exports.is_empty() && !allowed_exports.contains(&dest.name) {
                return Err(AppError::Validation(format!(
                    "Task '{}': export destination '{}' is not declared by the informatics gateway",
                    task.id, dest.name
                )));
            }
            validate_condition(dest, &task.id)?;
        }
    }

    Ok(())
}

fn reject_duplicate_destinations(
    task_id: &str,
    kind: &str,
    destinations: &[Destination],
) -> AppResult<()> {
    let mut names = HashSet::new();
    for dest in destinations {
        if !names.insert(dest.name.as_str()) {
            return Err(AppError::Validation(format!(
                "Task '{}': duplicate {} '{}'",
                task_id, kind, dest.name
            )));
        }
    }
    Ok(())
}

fn validate_condition(dest: &Destination, task_id: &str) -> AppResult<()> {
    let Some(condition) = dest.condition() else {
        return Ok(());
    };

    Expression::parse(condition).map_err(|e| {
        let detail = match e {
            ConditionError::MalformedExpression { message, .. } => message,
            other => other.to_string(),
        };
        AppError::Validation(format!(
            "Task '{}': invalid condition for '{}': {}",
            task_id, dest.name, detail
        ))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
workflow_id: liver-seg
workflow:
  name: liver segmentation
  informatics_gateway:
    ae_title: MONAISCU
    export_destinations: [PACS]
  tasks:
    - id: seg
      type: argo
      ref: liver-seg
      args:
        namespace: default
      artifacts:
        input:
          - name: dicom
            value: "{{ context.input.dicom }}"
      task_destinations:
        - name: report
          condition: "{{ context.executions.seg.result.organ }} == 'liver'"
    - id: report
      type: argo
      timeout_minutes: 15
      artifacts:
        input:
          - name: seg
            value: "{{ context.executions.seg.output_dir }}"
      export_destinations:
        - name: PACS
"#;

    #[test]
    fn test_parse_valid_workflow() {
        let file = parse_workflow(VALID).unwrap();
        assert_eq!(file.workflow_id, "liver-seg");
        assert_eq!(file.workflow.tasks.len(), 2);
        assert_eq!(
            file.workflow.informatics_gateway.ae_title.as_deref(),
            Some("MONAISCU")
        );
        assert_eq!(file.workflow.tasks[1].timeout_minutes, Some(15));
        assert_eq!(file.workflow.version, "1");
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let yaml = VALID.replace("- name: report\n          condition", "- name: missing\n          condition");
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_duplicate_task_ids_rejected() {
        let yaml = VALID.replace("- id: report", "- id: seg");
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate task id"));
    }

    #[test]
    fn test_broken_condition_rejected() {
        let yaml = VALID.replace("== 'liver'", "==");
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("No right-hand parameter at index"));
    }

    #[test]
    fn test_undeclared_export_rejected() {
        let yaml = VALID.replace("        - name: PACS", "        - name: ORTHANC");
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("ORTHANC"));
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let yaml = VALID.replace(
            "      task_destinations:\n        - name: report\n",
            "      task_destinations:\n        - name: report\n        - name: report\n",
        );
        assert_ne!(yaml, VALID);
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("duplicate destination 'report'"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = parse_workflow("workflow_id: [").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }
}
