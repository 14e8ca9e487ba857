//! Workflow definition loading from YAML files.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::db::WorkflowDefinitions;
use crate::error::{AppError, AppResult};
use crate::workflow::{parse_workflow, WorkflowRevision};

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Result of loading a directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub saved: Vec<WorkflowRevision>,
    /// Files that could not be read or parsed, with the reason.
    pub rejected: Vec<(PathBuf, String)>,
}

/// Save every workflow file under `dir` as a revision.
///
/// Files are visited in path order, subdirectories included. An unchanged
/// definition keeps its current revision. Broken files are reported and
/// skipped; only an unreadable directory or a store failure is an error.
pub async fn load_directory(
    dir: &Path,
    definitions: &dyn WorkflowDefinitions,
) -> AppResult<LoadReport> {
    if !dir.is_dir() {
        return Err(AppError::Config(format!(
            "Workflow directory does not exist: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut report = LoadReport::default();
    for path in files {
        let parsed = fs::read_to_string(&path)
            .map_err(|e| AppError::Parse(e.to_string()))
            .and_then(|content| parse_workflow(&content));

        let file = match parsed {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid workflow file");
                report.rejected.push((path, e.to_string()));
                continue;
            }
        };

        let revision = definitions
            .save_revision(&file.workflow_id, &file.workflow)
            .await?;
        info!(
            path = %path.display(),
            workflow_id = %revision.workflow_id,
            revision = revision.revision,
            name = %revision.workflow.name,
            "Workflow definition loaded"
        );
        report.saved.push(revision);
    }

    Ok(report)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> AppResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| {
        AppError::Config(format!("Failed to read directory {}: {}", dir.display(), e))
    })?;

    for entry in entries {
        let path = entry
            .map_err(|e| AppError::Config(e.to_string()))?
            .path();

        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    const SEGMENTATION: &str = r#"
workflow_id: seg
workflow:
  name: segmentation
  informatics_gateway:
    ae_title: MONAI
    export_destinations: [PACS]
  tasks:
    - id: router
      type: router
      task_destinations:
        - name: liver
          conditions: "{{ context.executions.router.result.organ }} == 'liver'"
    - id: liver
      type: argo
      timeout_minutes: 30
      export_destinations:
        - name: PACS
"#;

    #[tokio::test]
    async fn test_loads_yaml_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seg.yaml"), SEGMENTATION).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("nested/other.yml"),
            SEGMENTATION.replace("workflow_id: seg", "workflow_id: other"),
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = MemoryStore::new();
        let report = load_directory(dir.path(), &store).await.unwrap();

        assert!(report.rejected.is_empty());
        let mut ids: Vec<&str> = report.saved.iter().map(|r| r.workflow_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["other", "seg"]);

        let revision = store.get_revision("seg", 1).await.unwrap().unwrap();
        assert_eq!(revision.workflow.tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_reload_keeps_revision() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seg.yaml"), SEGMENTATION).unwrap();
        let store = MemoryStore::new();

        load_directory(dir.path(), &store).await.unwrap();
        let report = load_directory(dir.path(), &store).await.unwrap();
        assert_eq!(report.saved[0].revision, 1);

        fs::write(
            dir.path().join("seg.yaml"),
            SEGMENTATION.replace("timeout_minutes: 30", "timeout_minutes: 45"),
        )
        .unwrap();
        let report = load_directory(dir.path(), &store).await.unwrap();
        assert_eq!(report.saved[0].revision, 2);
    }

    #[tokio::test]
    async fn test_invalid_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), "workflow_id: [").unwrap();
        fs::write(dir.path().join("b.yaml"), SEGMENTATION).unwrap();

        let store = MemoryStore::new();
        let report = load_directory(dir.path(), &store).await.unwrap();

        assert_eq!(report.saved.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].0.ends_with("a.yaml"));
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let store = MemoryStore::new();
        let err = tokio_test::block_on(load_directory(Path::new("/nonexistent/workflows"), &store))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
