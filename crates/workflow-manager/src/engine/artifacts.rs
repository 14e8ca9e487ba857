//! Artifact resolution.
//!
//! Maps the artifacts a task declares to fully-qualified storage locations.
//! Input data for a payload lives under `{payload_id}/dcm`; each task
//! execution writes under `{payload_id}/workflows/{instance_id}/{execution_id}`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::db::models::{ArtifactLocation, TaskExecution};
use crate::storage::{StorageError, StorageService};
use crate::workflow::Artifact;

const EXECUTIONS_PREFIX: &str = "context.executions.";

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// A mandatory artifact is missing from storage.
    #[error("Artifact '{name}' not found at {path}")]
    NotFound { name: String, path: String },

    /// A mandatory artifact references something that does not exist.
    #[error("Artifact '{name}' has unresolvable reference {reference}")]
    UnresolvedReference { name: String, reference: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ArtifactError {
    /// Whether retrying can change the outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArtifactError::Storage(_))
    }
}

/// Directory holding a payload's input data.
pub fn input_dir(payload_id: &str) -> String {
    format!("{}/dcm", payload_id)
}

/// Directory a task execution writes to.
pub fn execution_dir(payload_id: &str, instance_id: &str, execution_id: &str) -> String {
    format!("{}/workflows/{}/{}", payload_id, instance_id, execution_id)
}

/// What to resolve artifacts against.
#[derive(Debug, Clone)]
pub struct ResolveScope<'a> {
    pub payload_id: &'a str,
    pub instance_id: &'a str,
    pub bucket: &'a str,
    /// Executions of the instance so far, for cross-task references.
    pub executions: &'a [TaskExecution],
    /// Base directory for plain relative values.
    pub output_dir: Option<&'a str>,
    /// Verify mandatory artifacts exist and drop missing optional ones.
    pub must_already_exist: bool,
}

impl ResolveScope<'_> {
    fn base_dir(&self) -> String {
        match self.output_dir {
            Some(dir) => dir.trim_end_matches('/').to_string(),
            None => format!("{}/workflows/{}", self.payload_id, self.instance_id),
        }
    }

    fn latest_execution(&self, task_id: &str) -> Option<&TaskExecution> {
        self.executions.iter().rev().find(|t| t.task_id == task_id)
    }
}

/// Resolves declared artifacts, checking storage when asked to.
#[derive(Clone)]
pub struct ArtifactResolver {
    storage: Arc<dyn StorageService>,
}

impl ArtifactResolver {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }

    pub async fn resolve(
        &self,
        artifacts: &[Artifact],
        scope: &ResolveScope<'_>,
    ) -> Result<HashMap<String, ArtifactLocation>, ArtifactError> {
        let mut resolved = HashMap::with_capacity(artifacts.len());

        for artifact in artifacts {
            let location = match locate(artifact, scope) {
                Ok(location) => location,
                Err(e) if !artifact.mandatory => {
                    tracing::debug!(artifact = %artifact.name, error = %e, "Dropping optional artifact");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if scope.must_already_exist
                && !self.storage.exists(&location.bucket, &location.path).await?
            {
                if artifact.mandatory {
                    return Err(ArtifactError::NotFound {
                        name: artifact.name.clone(),
                        path: location.path,
                    });
                }
                tracing::debug!(
                    artifact = %artifact.name,
                    path = %location.path,
                    "Optional artifact missing, dropping"
                );
                continue;
            }

            resolved.insert(artifact.name.clone(), location);
        }

        Ok(resolved)
    }
}

/// Placeholder body if `value` is exactly one `{{ ... }}` reference.
fn reference(value: &str) -> Option<&str> {
    value
        .trim()
        .strip_prefix("{{")
        .and_then(|v| v.strip_suffix("}}"))
        .map(str::trim)
}

fn locate(artifact: &Artifact, scope: &ResolveScope<'_>) -> Result<ArtifactLocation, ArtifactError> {
    let Some(reference) = reference(&artifact.value) else {
        let relative = artifact.value.trim().trim_start_matches('/');
        return Ok(ArtifactLocation::new(
            scope.bucket,
            format!("{}/{}", scope.base_dir(), relative),
        ));
    };

    let unresolved = || ArtifactError::UnresolvedReference {
        name: artifact.name.clone(),
        reference: reference.to_string(),
    };

    if matches!(reference, "context.input" | "context.input.dicom") {
        return Ok(ArtifactLocation::new(scope.bucket, input_dir(scope.payload_id)));
    }

    let rest = reference.strip_prefix(EXECUTIONS_PREFIX).ok_or_else(unresolved)?;
    let (task_id, field) = rest.split_once('.').ok_or_else(unresolved)?;
    let execution = scope.latest_execution(task_id).ok_or_else(unresolved)?;

    if field == "output_dir" {
        return Ok(ArtifactLocation::new(scope.bucket, execution.output_dir.clone()));
    }

    let name = field.strip_prefix("artifacts.").ok_or_else(unresolved)?;
    execution
        .output_artifacts
        .get(name)
        .cloned()
        .ok_or_else(unresolved)
}
