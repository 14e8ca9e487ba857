//! In-memory store used by tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    ExportExecution, Payload, Status, TaskExecution, TaskExecutionStatus, WorkflowInstance,
};
use crate::db::store::{WorkflowDefinitions, WorkflowStore};
use crate::error::{AppError, AppResult};
use crate::workflow::{WorkflowRevision, WorkflowSpec};

#[derive(Default)]
struct Inner {
    instances: HashMap<String, WorkflowInstance>,
    payloads: HashMap<String, Payload>,
    revisions: Vec<WorkflowRevision>,
    failing_status_writes: usize,
}

/// Store backed by a single lock; every operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All instances, in no particular order.
    pub async fn instances(&self) -> Vec<WorkflowInstance> {
        self.inner.read().await.instances.values().cloned().collect()
    }

    /// Make the next `count` instance status writes fail.
    pub async fn fail_status_writes(&self, count: usize) {
        self.inner.write().await.failing_status_writes = count;
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.instances.contains_key(&instance.id)
            || inner.instances.values().any(|i| {
                i.payload_id == instance.payload_id && i.workflow_id == instance.workflow_id
            });
        if duplicate {
            return Ok(false);
        }
        inner
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(true)
    }

    async fn get_instance(&self, instance_id: &str) -> AppResult<Option<WorkflowInstance>> {
        Ok(self.inner.read().await.instances.get(instance_id).cloned())
    }

    async fn get_instance_by_payload_and_workflow(
        &self,
        payload_id: &str,
        workflow_id: &str,
    ) -> AppResult<Option<WorkflowInstance>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .find(|i| i.payload_id == payload_id && i.workflow_id == workflow_id)
            .cloned())
    }

    async fn update_task_status(
        &self,
        instance_id: &str,
        task: &TaskExecution,
        expected: TaskExecutionStatus,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        let Some(stored) = instance.task_mut(&task.execution_id) else {
            return Ok(false);
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = task.clone();
        instance.version += 1;
        Ok(true)
    }

    async fn update_task_exports(
        &self,
        instance_id: &str,
        execution_id: &str,
        exports: &[ExportExecution],
        expected_version: i64,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if instance.version != expected_version {
            return Ok(false);
        }
        let Some(task) = instance.task_mut(execution_id) else {
            return Ok(false);
        };
        task.exports = exports.to_vec();
        instance.version += 1;
        Ok(true)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: Status,
        expected_version: i64,
    ) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.failing_status_writes > 0 {
            inner.failing_status_writes -= 1;
            return Err(AppError::Internal("store unavailable".to_string()));
        }
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if instance.version != expected_version {
            return Ok(false);
        }
        instance.status = status;
        instance.version += 1;
        Ok(true)
    }

    async fn append_tasks(&self, instance_id: &str, tasks: &[TaskExecution]) -> AppResult<usize> {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            return Ok(0);
        };
        let mut appended = 0;
        for task in tasks {
            if instance.task(&task.execution_id).is_none() {
                instance.tasks.push(task.clone());
                appended += 1;
            }
        }
        if appended > 0 {
            instance.version += 1;
        }
        Ok(appended)
    }

    async fn list_overdue_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<TaskExecution>> {
        let inner = self.inner.read().await;
        let mut overdue: Vec<TaskExecution> = inner
            .instances
            .values()
            .flat_map(|i| i.tasks.iter())
            .filter(|t| t.status.is_active() && t.timeout < now)
            .cloned()
            .collect();
        overdue.sort_by_key(|t| t.timeout);
        overdue.truncate(limit.max(0) as usize);
        Ok(overdue)
    }

    async fn create_payload(&self, payload: &Payload) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.payloads.contains_key(&payload.payload_id) {
            return Ok(false);
        }
        inner
            .payloads
            .insert(payload.payload_id.clone(), payload.clone());
        Ok(true)
    }

    async fn get_payload(&self, payload_id: &str) -> AppResult<Option<Payload>> {
        Ok(self.inner.read().await.payloads.get(payload_id).cloned())
    }
}

fn latest<'a>(revisions: &'a [WorkflowRevision], workflow_id: &str) -> Option<&'a WorkflowRevision> {
    revisions
        .iter()
        .filter(|r| r.workflow_id == workflow_id)
        .max_by_key(|r| r.revision)
}

#[async_trait]
impl WorkflowDefinitions for MemoryStore {
    async fn resolve_revisions(
        &self,
        workflow_ids: &[String],
        ae_title: Option<&str>,
    ) -> AppResult<Vec<WorkflowRevision>> {
        let inner = self.inner.read().await;

        if !workflow_ids.is_empty() {
            return Ok(workflow_ids
                .iter()
                .filter_map(|id| latest(&inner.revisions, id).cloned())
                .collect());
        }

        let Some(ae_title) = ae_title else {
            return Ok(Vec::new());
        };

        let mut ids: Vec<&str> = inner
            .revisions
            .iter()
            .filter(|r| r.workflow.informatics_gateway.ae_title.as_deref() == Some(ae_title))
            .map(|r| r.workflow_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();

        // A newer revision may have moved to another AE title.
        Ok(ids
            .into_iter()
            .filter_map(|id| latest(&inner.revisions, id))
            .filter(|r| r.workflow.informatics_gateway.ae_title.as_deref() == Some(ae_title))
            .cloned()
            .collect())
    }

    async fn get_revision(
        &self,
        workflow_id: &str,
        revision: i32,
    ) -> AppResult<Option<WorkflowRevision>> {
        Ok(self
            .inner
            .read()
            .await
            .revisions
            .iter()
            .find(|r| r.workflow_id == workflow_id && r.revision == revision)
            .cloned())
    }

    async fn save_revision(
        &self,
        workflow_id: &str,
        workflow: &WorkflowSpec,
    ) -> AppResult<WorkflowRevision> {
        let mut inner = self.inner.write().await;

        let next = match latest(&inner.revisions, workflow_id) {
            Some(current) if current.workflow == *workflow => return Ok(current.clone()),
            Some(current) => current.revision + 1,
            None => 1,
        };

        let revision = WorkflowRevision {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            revision: next,
            workflow: workflow.clone(),
        };
        inner.revisions.push(revision.clone());
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{InformaticsGateway, TaskTemplate};

    fn spec(name: &str, ae_title: &str) -> WorkflowSpec {
        WorkflowSpec {
            name: name.to_string(),
            description: None,
            version: "1".to_string(),
            informatics_gateway: InformaticsGateway {
                ae_title: Some(ae_title.to_string()),
                ..Default::default()
            },
            tasks: vec![TaskTemplate {
                id: "a".to_string(),
                description: None,
                task_type: "router".to_string(),
                reference: None,
                args: HashMap::new(),
                artifacts: Default::default(),
                task_destinations: vec![],
                export_destinations: vec![],
                timeout_minutes: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_save_revision_increments_and_dedups() {
        let store = MemoryStore::new();
        let first = store.save_revision("wf", &spec("one", "AE")).await.unwrap();
        let same = store.save_revision("wf", &spec("one", "AE")).await.unwrap();
        let second = store.save_revision("wf", &spec("two", "AE")).await.unwrap();

        assert_eq!(first.revision, 1);
        assert_eq!(same.id, first.id);
        assert_eq!(second.revision, 2);
        assert_eq!(
            store.get_revision("wf", 1).await.unwrap().unwrap().workflow.name,
            "one"
        );
    }

    #[tokio::test]
    async fn test_resolve_ids_take_precedence() {
        let store = MemoryStore::new();
        store.save_revision("wf-a", &spec("a", "AE1")).await.unwrap();
        store.save_revision("wf-b", &spec("b", "AE2")).await.unwrap();

        let by_id = store
            .resolve_revisions(&["wf-b".to_string()], Some("AE1"))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].workflow_id, "wf-b");

        let by_ae = store.resolve_revisions(&[], Some("AE1")).await.unwrap();
        assert_eq!(by_ae.len(), 1);
        assert_eq!(by_ae[0].workflow_id, "wf-a");

        assert!(store.resolve_revisions(&[], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_ae_title_uses_latest_revision() {
        let store = MemoryStore::new();
        store.save_revision("wf", &spec("a", "AE1")).await.unwrap();
        store.save_revision("wf", &spec("a", "AE2")).await.unwrap();

        assert!(store.resolve_revisions(&[], Some("AE1")).await.unwrap().is_empty());
        let resolved = store.resolve_revisions(&[], Some("AE2")).await.unwrap();
        assert_eq!(resolved[0].revision, 2);
    }

    #[tokio::test]
    async fn test_payload_recorded_once() {
        let store = MemoryStore::new();
        let payload = Payload {
            payload_id: "p".to_string(),
            bucket: "b".to_string(),
            correlation_id: "c".to_string(),
            calling_ae_title: None,
            called_ae_title: None,
            timestamp: Utc::now(),
            workflows: vec![],
            metadata: Default::default(),
            created: Utc::now(),
        };
        assert!(store.create_payload(&payload).await.unwrap());
        assert!(!store.create_payload(&payload).await.unwrap());
        assert!(store.get_payload("p").await.unwrap().is_some());
    }
}
