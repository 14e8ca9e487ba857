//! Store traits used by the orchestrator, the supervisor and the listener.
//!
//! Every write that touches an instance or its tasks increments the
//! instance `version`, so a version compare-and-swap observes task appends
//! and task transitions made by concurrent handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{
    ExportExecution, Payload, Status, TaskExecution, TaskExecutionStatus, WorkflowInstance,
};
use crate::error::AppResult;
use crate::workflow::{WorkflowRevision, WorkflowSpec};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert an instance together with its tasks in one atomic write.
    ///
    /// Returns `false` when an instance already exists for the same
    /// (payload id, workflow id).
    async fn create_instance(&self, instance: &WorkflowInstance) -> AppResult<bool>;

    async fn get_instance(&self, instance_id: &str) -> AppResult<Option<WorkflowInstance>>;

    async fn get_instance_by_payload_and_workflow(
        &self,
        payload_id: &str,
        workflow_id: &str,
    ) -> AppResult<Option<WorkflowInstance>>;

    /// Replace a task document if its stored status is still `expected`.
    async fn update_task_status(
        &self,
        instance_id: &str,
        task: &TaskExecution,
        expected: TaskExecutionStatus,
    ) -> AppResult<bool>;

    /// Replace a task's export bookkeeping if the instance is at `expected_version`.
    async fn update_task_exports(
        &self,
        instance_id: &str,
        execution_id: &str,
        exports: &[ExportExecution],
        expected_version: i64,
    ) -> AppResult<bool>;

    /// Set the instance status if the instance is at `expected_version`.
    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: Status,
        expected_version: i64,
    ) -> AppResult<bool>;

    /// Append tasks whose execution ids are not stored yet.
    ///
    /// Returns the number of tasks appended.
    async fn append_tasks(&self, instance_id: &str, tasks: &[TaskExecution]) -> AppResult<usize>;

    /// Active tasks whose deadline is before `now`, oldest deadline first.
    async fn list_overdue_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<TaskExecution>>;

    /// Record a payload; returns `false` if it was already recorded.
    async fn create_payload(&self, payload: &Payload) -> AppResult<bool>;

    async fn get_payload(&self, payload_id: &str) -> AppResult<Option<Payload>>;
}

#[async_trait]
pub trait WorkflowDefinitions: Send + Sync {
    /// Latest revisions of the workflows to start for a request.
    ///
    /// Explicit ids take precedence; the AE title is only consulted when
    /// `workflow_ids` is empty.
    async fn resolve_revisions(
        &self,
        workflow_ids: &[String],
        ae_title: Option<&str>,
    ) -> AppResult<Vec<WorkflowRevision>>;

    async fn get_revision(
        &self,
        workflow_id: &str,
        revision: i32,
    ) -> AppResult<Option<WorkflowRevision>>;

    /// Save `workflow` as the next revision of `workflow_id`.
    ///
    /// Saving a body identical to the latest revision returns that revision.
    async fn save_revision(
        &self,
        workflow_id: &str,
        workflow: &WorkflowSpec,
    ) -> AppResult<WorkflowRevision>;
}
