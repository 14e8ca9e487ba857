//! Workflow execution orchestrator.
//!
//! Turns requests into workflow instances and drives them forward on task
//! updates and export completions:
//!
//! - a request creates one instance per matching workflow, with its first
//!   task dispatched;
//! - a successful task takes its task destinations (dispatching the next
//!   tasks) and its export destinations (publishing export requests);
//! - a failed or canceled task fails the instance;
//! - an instance succeeds once every task succeeded and every export closed.
//!
//! All coordination goes through conditional writes in the store, so
//! handlers for the same instance may run concurrently and messages may be
//! redelivered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conditions;
use crate::config::{AppConfig, Topics};
use crate::db::models::{
    ArtifactLocation, ExportExecution, ExportStatus, FailureReason, Payload, Status,
    TaskExecution, TaskExecutionStatus, WorkflowInstance,
};
use crate::db::{WorkflowDefinitions, WorkflowStore};
use crate::error::{AppError, AppResult};
use crate::events::{
    ExportCompleteEvent, ExportCompleteStatus, ExportRequestEvent, TaskDispatchEvent,
    TaskUpdateEvent, WorkflowRequestEvent,
};
use crate::nats::{Message, MessagePublisher};
use crate::workflow::{Destination, TaskTemplate, WorkflowRevision};

use super::artifacts::{execution_dir, ArtifactError, ArtifactResolver, ResolveScope};
use super::context::DestinationContext;

type ArtifactMapping = HashMap<String, ArtifactLocation>;

/// Attempts for a version compare-and-swap before giving up with a conflict.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub application_id: String,
    pub topics: Topics,
    /// Used when a task template does not set `timeout_minutes`.
    pub task_timeout_minutes: i64,
}

impl ExecutorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            application_id: config.application_id.clone(),
            topics: config.topics(),
            task_timeout_minutes: config.task_timeout_minutes,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// Instances handled for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateReport {
    /// Ids of the instances created.
    pub created: Vec<String>,
    /// Workflow ids that already had an instance for the payload.
    pub skipped: Vec<String>,
}

/// Whether an update changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Duplicate, stale or out-of-order; nothing was written.
    Ignored,
}

/// Execution id of the task a destination edge creates.
///
/// Derived from the parent execution so redelivered completions map to the
/// same child.
pub fn child_execution_id(parent_execution_id: &str, task_id: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", parent_execution_id, task_id).as_bytes(),
    )
    .to_string()
}

pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    definitions: Arc<dyn WorkflowDefinitions>,
    publisher: Arc<dyn MessagePublisher>,
    artifacts: ArtifactResolver,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        definitions: Arc<dyn WorkflowDefinitions>,
        publisher: Arc<dyn MessagePublisher>,
        artifacts: ArtifactResolver,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            publisher,
            artifacts,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Create and dispatch instances for every workflow the request matches.
    ///
    /// Workflows that already have an instance for the payload are skipped.
    /// A failed dispatch publish is returned as an error after all workflows
    /// were handled; the instances stay stored.
    pub async fn create_workflow_instances(
        &self,
        request: &WorkflowRequestEvent,
        payload: &Payload,
    ) -> AppResult<CreateReport> {
        let revisions = self
            .definitions
            .resolve_revisions(&request.workflows, request.called_ae_title.as_deref())
            .await?;

        if revisions.is_empty() {
            warn!(
                payload_id = %payload.payload_id,
                correlation_id = %payload.correlation_id,
                workflows = ?request.workflows,
                called_ae_title = ?request.called_ae_title,
                "No workflow matches the request"
            );
            return Ok(CreateReport::default());
        }

        let mut report = CreateReport::default();
        let mut dispatch_error: Option<AppError> = None;

        for revision in &revisions {
            let existing = self
                .store
                .get_instance_by_payload_and_workflow(&payload.payload_id, &revision.workflow_id)
                .await?;
            if let Some(existing) = existing {
                info!(
                    workflow_instance_id = %existing.id,
                    workflow_id = %revision.workflow_id,
                    payload_id = %payload.payload_id,
                    "Workflow instance already exists, skipping"
                );
                report.skipped.push(revision.workflow_id.clone());
                continue;
            }

            let Some(template) = revision.first_task() else {
                warn!(workflow_id = %revision.workflow_id, "Workflow has no tasks, skipping");
                report.skipped.push(revision.workflow_id.clone());
                continue;
            };

            let instance = self.new_instance(revision, payload, template).await?;
            if !self.store.create_instance(&instance).await? {
                info!(
                    workflow_id = %revision.workflow_id,
                    payload_id = %payload.payload_id,
                    "Concurrent request created the instance first, skipping"
                );
                report.skipped.push(revision.workflow_id.clone());
                continue;
            }

            info!(
                workflow_instance_id = %instance.id,
                workflow_id = %instance.workflow_id,
                revision = instance.revision,
                payload_id = %instance.payload_id,
                correlation_id = %instance.correlation_id,
                status = %instance.status,
                "Created workflow instance"
            );
            report.created.push(instance.id.clone());

            let first = &instance.tasks[0];
            if first.status != TaskExecutionStatus::Created {
                continue;
            }

            match self.dispatch(&instance, first).await {
                Ok(()) => {
                    self.transition_instance(&instance.id, Status::Dispatched)
                        .await?;
                }
                Err(e) => {
                    error!(
                        workflow_instance_id = %instance.id,
                        execution_id = %first.execution_id,
                        error = %e,
                        "Failed to dispatch first task"
                    );
                    dispatch_error.get_or_insert(e);
                }
            }
        }

        match dispatch_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Apply a runner's task update.
    pub async fn process_task_update(&self, event: &TaskUpdateEvent) -> AppResult<UpdateOutcome> {
        let instance = self
            .store
            .get_instance(&event.workflow_instance_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("workflow instance {}", event.workflow_instance_id))
            })?;

        let current = instance.task(&event.execution_id).cloned().ok_or_else(|| {
            AppError::NotFound(format!(
                "task execution {} in workflow instance {}",
                event.execution_id, instance.id
            ))
        })?;

        if current.task_id != event.task_id {
            warn!(
                execution_id = %event.execution_id,
                stored_task_id = %current.task_id,
                task_id = %event.task_id,
                "Task id in update does not match the stored execution"
            );
        }

        if current.status.is_terminal() || current.status == event.status {
            debug!(
                execution_id = %current.execution_id,
                status = %current.status,
                update = %event.status,
                "Task already in a final or identical state, ignoring update"
            );
            self.resume_after_update(&instance, &current).await?;
            return Ok(UpdateOutcome::Ignored);
        }

        if !current.status.can_transition_to(event.status) {
            warn!(
                execution_id = %current.execution_id,
                from = %current.status,
                to = %event.status,
                "Invalid task transition, ignoring update"
            );
            return Ok(UpdateOutcome::Ignored);
        }

        let mut updated = current.clone();
        apply_update(&mut updated, event, &instance);

        if event.status == TaskExecutionStatus::Succeeded && instance.status != Status::Failed {
            let revision = self.revision_for(&instance).await?;
            match revision.task(&updated.task_id) {
                Some(template) => {
                    let mut view = instance.clone();
                    if let Some(slot) = view.task_mut(&updated.execution_id) {
                        *slot = updated.clone();
                    }

                    self.handle_task_destinations(
                        &view,
                        &revision,
                        &template.task_destinations,
                        &updated,
                    )
                    .await?;

                    updated.exports = taken_destinations(&view, &template.export_destinations)
                        .iter()
                        .map(|name| ExportExecution::pending(name))
                        .collect();
                }
                None => warn!(
                    workflow_id = %revision.workflow_id,
                    task_id = %updated.task_id,
                    "Task is not part of the workflow revision, no destinations taken"
                ),
            }
        }

        if !self
            .store
            .update_task_status(&instance.id, &updated, current.status)
            .await?
        {
            let stored = self
                .store
                .get_instance(&instance.id)
                .await?
                .and_then(|i| i.task(&updated.execution_id).map(|t| t.status));
            if matches!(stored, Some(s) if s.is_terminal() || s == event.status) {
                return Ok(UpdateOutcome::Ignored);
            }
            return Err(AppError::Conflict(format!(
                "task execution {} changed concurrently",
                updated.execution_id
            )));
        }

        info!(
            workflow_instance_id = %instance.id,
            task_id = %updated.task_id,
            execution_id = %updated.execution_id,
            correlation_id = %event.correlation_id,
            from = %current.status,
            to = %updated.status,
            reason = ?updated.reason,
            "Task updated"
        );

        if !updated.exports.is_empty() {
            self.dispatch_exports(&instance, &updated).await?;
        }

        if matches!(
            event.status,
            TaskExecutionStatus::Failed | TaskExecutionStatus::Canceled
        ) {
            self.transition_instance(&instance.id, Status::Failed).await?;
        }

        self.finalize_instance(&instance.id).await?;
        Ok(UpdateOutcome::Applied)
    }

    /// Take the destinations of `source` and dispatch the tasks they lead to.
    ///
    /// Conditions are evaluated against `instance`; a condition that fails to
    /// parse or evaluate leaves only its own edge untaken, and so does a
    /// missing mandatory input. Returns the tasks created or re-dispatched,
    /// in declaration order.
    pub async fn handle_task_destinations(
        &self,
        instance: &WorkflowInstance,
        revision: &WorkflowRevision,
        destinations: &[Destination],
        source: &TaskExecution,
    ) -> AppResult<Vec<TaskExecution>> {
        let mut new_tasks = Vec::new();
        let mut redispatch = Vec::new();

        for name in taken_destinations(instance, destinations) {
            let Some(template) = revision.task(&name) else {
                warn!(
                    workflow_instance_id = %instance.id,
                    destination = %name,
                    "Destination is not a task of the workflow"
                );
                continue;
            };

            let execution_id = child_execution_id(&source.execution_id, &name);
            if let Some(existing) = instance.task(&execution_id) {
                if existing.status == TaskExecutionStatus::Created {
                    redispatch.push(existing.clone());
                } else {
                    debug!(execution_id = %execution_id, "Destination task already dispatched");
                }
                continue;
            }

            let mut task = self.new_task(instance, template, Some(source), execution_id);
            let resolved = self
                .resolve_artifacts(instance, template, &task.output_dir)
                .await;
            match resolved {
                Ok((input, output)) => {
                    task.input_artifacts = input;
                    task.output_artifacts = output;
                    new_tasks.push(task);
                }
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => warn!(
                    workflow_instance_id = %instance.id,
                    destination = %name,
                    error = %e,
                    "Destination inputs missing, destination not taken"
                ),
            }
        }

        if !new_tasks.is_empty() {
            let appended = self.store.append_tasks(&instance.id, &new_tasks).await?;
            debug!(
                workflow_instance_id = %instance.id,
                appended,
                "Appended destination tasks"
            );
        }

        let mut dispatched = redispatch;
        dispatched.extend(new_tasks);

        let mut dispatch_error = None;
        for task in dispatched
            .iter()
            .filter(|t| t.status == TaskExecutionStatus::Created)
        {
            if let Err(e) = self.dispatch(instance, task).await {
                error!(
                    workflow_instance_id = %instance.id,
                    execution_id = %task.execution_id,
                    error = %e,
                    "Failed to dispatch destination task"
                );
                dispatch_error.get_or_insert(e);
            }
        }

        match dispatch_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    /// Redo the idempotent work that follows a stored task status.
    ///
    /// A delivery can fail after its status write landed; the redelivery
    /// finds the status already stored and finishes the instance here.
    /// Export requests are not republished.
    async fn resume_after_update(
        &self,
        instance: &WorkflowInstance,
        task: &TaskExecution,
    ) -> AppResult<()> {
        if instance.status.is_terminal() {
            return Ok(());
        }

        match task.status {
            TaskExecutionStatus::Succeeded => {
                for child in instance.tasks.iter().filter(|t| {
                    t.status == TaskExecutionStatus::Created
                        && t.execution_id == child_execution_id(&task.execution_id, &t.task_id)
                }) {
                    info!(
                        workflow_instance_id = %instance.id,
                        execution_id = %child.execution_id,
                        "Re-dispatching destination task"
                    );
                    self.dispatch(instance, child).await?;
                }
            }
            TaskExecutionStatus::Failed | TaskExecutionStatus::Canceled => {
                self.transition_instance(&instance.id, Status::Failed).await?;
            }
            _ => {}
        }

        self.finalize_instance(&instance.id).await?;
        Ok(())
    }

    /// Close the export entries an exporter reported on.
    pub async fn process_export_complete(
        &self,
        event: &ExportCompleteEvent,
        correlation_id: &str,
    ) -> AppResult<UpdateOutcome> {
        let instance = self
            .store
            .get_instance(&event.workflow_instance_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("workflow instance {}", event.workflow_instance_id))
            })?;

        if instance.task(&event.export_task_id).is_none() {
            return Err(AppError::NotFound(format!(
                "task execution {} in workflow instance {}",
                event.export_task_id, instance.id
            )));
        }

        let status = match event.status {
            ExportCompleteStatus::Success => ExportStatus::Succeeded,
            ExportCompleteStatus::PartialFailure => ExportStatus::PartialFailure,
            ExportCompleteStatus::Failure | ExportCompleteStatus::Unknown => ExportStatus::Failed,
        };
        let destination = event.destination.as_deref();
        let message = event.failure_reason.clone();

        let changed = self
            .update_exports(&instance.id, &event.export_task_id, |exports| {
                let mut changed = false;
                for export in exports.iter_mut().filter(|e| {
                    e.status == ExportStatus::Pending
                        && destination.map_or(true, |d| d == e.destination)
                }) {
                    export.status = status;
                    export.message = message.clone();
                    changed = true;
                }
                changed
            })
            .await?;

        if !changed {
            debug!(
                workflow_instance_id = %instance.id,
                execution_id = %event.export_task_id,
                correlation_id = %correlation_id,
                "No pending export matched, ignoring"
            );
            return Ok(UpdateOutcome::Ignored);
        }

        info!(
            workflow_instance_id = %instance.id,
            execution_id = %event.export_task_id,
            destination = ?destination,
            correlation_id = %correlation_id,
            status = ?status,
            "Export completed"
        );

        if status != ExportStatus::Succeeded {
            self.transition_instance(&instance.id, Status::Failed).await?;
        }

        self.finalize_instance(&instance.id).await?;
        Ok(UpdateOutcome::Applied)
    }

    /// Move the instance to Succeeded or Failed if its tasks say so.
    ///
    /// Re-reads the instance on every attempt so a branch appended
    /// concurrently is taken into account.
    pub async fn finalize_instance(&self, instance_id: &str) -> AppResult<Option<Status>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let instance = self.load(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(None);
            }
            let Some(status) = instance.evaluate_completion() else {
                return Ok(None);
            };
            if self
                .store
                .update_instance_status(instance_id, status, instance.version)
                .await?
            {
                info!(
                    workflow_instance_id = %instance_id,
                    correlation_id = %instance.correlation_id,
                    status = %status,
                    "Workflow instance completed"
                );
                return Ok(Some(status));
            }
        }
        Err(AppError::Conflict(format!(
            "workflow instance {} kept changing during completion check",
            instance_id
        )))
    }

    /// Set a non-terminal instance to `target`.
    async fn transition_instance(&self, instance_id: &str, target: Status) -> AppResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let instance = self.load(instance_id).await?;
            if instance.status == target || instance.status.is_terminal() {
                return Ok(false);
            }
            if self
                .store
                .update_instance_status(instance_id, target, instance.version)
                .await?
            {
                info!(
                    workflow_instance_id = %instance_id,
                    from = %instance.status,
                    to = %target,
                    "Workflow instance status changed"
                );
                return Ok(true);
            }
        }
        Err(AppError::Conflict(format!(
            "workflow instance {} kept changing",
            instance_id
        )))
    }

    /// Rewrite a task's exports through a version compare-and-swap.
    ///
    /// `apply` returns whether it changed anything; nothing is written if not.
    async fn update_exports<F>(
        &self,
        instance_id: &str,
        execution_id: &str,
        mut apply: F,
    ) -> AppResult<bool>
    where
        F: FnMut(&mut Vec<ExportExecution>) -> bool + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let instance = self.load(instance_id).await?;
            let Some(task) = instance.task(execution_id) else {
                return Err(AppError::NotFound(format!(
                    "task execution {} in workflow instance {}",
                    execution_id, instance_id
                )));
            };
            let mut exports = task.exports.clone();
            if !apply(&mut exports) {
                return Ok(false);
            }
            if self
                .store
                .update_task_exports(instance_id, execution_id, &exports, instance.version)
                .await?
            {
                return Ok(true);
            }
        }
        Err(AppError::Conflict(format!(
            "exports of task execution {} kept changing",
            execution_id
        )))
    }

    async fn dispatch_exports(
        &self,
        instance: &WorkflowInstance,
        task: &TaskExecution,
    ) -> AppResult<()> {
        let mut files: Vec<ArtifactLocation> = task.output_artifacts.values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        if files.is_empty() {
            files.push(ArtifactLocation::new(&instance.bucket_id, task.output_dir.clone()));
        }

        let mut failed: Vec<(String, String)> = Vec::new();
        for export in task
            .exports
            .iter()
            .filter(|e| e.status == ExportStatus::Pending)
        {
            let request = ExportRequestEvent {
                workflow_instance_id: instance.id.clone(),
                export_task_id: task.execution_id.clone(),
                destination: export.destination.clone(),
                files: files.clone(),
                correlation_id: instance.correlation_id.clone(),
            };
            let topic = self.config.topics.export_request(&export.destination);

            match self
                .publish(&topic, &request, &instance.correlation_id, "export request")
                .await
            {
                Ok(()) => info!(
                    workflow_instance_id = %instance.id,
                    execution_id = %task.execution_id,
                    destination = %export.destination,
                    "Export requested"
                ),
                Err(e) => {
                    error!(
                        workflow_instance_id = %instance.id,
                        execution_id = %task.execution_id,
                        destination = %export.destination,
                        error = %e,
                        "Failed to request export"
                    );
                    failed.push((export.destination.clone(), e.to_string()));
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        self.update_exports(&instance.id, &task.execution_id, |exports| {
            let mut changed = false;
            for export in exports.iter_mut() {
                if let Some((_, message)) = failed.iter().find(|(d, _)| *d == export.destination) {
                    if export.status == ExportStatus::Pending {
                        export.status = ExportStatus::Failed;
                        export.message = Some(message.clone());
                        changed = true;
                    }
                }
            }
            changed
        })
        .await?;

        self.transition_instance(&instance.id, Status::Failed).await?;
        Ok(())
    }

    /// Publish the dispatch message and mark the task Dispatched.
    async fn dispatch(&self, instance: &WorkflowInstance, task: &TaskExecution) -> AppResult<()> {
        let event = TaskDispatchEvent {
            workflow_instance_id: instance.id.clone(),
            task_id: task.task_id.clone(),
            execution_id: task.execution_id.clone(),
            task_type: task.task_type.clone(),
            args: task.args.clone(),
            input_artifacts: task.input_artifacts.clone(),
            output_artifacts: task.output_artifacts.clone(),
            bucket: instance.bucket_id.clone(),
            payload_id: instance.payload_id.clone(),
            correlation_id: instance.correlation_id.clone(),
        };

        self.publish(
            &self.config.topics.task_dispatch,
            &event,
            &instance.correlation_id,
            "task dispatch",
        )
        .await?;

        let mut dispatched = task.clone();
        dispatched.status = TaskExecutionStatus::Dispatched;
        let marked = self
            .store
            .update_task_status(&instance.id, &dispatched, TaskExecutionStatus::Created)
            .await?;

        info!(
            workflow_instance_id = %instance.id,
            task_id = %task.task_id,
            execution_id = %task.execution_id,
            correlation_id = %instance.correlation_id,
            marked,
            "Task dispatched"
        );
        Ok(())
    }

    async fn publish<T: Serialize + Sync>(
        &self,
        topic: &str,
        body: &T,
        correlation_id: &str,
        description: &str,
    ) -> AppResult<()> {
        let message = Message::new(body, &self.config.application_id, correlation_id, description)?;
        self.publisher.publish(topic, &message).await?;
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> AppResult<WorkflowInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("workflow instance {}", instance_id)))
    }

    async fn revision_for(&self, instance: &WorkflowInstance) -> AppResult<WorkflowRevision> {
        self.definitions
            .get_revision(&instance.workflow_id, instance.revision)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "workflow {} revision {}",
                    instance.workflow_id, instance.revision
                ))
            })
    }

    async fn new_instance(
        &self,
        revision: &WorkflowRevision,
        payload: &Payload,
        first: &TaskTemplate,
    ) -> AppResult<WorkflowInstance> {
        let mut instance = WorkflowInstance {
            id: Uuid::new_v4().to_string(),
            ae_title: revision.workflow.informatics_gateway.ae_title.clone(),
            workflow_name: revision.workflow.name.clone(),
            workflow_id: revision.workflow_id.clone(),
            revision: revision.revision,
            payload_id: payload.payload_id.clone(),
            bucket_id: payload.bucket.clone(),
            correlation_id: payload.correlation_id.clone(),
            status: Status::Created,
            start_time: Utc::now(),
            input_metadata: payload.metadata.clone(),
            tasks: Vec::new(),
            version: 0,
        };

        let mut task = self.new_task(&instance, first, None, Uuid::new_v4().to_string());

        // Missing inputs fail the first task instead of erroring the request.
        let resolved = self.resolve_artifacts(&instance, first, &task.output_dir).await;
        match resolved {
            Ok((input, output)) => {
                task.input_artifacts = input;
                task.output_artifacts = output;
            }
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!(
                    workflow_instance_id = %instance.id,
                    task_id = %task.task_id,
                    execution_id = %task.execution_id,
                    error = %e,
                    "Task inputs missing, task created as failed"
                );
                task.status = TaskExecutionStatus::Failed;
                task.reason = FailureReason::MissingArtifacts;
                task.failure_message = Some(e.to_string());
                task.task_end_time = Some(task.task_start_time);
                instance.status = Status::Failed;
            }
        }

        instance.tasks.push(task);
        Ok(instance)
    }

    /// Task execution for `template`, before artifact resolution.
    fn new_task(
        &self,
        instance: &WorkflowInstance,
        template: &TaskTemplate,
        previous: Option<&TaskExecution>,
        execution_id: String,
    ) -> TaskExecution {
        let now = Utc::now();
        let minutes = template
            .timeout_minutes
            .unwrap_or(self.config.task_timeout_minutes);
        let output_dir = execution_dir(&instance.payload_id, &instance.id, &execution_id);

        TaskExecution {
            execution_id,
            task_id: template.id.clone(),
            task_type: template.task_type.clone(),
            workflow_instance_id: instance.id.clone(),
            previous_task_id: previous.map(|p| p.task_id.clone()),
            status: TaskExecutionStatus::Created,
            reason: FailureReason::None,
            failure_message: None,
            task_start_time: now,
            task_end_time: None,
            timeout: now + chrono::Duration::minutes(minutes),
            execution_stats: Default::default(),
            result_metadata: Default::default(),
            output_dir,
            input_artifacts: Default::default(),
            output_artifacts: Default::default(),
            exports: Vec::new(),
            args: template.args.clone(),
        }
    }

    async fn resolve_artifacts(
        &self,
        instance: &WorkflowInstance,
        template: &TaskTemplate,
        output_dir: &str,
    ) -> Result<(ArtifactMapping, ArtifactMapping), ArtifactError> {
        let inputs = ResolveScope {
            payload_id: &instance.payload_id,
            instance_id: &instance.id,
            bucket: &instance.bucket_id,
            executions: &instance.tasks,
            output_dir: None,
            must_already_exist: true,
        };
        let input = self
            .artifacts
            .resolve(&template.artifacts.input, &inputs)
            .await?;

        let outputs = ResolveScope {
            output_dir: Some(output_dir),
            must_already_exist: false,
            ..inputs
        };
        let output = self
            .artifacts
            .resolve(&template.artifacts.output, &outputs)
            .await?;

        Ok((input, output))
    }
}

/// Copy the runner's report onto the stored execution.
fn apply_update(task: &mut TaskExecution, event: &TaskUpdateEvent, instance: &WorkflowInstance) {
    task.status = event.status;
    task.reason = event.reason;
    if event.message.is_some() {
        task.failure_message = event.message.clone();
    }
    task.execution_stats
        .extend(event.execution_stats.iter().map(|(k, v)| (k.clone(), v.clone())));
    task.result_metadata
        .extend(event.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

    let payload_prefix = format!("{}/", instance.payload_id);
    for output in &event.outputs {
        let path = if output.value.starts_with(&payload_prefix) {
            output.value.clone()
        } else {
            format!(
                "{}/{}",
                task.output_dir.trim_end_matches('/'),
                output.value.trim_start_matches('/')
            )
        };
        task.output_artifacts.insert(
            output.name.clone(),
            ArtifactLocation::new(&instance.bucket_id, path),
        );
    }

    if task.status.is_terminal() || task.status == TaskExecutionStatus::PartialFail {
        task.task_end_time = Some(Utc::now());
    }
}

/// Names of the destinations taken, in declaration order without repeats.
fn taken_destinations(instance: &WorkflowInstance, destinations: &[Destination]) -> Vec<String> {
    let context = DestinationContext::new(instance);
    let mut seen = HashSet::new();

    destinations
        .iter()
        .filter(|dest| match dest.condition() {
            None => true,
            Some(condition) => match conditions::evaluate(condition, &context) {
                Ok(taken) => {
                    debug!(destination = %dest.name, condition = %condition, taken, "Evaluated condition");
                    taken
                }
                Err(e) => {
                    warn!(
                        workflow_instance_id = %instance.id,
                        destination = %dest.name,
                        condition = %condition,
                        error = %e,
                        "Condition failed, destination not taken"
                    );
                    false
                }
            },
        })
        .filter(|dest| {
            let first = seen.insert(dest.name.clone());
            if !first {
                warn!(
                    workflow_instance_id = %instance.id,
                    destination = %dest.name,
                    "Destination taken more than once, keeping the first edge"
                );
            }
            first
        })
        .map(|dest| dest.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::db::MemoryStore;
    use crate::nats::MemoryPublisher;
    use crate::storage::MemoryStorage;
    use crate::workflow::{Artifact, ArtifactMap, InformaticsGateway, WorkflowSpec};

    struct Harness {
        store: Arc<MemoryStore>,
        publisher: Arc<MemoryPublisher>,
        storage: Arc<MemoryStorage>,
        executor: WorkflowExecutor,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let storage = Arc::new(MemoryStorage::new());
        let executor = WorkflowExecutor::new(
            store.clone(),
            store.clone(),
            publisher.clone(),
            ArtifactResolver::new(storage.clone()),
            ExecutorConfig::default(),
        );
        Harness {
            store,
            publisher,
            storage,
            executor,
        }
    }

    fn template(id: &str) -> TaskTemplate {
        TaskTemplate {
            id: id.to_string(),
            description: None,
            task_type: "argo".to_string(),
            reference: None,
            args: HashMap::new(),
            artifacts: ArtifactMap::default(),
            task_destinations: vec![],
            export_destinations: vec![],
            timeout_minutes: None,
        }
    }

    fn workflow(tasks: Vec<TaskTemplate>) -> WorkflowSpec {
        WorkflowSpec {
            name: "test".to_string(),
            description: None,
            version: "1".to_string(),
            informatics_gateway: InformaticsGateway {
                ae_title: Some("MONAI".to_string()),
                data_origins: vec![],
                export_destinations: vec!["PACS".to_string()],
            },
            tasks,
        }
    }

    fn request(workflows: &[&str]) -> (WorkflowRequestEvent, Payload) {
        let request = WorkflowRequestEvent {
            payload_id: "p1".to_string(),
            bucket: "bucket".to_string(),
            correlation_id: "c1".to_string(),
            calling_ae_title: Some("SCU".to_string()),
            called_ae_title: Some("MONAI".to_string()),
            timestamp: Utc::now(),
            workflows: workflows.iter().map(|s| s.to_string()).collect(),
            metadata: HashMap::new(),
        };
        let payload = Payload::from_request(&request);
        (request, payload)
    }

    fn update(instance: &WorkflowInstance, execution_id: &str, status: TaskExecutionStatus) -> TaskUpdateEvent {
        let task = instance.task(execution_id).unwrap();
        TaskUpdateEvent {
            workflow_instance_id: instance.id.clone(),
            task_id: task.task_id.clone(),
            execution_id: execution_id.to_string(),
            correlation_id: instance.correlation_id.clone(),
            status,
            reason: FailureReason::None,
            message: None,
            execution_stats: HashMap::new(),
            metadata: HashMap::new(),
            outputs: vec![],
        }
    }

    async fn start(h: &Harness, spec: WorkflowSpec) -> WorkflowInstance {
        h.store.save_revision("wf", &spec).await.unwrap();
        let (request, payload) = request(&["wf"]);
        let report = h
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .unwrap();
        h.store
            .get_instance(&report.created[0])
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_creates_and_dispatches_first_task() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;

        assert_eq!(instance.status, Status::Dispatched);
        assert_eq!(instance.tasks.len(), 1);
        assert_eq!(instance.tasks[0].status, TaskExecutionStatus::Dispatched);

        let dispatches = h.publisher.messages_on("md.workflow.task_dispatch").await;
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].correlation_id, "c1");
        let event: TaskDispatchEvent = dispatches[0].decode().unwrap();
        assert_eq!(event.task_id, "a");
    }

    #[tokio::test]
    async fn test_duplicate_request_is_skipped() {
        let h = harness();
        start(&h, workflow(vec![template("a")])).await;

        let (request, payload) = request(&["wf"]);
        let report = h
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.skipped, vec!["wf".to_string()]);
        assert_eq!(h.store.instances().await.len(), 1);
        assert_eq!(h.publisher.messages_on("md.workflow.task_dispatch").await.len(), 1);
    }

    #[tokio::test]
    async fn test_ae_title_used_without_workflow_ids() {
        let h = harness();
        h.store.save_revision("wf", &workflow(vec![template("a")])).await.unwrap();
        let (request, payload) = request(&[]);

        let report = h
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .unwrap();
        assert_eq!(report.created.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_instance() {
        let h = harness();
        h.store.save_revision("wf", &workflow(vec![template("a")])).await.unwrap();
        h.publisher.fail_topic("md.workflow.task_dispatch").await;
        let (request, payload) = request(&["wf"]);

        let err = h
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Messaging(_)));

        let instances = h.store.instances().await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].tasks[0].status, TaskExecutionStatus::Created);
    }

    #[tokio::test]
    async fn test_missing_input_fails_first_task() {
        let h = harness();
        let mut first = template("a");
        first.artifacts.input = vec![Artifact::new("dicom", "{{ context.input.dicom }}")];
        let instance = start(&h, workflow(vec![first])).await;

        assert_eq!(instance.status, Status::Failed);
        assert_eq!(instance.tasks[0].status, TaskExecutionStatus::Failed);
        assert_eq!(instance.tasks[0].reason, FailureReason::MissingArtifacts);
        assert!(h.publisher.messages_on("md.workflow.task_dispatch").await.is_empty());
    }

    #[tokio::test]
    async fn test_present_input_is_resolved() {
        let h = harness();
        h.storage.put("bucket", "p1/dcm/1.dcm").await;
        let mut first = template("a");
        first.artifacts.input = vec![Artifact::new("dicom", "{{ context.input.dicom }}")];
        let instance = start(&h, workflow(vec![first])).await;

        assert_eq!(instance.tasks[0].input_artifacts["dicom"].path, "p1/dcm");
    }

    #[tokio::test]
    async fn test_success_dispatches_next_and_completes() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![Destination::to("b")];
        let instance = start(&h, workflow(vec![a, template("b")])).await;
        let first = instance.tasks[0].execution_id.clone();

        let outcome = h
            .executor
            .process_task_update(&update(&instance, &first, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(instance.tasks.len(), 2);
        let second = &instance.tasks[1];
        assert_eq!(second.task_id, "b");
        assert_eq!(second.execution_id, child_execution_id(&first, "b"));
        assert_eq!(second.previous_task_id.as_deref(), Some("a"));
        assert_eq!(second.status, TaskExecutionStatus::Dispatched);
        assert_eq!(instance.status, Status::Dispatched);

        let second_id = second.execution_id.clone();
        h.executor
            .process_task_update(&update(&instance, &second_id, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_redelivered_success_is_ignored() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![Destination::to("b")];
        let instance = start(&h, workflow(vec![a, template("b")])).await;
        let event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Succeeded);

        h.executor.process_task_update(&event).await.unwrap();
        let before = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let outcome = h.executor.process_task_update(&event).await.unwrap();

        assert_eq!(outcome, UpdateOutcome::Ignored);
        let after = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(after.tasks.len(), 2);
        assert_eq!(h.publisher.messages_on("md.workflow.task_dispatch").await.len(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_completes_after_store_failure() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;
        let event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Succeeded);

        h.store.fail_status_writes(1).await;
        let err = h.executor.process_task_update(&event).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.tasks[0].status, TaskExecutionStatus::Succeeded);
        assert_eq!(stored.status, Status::Dispatched);

        let outcome = h.executor.process_task_update(&event).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_redelivered_failure_fails_instance_after_store_failure() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![Destination::to("b")];
        let instance = start(&h, workflow(vec![a, template("b")])).await;
        let mut event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Failed);
        event.reason = FailureReason::PluginError;

        h.store.fail_status_writes(1).await;
        assert!(h.executor.process_task_update(&event).await.is_err());
        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Dispatched);

        h.executor.process_task_update(&event).await.unwrap();
        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(stored.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_unconditional_destinations_dispatch_in_order() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![
            Destination::to("c"),
            Destination::to("b"),
            Destination::when("d", "{{ context.executions.a.status }} == 'failed'"),
            Destination::to("e"),
        ];
        let instance = start(
            &h,
            workflow(vec![a, template("b"), template("c"), template("d"), template("e")]),
        )
        .await;

        h.executor
            .process_task_update(&update(
                &instance,
                &instance.tasks[0].execution_id,
                TaskExecutionStatus::Succeeded,
            ))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let ids: Vec<&str> = stored.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b", "e"]);
        assert!(stored.tasks[1..]
            .iter()
            .all(|t| t.status == TaskExecutionStatus::Dispatched));

        let dispatched: Vec<String> = h
            .publisher
            .messages_on("md.workflow.task_dispatch")
            .await
            .iter()
            .map(|m| m.decode::<TaskDispatchEvent>().unwrap().task_id)
            .collect();
        assert_eq!(dispatched, vec!["a", "c", "b", "e"]);
    }

    #[tokio::test]
    async fn test_missing_input_skips_only_its_destination() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![Destination::to("x"), Destination::to("y")];
        let mut x = template("x");
        x.artifacts.input = vec![Artifact::new("dicom", "{{ context.input.dicom }}")];
        let mut y = template("y");
        y.task_destinations = vec![Destination::to("z")];
        let instance = start(&h, workflow(vec![a, x, y, template("z")])).await;

        h.executor
            .process_task_update(&update(
                &instance,
                &instance.tasks[0].execution_id,
                TaskExecutionStatus::Succeeded,
            ))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let ids: Vec<&str> = stored.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "y"]);
        assert_eq!(stored.status, Status::Dispatched);

        let y_exec = stored.tasks[1].execution_id.clone();
        h.executor
            .process_task_update(&update(&stored, &y_exec, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let ids: Vec<&str> = stored.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "y", "z"]);
        assert_eq!(stored.tasks[2].status, TaskExecutionStatus::Dispatched);

        let z_exec = stored.tasks[2].execution_id.clone();
        h.executor
            .process_task_update(&update(&stored, &z_exec, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();
        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_dicom_tag_condition_uses_request_metadata() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![
            Destination::when("female", "{{context.dicom.tags[('0010','0040')]}} == 'F'"),
            Destination::when("male", "{{context.dicom.tags[('0010','0040')]}} == 'M'"),
        ];
        h.store
            .save_revision("wf", &workflow(vec![a, template("female"), template("male")]))
            .await
            .unwrap();

        let (mut request, _) = request(&["wf"]);
        request
            .metadata
            .insert("0010,0040".to_string(), "F".to_string());
        let payload = Payload::from_request(&request);
        let report = h
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .unwrap();
        let instance = h.store.get_instance(&report.created[0]).await.unwrap().unwrap();
        assert_eq!(instance.input_metadata.get("0010,0040").map(String::as_str), Some("F"));

        h.executor
            .process_task_update(&update(
                &instance,
                &instance.tasks[0].execution_id,
                TaskExecutionStatus::Succeeded,
            ))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let ids: Vec<&str> = stored.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "female"]);
    }

    #[tokio::test]
    async fn test_repeated_destination_taken_once() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;
        let destinations = vec![Destination::to("b"), Destination::to("c"), Destination::to("b")];
        assert_eq!(taken_destinations(&instance, &destinations), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_conditional_destinations() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![
            Destination::when("liver", "{{ context.executions.a.result.organ }} == 'liver'"),
            Destination::when("lung", "{{ context.executions.a.result.organ }} == 'lung'"),
            Destination::when("broken", "{{ context.executions.a.result.organ }} ~ 'x'"),
            Destination::to("always"),
        ];
        let instance = start(
            &h,
            workflow(vec![
                a,
                template("liver"),
                template("lung"),
                template("broken"),
                template("always"),
            ]),
        )
        .await;

        let mut event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Succeeded);
        event
            .metadata
            .insert("organ".to_string(), serde_json::json!("liver"));
        h.executor.process_task_update(&event).await.unwrap();

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        let ids: Vec<&str> = instance.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "liver", "always"]);
    }

    #[tokio::test]
    async fn test_failure_fails_instance() {
        let h = harness();
        let mut a = template("a");
        a.task_destinations = vec![Destination::to("b")];
        let instance = start(&h, workflow(vec![a, template("b")])).await;

        let mut event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Failed);
        event.reason = FailureReason::PluginError;
        event.message = Some("boom".to_string());
        h.executor.process_task_update(&event).await.unwrap();

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status, Status::Failed);
        assert_eq!(instance.tasks.len(), 1);
        assert_eq!(instance.tasks[0].reason, FailureReason::PluginError);
        assert_eq!(instance.tasks[0].failure_message.as_deref(), Some("boom"));
        assert!(instance.tasks[0].task_end_time.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_ignored() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;
        let exec = instance.tasks[0].execution_id.clone();

        h.executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::Accepted))
            .await
            .unwrap();
        let outcome = h
            .executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::Created))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(instance.tasks[0].status, TaskExecutionStatus::Accepted);
    }

    #[tokio::test]
    async fn test_partial_fail_blocks_completion() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;
        let exec = instance.tasks[0].execution_id.clone();

        h.executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::PartialFail))
            .await
            .unwrap();

        let instance = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status, Status::Dispatched);
        assert!(instance.tasks[0].task_end_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let h = harness();
        let instance = start(&h, workflow(vec![template("a")])).await;
        let mut event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Succeeded);
        event.workflow_instance_id = "missing".to_string();

        let err = h.executor.process_task_update(&event).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let mut event = update(&instance, &instance.tasks[0].execution_id, TaskExecutionStatus::Succeeded);
        event.execution_id = "missing".to_string();
        let err = h.executor.process_task_update(&event).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exports_block_completion_until_closed() {
        let h = harness();
        let mut a = template("a");
        a.export_destinations = vec![Destination::to("PACS")];
        let instance = start(&h, workflow(vec![a])).await;
        let exec = instance.tasks[0].execution_id.clone();

        h.executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Dispatched);
        assert_eq!(stored.tasks[0].exports, vec![ExportExecution::pending("PACS")]);

        let requests = h.publisher.messages_on("md.export.request.PACS").await;
        assert_eq!(requests.len(), 1);
        let request: ExportRequestEvent = requests[0].decode().unwrap();
        assert_eq!(request.export_task_id, exec);

        let complete = ExportCompleteEvent {
            workflow_instance_id: instance.id.clone(),
            export_task_id: exec.clone(),
            destination: Some("PACS".to_string()),
            status: ExportCompleteStatus::Success,
            failure_reason: None,
            file_statuses: HashMap::new(),
        };
        let outcome = h
            .executor
            .process_export_complete(&complete, "c1")
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
        assert_eq!(stored.tasks[0].exports[0].status, ExportStatus::Succeeded);

        let again = h
            .executor
            .process_export_complete(&complete, "c1")
            .await
            .unwrap();
        assert_eq!(again, UpdateOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_export_failure_fails_instance() {
        let h = harness();
        let mut a = template("a");
        a.export_destinations = vec![Destination::to("PACS")];
        let instance = start(&h, workflow(vec![a])).await;
        let exec = instance.tasks[0].execution_id.clone();
        h.executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();

        let complete = ExportCompleteEvent {
            workflow_instance_id: instance.id.clone(),
            export_task_id: exec,
            destination: None,
            status: ExportCompleteStatus::Failure,
            failure_reason: Some("association rejected".to_string()),
            file_statuses: HashMap::new(),
        };
        h.executor
            .process_export_complete(&complete, "c1")
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(
            stored.tasks[0].exports[0].message.as_deref(),
            Some("association rejected")
        );
    }

    #[tokio::test]
    async fn test_export_publish_failure_fails_instance() {
        let h = harness();
        let mut a = template("a");
        a.export_destinations = vec![Destination::to("PACS")];
        let instance = start(&h, workflow(vec![a])).await;
        h.publisher.fail_topic("md.export.request.PACS").await;

        let exec = instance.tasks[0].execution_id.clone();
        h.executor
            .process_task_update(&update(&instance, &exec, TaskExecutionStatus::Succeeded))
            .await
            .unwrap();

        let stored = h.store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert_eq!(stored.tasks[0].exports[0].status, ExportStatus::Failed);
    }

    #[test]
    fn test_child_execution_id_is_deterministic() {
        assert_eq!(child_execution_id("e1", "b"), child_execution_id("e1", "b"));
        assert_ne!(child_execution_id("e1", "b"), child_execution_id("e1", "c"));
        assert_ne!(child_execution_id("e1", "b"), child_execution_id("e2", "b"));
    }
}
