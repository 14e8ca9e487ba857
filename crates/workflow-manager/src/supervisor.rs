//! Timeout supervisor.
//!
//! Periodically fails tasks whose deadline passed. For each overdue task it
//! publishes a synthetic `Failed`/`TimedOut` update on the task-update topic,
//! so the transition goes through the regular update path, and then asks the
//! runner to cancel the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, Topics};
use crate::db::models::{FailureReason, TaskExecution, TaskExecutionStatus};
use crate::db::WorkflowStore;
use crate::error::AppResult;
use crate::events::{TaskCancellationEvent, TaskUpdateEvent};
use crate::nats::{Message, MessagePublisher};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub topics: Topics,
    pub application_id: String,
}

impl SupervisorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            interval: config.supervisor_interval(),
            batch_size: config.supervisor_batch_size,
            topics: config.topics(),
            application_id: config.application_id.clone(),
        }
    }
}

/// Counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Overdue tasks found.
    pub overdue: usize,
    /// Timeout updates published.
    pub timed_out: usize,
    /// Timeout updates that could not be published.
    pub failed: usize,
    /// Cancellations that could not be published.
    pub cancel_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorStatus {
    Starting,
    Running {
        last_scan: DateTime<Utc>,
        report: ScanReport,
    },
    Stopped,
}

impl SupervisorStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorStatus::Running { .. })
    }
}

pub struct TimeoutSupervisor {
    store: Arc<dyn WorkflowStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: SupervisorConfig,
    status: watch::Sender<SupervisorStatus>,
}

impl TimeoutSupervisor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: SupervisorConfig,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::Starting);
        Self {
            store,
            publisher,
            config,
            status,
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Scan on every tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Timeout supervisor started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(report) => {
                            self.status.send_replace(SupervisorStatus::Running {
                                last_scan: Utc::now(),
                                report,
                            });
                        }
                        Err(e) => error!(error = %e, "Timeout scan failed"),
                    }
                }
            }
        }

        self.status.send_replace(SupervisorStatus::Stopped);
        info!("Timeout supervisor stopped");
    }

    /// Fail every task currently past its deadline, up to the batch size.
    pub async fn scan_once(&self) -> AppResult<ScanReport> {
        let overdue = self
            .store
            .list_overdue_tasks(Utc::now(), self.config.batch_size)
            .await?;

        let mut report = ScanReport {
            overdue: overdue.len(),
            ..Default::default()
        };
        if overdue.is_empty() {
            debug!("No overdue tasks");
            return Ok(report);
        }

        let mut correlation_ids: HashMap<String, String> = HashMap::new();

        for task in &overdue {
            let correlation_id = match correlation_ids.get(&task.workflow_instance_id) {
                Some(id) => id.clone(),
                None => {
                    let id = self
                        .store
                        .get_instance(&task.workflow_instance_id)
                        .await?
                        .map(|i| i.correlation_id)
                        .unwrap_or_default();
                    correlation_ids.insert(task.workflow_instance_id.clone(), id.clone());
                    id
                }
            };

            let message = format!("Task timed out at {}", task.timeout.to_rfc3339());

            let update = timeout_update(task, &correlation_id, &message);
            if let Err(e) = self
                .publish(&self.config.topics.task_update, &update, &correlation_id, "task timeout")
                .await
            {
                error!(
                    workflow_instance_id = %task.workflow_instance_id,
                    execution_id = %task.execution_id,
                    error = %e,
                    "Failed to publish timeout update"
                );
                report.failed += 1;
                continue;
            }
            report.timed_out += 1;

            warn!(
                workflow_instance_id = %task.workflow_instance_id,
                task_id = %task.task_id,
                execution_id = %task.execution_id,
                correlation_id = %correlation_id,
                deadline = %task.timeout,
                "Task timed out"
            );

            let cancellation = TaskCancellationEvent {
                workflow_instance_id: task.workflow_instance_id.clone(),
                task_id: task.task_id.clone(),
                execution_id: task.execution_id.clone(),
                target_identity: task.identity().map(str::to_string),
                reason: FailureReason::TimedOut,
                message: Some(message),
            };
            if let Err(e) = self
                .publish(
                    &self.config.topics.task_cancellation,
                    &cancellation,
                    &correlation_id,
                    "task cancellation",
                )
                .await
            {
                warn!(
                    execution_id = %task.execution_id,
                    error = %e,
                    "Failed to publish task cancellation"
                );
                report.cancel_failures += 1;
            }
        }

        info!(
            overdue = report.overdue,
            timed_out = report.timed_out,
            failed = report.failed,
            cancel_failures = report.cancel_failures,
            "Timeout scan finished"
        );
        Ok(report)
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
}

fn timeout_update(task: &TaskExecution, correlation_id: &str, message: &str) -> TaskUpdateEvent {
    TaskUpdateEvent {
        workflow_instance_id: task.workflow_instance_id.clone(),
        task_id: task.task_id.clone(),
        execution_id: task.execution_id.clone(),
        correlation_id: correlation_id.to_string(),
        status: TaskExecutionStatus::Failed,
        reason: FailureReason::TimedOut,
        message: Some(message.to_string()),
        execution_stats: task.execution_stats.clone(),
        metadata: HashMap::new(),
        outputs: Vec::new(),
    }
}
