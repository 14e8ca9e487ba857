//! Application configuration for the workflow manager.

use std::time::Duration;

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `WFM_`, e.g. `WFM_PORT`,
/// `WFM_NATS_URL`, `WFM_TASK_UPDATE_TOPIC`, `WFM_SUPERVISOR_INTERVAL_SECS`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Health endpoint bind address
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifies this service in message envelopes
    #[serde(default = "default_application_id")]
    pub application_id: String,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    #[serde(default = "default_workflow_request_topic")]
    pub workflow_request_topic: String,

    #[serde(default = "default_task_dispatch_topic")]
    pub task_dispatch_topic: String,

    #[serde(default = "default_task_update_topic")]
    pub task_update_topic: String,

    #[serde(default = "default_task_cancellation_topic")]
    pub task_cancellation_topic: String,

    #[serde(default = "default_export_complete_topic")]
    pub export_complete_topic: String,

    /// Export requests go to `{prefix}.{destination}`
    #[serde(default = "default_export_request_prefix")]
    pub export_request_prefix: String,

    /// Timeout for tasks that do not declare one
    #[serde(default = "default_task_timeout_minutes")]
    pub task_timeout_minutes: i64,

    #[serde(default = "default_supervisor_interval_secs")]
    pub supervisor_interval_secs: u64,

    #[serde(default = "default_supervisor_batch_size")]
    pub supervisor_batch_size: i64,

    /// Concurrent handlers per subscribed topic
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,

    /// Redelivery delay for requeued messages
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,

    /// S3-compatible endpoint used for artifact existence checks
    #[serde(default = "default_storage_endpoint")]
    pub storage_endpoint: String,

    /// Directory of workflow YAML files loaded at startup
    #[serde(default)]
    pub workflow_dir: Option<String>,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_application_id() -> String {
    "workflow-manager".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "workflow_manager".to_string()
}

fn default_workflow_request_topic() -> String {
    "md.workflow.request".to_string()
}

fn default_task_dispatch_topic() -> String {
    "md.workflow.task_dispatch".to_string()
}

fn default_task_update_topic() -> String {
    "md.workflow.task_update".to_string()
}

fn default_task_cancellation_topic() -> String {
    "md.workflow.task.cancel".to_string()
}

fn default_export_complete_topic() -> String {
    "md.export.complete".to_string()
}

fn default_export_request_prefix() -> String {
    "md.export.request".to_string()
}

fn default_task_timeout_minutes() -> i64 {
    60
}

fn default_supervisor_interval_secs() -> u64 {
    60
}

fn default_supervisor_batch_size() -> i64 {
    500
}

fn default_max_concurrent_handlers() -> usize {
    8
}

fn default_requeue_delay_ms() -> u64 {
    1000
}

fn default_storage_endpoint() -> String {
    "http://localhost:9000".to_string()
}

/// Topic names used by the orchestrator and the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub workflow_request: String,
    pub task_dispatch: String,
    pub task_update: String,
    pub task_cancellation: String,
    pub export_complete: String,
    pub export_request_prefix: String,
}

impl Topics {
    pub fn export_request(&self, destination: &str) -> String {
        format!("{}.{}", self.export_request_prefix, destination)
    }

    /// Subjects the JetStream stream must capture.
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![
            self.workflow_request.clone(),
            self.task_dispatch.clone(),
            self.task_update.clone(),
            self.task_cancellation.clone(),
            self.export_complete.clone(),
            format!("{}.>", self.export_request_prefix),
        ]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            workflow_request: default_workflow_request_topic(),
            task_dispatch: default_task_dispatch_topic(),
            task_update: default_task_update_topic(),
            task_cancellation: default_task_cancellation_topic(),
            export_complete: default_export_complete_topic(),
            export_request_prefix: default_export_request_prefix(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `WFM_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("WFM_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn topics(&self) -> Topics {
        Topics {
            workflow_request: self.workflow_request_topic.clone(),
            task_dispatch: self.task_dispatch_topic.clone(),
            task_update: self.task_update_topic.clone(),
            task_cancellation: self.task_cancellation_topic.clone(),
            export_complete: self.export_complete_topic.clone(),
            export_request_prefix: self.export_request_prefix.clone(),
        }
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_interval_secs.max(1))
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            application_id: default_application_id(),
            nats_url: default_nats_url(),
            nats_stream: default_nats_stream(),
            workflow_request_topic: default_workflow_request_topic(),
            task_dispatch_topic: default_task_dispatch_topic(),
            task_update_topic: default_task_update_topic(),
            task_cancellation_topic: default_task_cancellation_topic(),
            export_complete_topic: default_export_complete_topic(),
            export_request_prefix: default_export_request_prefix(),
            task_timeout_minutes: default_task_timeout_minutes(),
            supervisor_interval_secs: default_supervisor_interval_secs(),
            supervisor_batch_size: default_supervisor_batch_size(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            requeue_delay_ms: default_requeue_delay_ms(),
            storage_endpoint: default_storage_endpoint(),
            workflow_dir: None,
            log_json: false,
        }
    }
}
