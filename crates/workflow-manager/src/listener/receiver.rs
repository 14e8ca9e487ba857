//! Bus handler feeding the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Topics;
use crate::db::models::Payload;
use crate::db::WorkflowStore;
use crate::engine::WorkflowExecutor;
use crate::error::{AppError, Disposition};
use crate::events::{ExportCompleteEvent, TaskUpdateEvent, WorkflowRequestEvent};
use crate::nats::{Message, MessageHandler, MessageOutcome};
use crate::result_ext::ResultExt;

use super::validator::{validate_export_complete, validate_request, validate_update};

/// Routes inbound messages by topic and settles them from the result.
pub struct EventReceiver {
    executor: Arc<WorkflowExecutor>,
    store: Arc<dyn WorkflowStore>,
    topics: Topics,
}

impl EventReceiver {
    pub fn new(executor: Arc<WorkflowExecutor>, store: Arc<dyn WorkflowStore>, topics: Topics) -> Self {
        Self {
            executor,
            store,
            topics,
        }
    }

    async fn on_request(&self, message: Message) -> MessageOutcome {
        let request: WorkflowRequestEvent = match message.decode() {
            Ok(request) => request,
            Err(e) => return undecodable(&message, e),
        };

        if let Err(e) = validate_request(&request) {
            warn!(
                message_id = %message.message_id,
                correlation_id = %message.correlation_id,
                error = %e,
                "Rejecting invalid workflow request"
            );
            return MessageOutcome::Reject;
        }

        let payload = Payload::from_request(&request);
        match self.store.create_payload(&payload).await.log("recording payload") {
            Ok(true) => debug!(payload_id = %payload.payload_id, "Payload recorded"),
            Ok(false) => debug!(payload_id = %payload.payload_id, "Payload already recorded"),
            Err(e) => return settle(&e),
        }

        match self
            .executor
            .create_workflow_instances(&request, &payload)
            .await
            .log("creating workflow instances")
        {
            Ok(report) => {
                info!(
                    payload_id = %payload.payload_id,
                    correlation_id = %payload.correlation_id,
                    created = report.created.len(),
                    skipped = report.skipped.len(),
                    "Workflow request handled"
                );
                MessageOutcome::Ack
            }
            Err(e) => settle(&e),
        }
    }

    async fn on_task_update(&self, message: Message) -> MessageOutcome {
        let event: TaskUpdateEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => return undecodable(&message, e),
        };

        if let Err(e) = validate_update(&event) {
            warn!(
                message_id = %message.message_id,
                correlation_id = %message.correlation_id,
                error = %e,
                "Rejecting invalid task update"
            );
            return MessageOutcome::Reject;
        }

        match self
            .executor
            .process_task_update(&event)
            .await
            .log("processing task update")
        {
            Ok(_) => MessageOutcome::Ack,
            Err(AppError::NotFound(_)) if event.is_timeout() => {
                warn!(
                    execution_id = %event.execution_id,
                    "Dropping timeout update for an unknown task"
                );
                MessageOutcome::Ack
            }
            Err(e) => settle(&e),
        }
    }

    async fn on_export_complete(&self, message: Message) -> MessageOutcome {
        let event: ExportCompleteEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => return undecodable(&message, e),
        };

        if let Err(e) = validate_export_complete(&event) {
            warn!(
                message_id = %message.message_id,
                correlation_id = %message.correlation_id,
                error = %e,
                "Rejecting invalid export completion"
            );
            return MessageOutcome::Reject;
        }

        match self
            .executor
            .process_export_complete(&event, &message.correlation_id)
            .await
            .log("processing export completion")
        {
            Ok(_) => MessageOutcome::Ack,
            Err(e) => settle(&e),
        }
    }
}

#[async_trait]
impl MessageHandler for EventReceiver {
    async fn handle(&self, topic: &str, message: Message) -> MessageOutcome {
        if topic == self.topics.workflow_request {
            self.on_request(message).await
        } else if topic == self.topics.task_update {
            self.on_task_update(message).await
        } else if topic == self.topics.export_complete {
            self.on_export_complete(message).await
        } else {
            warn!(topic = %topic, message_id = %message.message_id, "Message on unexpected topic");
            MessageOutcome::Reject
        }
    }
}

fn settle(error: &AppError) -> MessageOutcome {
    match error.disposition() {
        Disposition::Reject => MessageOutcome::Reject,
        Disposition::Requeue => MessageOutcome::Requeue,
    }
}

fn undecodable(message: &Message, error: serde_json::Error) -> MessageOutcome {
    warn!(
        message_id = %message.message_id,
        description = %message.message_description,
        error = %error,
        "Rejecting undecodable message body"
    );
    MessageOutcome::Reject
}
