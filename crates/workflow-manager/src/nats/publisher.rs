//! NATS JetStream publisher.
//!
//! The orchestrator and the timeout supervisor publish through the
//! [`MessagePublisher`] trait so tests can swap in
//! [`super::memory::MemoryPublisher`].

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::message::Message;

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "workflow_manager";

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Not connected to NATS")]
    NotConnected,
}

/// Sends envelopes to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), NatsError>;
}

/// JetStream publisher; waits for the server acknowledgement of every publish.
#[derive(Clone)]
pub struct NatsPublisher {
    js: Context,
}

impl NatsPublisher {
    /// Create a publisher and make sure `stream_name` captures `subjects`.
    pub async fn new(
        client: Arc<async_nats::Client>,
        stream_name: Option<&str>,
        subjects: Vec<String>,
    ) -> Result<Self, NatsError> {
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);
        let js = jetstream::new((*client).clone());

        ensure_stream(&js, stream, subjects).await?;

        Ok(Self { js })
    }

    pub fn context(&self) -> &Context {
        &self.js
    }
}

/// Create the stream if it does not exist yet.
pub(crate) async fn ensure_stream(
    js: &Context,
    stream: &str,
    subjects: Vec<String>,
) -> Result<(), NatsError> {
    match js.get_stream(stream).await {
        Ok(_) => {
            tracing::debug!(stream = %stream, "Using existing NATS stream");
            Ok(())
        }
        Err(_) => {
            let config = jetstream::stream::Config {
                name: stream.to_string(),
                subjects: subjects.clone(),
                max_age: std::time::Duration::from_secs(7 * 24 * 3600),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            };

            js.create_stream(config)
                .await
                .map_err(|e| NatsError::JetStream(e.to_string()))?;

            tracing::info!(stream = %stream, subjects = ?subjects, "Created NATS stream");
            Ok(())
        }
    }
}

#[async_trait]
impl MessagePublisher for NatsPublisher {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), NatsError> {
        let payload = message
            .to_bytes()
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        self.js
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            topic = %topic,
            message_id = %message.message_id,
            correlation_id = %message.correlation_id,
            "Published message"
        );

        Ok(())
    }
}
