//! NATS JetStream subscriber.
//!
//! Each topic gets a durable pull consumer. Messages are handled concurrently
//! up to a semaphore limit, and every handler result is settled as ack, term
//! (no redelivery) or nak with a redelivery delay.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::message::Message;
use super::publisher::NatsError;

/// How a handled message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ack,
    /// Drop without redelivery.
    Reject,
    /// Redeliver after the configured delay.
    Requeue,
}

/// Handles decoded envelopes from one or more topics.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, message: Message) -> MessageOutcome;
}

/// Subscription settings for one topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub consumer: String,
    pub max_concurrent: usize,
    pub requeue_delay: Duration,
}

/// JetStream pull subscriber.
#[derive(Clone)]
pub struct NatsSubscriber {
    js: Context,
    stream: String,
}

impl NatsSubscriber {
    pub fn new(js: Context, stream: &str) -> Self {
        Self {
            js,
            stream: stream.to_string(),
        }
    }

    /// Create or get the durable consumer for a subscription.
    async fn ensure_consumer(
        &self,
        subscription: &Subscription,
    ) -> Result<jetstream::consumer::Consumer<ConsumerConfig>, NatsError> {
        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;

        match stream.get_consumer(&subscription.consumer).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(subscription.consumer.clone()),
                    filter_subject: subscription.topic.clone(),
                    ..Default::default()
                };
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;
                tracing::info!(
                    consumer = %subscription.consumer,
                    topic = %subscription.topic,
                    "Created NATS consumer"
                );
                Ok(consumer)
            }
        }
    }

    /// Consume `subscription` until `shutdown` fires.
    pub async fn run<H>(
        &self,
        subscription: Subscription,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<(), NatsError>
    where
        H: MessageHandler + 'static,
    {
        let consumer = self.ensure_consumer(&subscription).await?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;
        let semaphore = Arc::new(Semaphore::new(subscription.max_concurrent.max(1)));

        tracing::info!(topic = %subscription.topic, "Subscribed");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = messages.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::warn!(topic = %subscription.topic, error = %e, "Failed to receive message");
                    drop(permit);
                    continue;
                }
                None => break,
            };

            let handler = handler.clone();
            let topic = subscription.topic.clone();
            let delay = subscription.requeue_delay;
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = match Message::from_bytes(&msg.payload) {
                    Ok(message) => handler.handle(&topic, message).await,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Undecodable message");
                        MessageOutcome::Reject
                    }
                };
                settle(&msg, outcome, delay).await;
            });
        }

        tracing::info!(topic = %subscription.topic, "Subscription stopped");
        Ok(())
    }
}

fn ack_kind(outcome: MessageOutcome, delay: Duration) -> AckKind {
    match outcome {
        MessageOutcome::Ack => AckKind::Ack,
        MessageOutcome::Reject => AckKind::Term,
        MessageOutcome::Requeue => AckKind::Nak(Some(delay)),
    }
}

async fn settle(msg: &jetstream::Message, outcome: MessageOutcome, delay: Duration) {
    if let Err(e) = msg.ack_with(ack_kind(outcome, delay)).await {
        tracing::warn!(outcome = ?outcome, error = %e, "Failed to settle message");
    }
}
