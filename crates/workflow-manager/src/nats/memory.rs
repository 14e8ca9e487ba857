//! In-memory publisher that records every message.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::message::Message;
use super::publisher::{MessagePublisher, NatsError};

/// Records published messages; topics can be set to fail.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Message)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish to `topic` fail until cleared.
    pub async fn fail_topic(&self, topic: &str) {
        self.failing.lock().await.insert(topic.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failing.lock().await.clear();
    }

    pub async fn messages(&self) -> Vec<(String, Message)> {
        self.published.lock().await.clone()
    }

    /// Messages published to `topic`, oldest first.
    pub async fn messages_on(&self, topic: &str) -> Vec<Message> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.published.lock().await.clear();
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), NatsError> {
        if self.failing.lock().await.contains(topic) {
            return Err(NatsError::Publish(format!("publish to {} refused", topic)));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_fails() {
        let publisher = MemoryPublisher::new();
        let message = Message::new(&serde_json::json!({"a": 1}), "app", "c", "test").unwrap();

        publisher.publish("one", &message).await.unwrap();
        publisher.fail_topic("two").await;
        assert!(publisher.publish("two", &message).await.is_err());

        assert_eq!(publisher.messages().await.len(), 1);
        assert_eq!(publisher.messages_on("one").await.len(), 1);
        assert!(publisher.messages_on("two").await.is_empty());
    }
}
