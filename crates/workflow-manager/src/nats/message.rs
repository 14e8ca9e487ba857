//! Message envelope shared by every topic.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Content type of every body this service produces.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Envelope around a JSON body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub application_id: String,
    pub correlation_id: String,
    #[serde(default)]
    pub message_description: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub created: DateTime<Utc>,
    pub body: serde_json::Value,
}

fn default_content_type() -> String {
    JSON_CONTENT_TYPE.to_string()
}

impl Message {
    /// Wrap `body` in a new envelope.
    pub fn new<T: Serialize>(
        body: &T,
        application_id: &str,
        correlation_id: &str,
        message_description: &str,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            application_id: application_id.to_string(),
            correlation_id: correlation_id.to_string(),
            message_description: message_description.to_string(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            created: Utc::now(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Deserialize the body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskCancellationEvent;
    use crate::db::models::FailureReason;

    #[test]
    fn test_envelope_carries_body() {
        let event = TaskCancellationEvent {
            workflow_instance_id: "wf-1".to_string(),
            task_id: "seg".to_string(),
            execution_id: "e-1".to_string(),
            target_identity: Some("pod-7".to_string()),
            reason: FailureReason::TimedOut,
            message: None,
        };

        let message = Message::new(&event, "workflow-manager", "c-1", "task cancellation").unwrap();
        let bytes = message.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.correlation_id, "c-1");
        assert_eq!(parsed.content_type, JSON_CONTENT_TYPE);
        assert_eq!(parsed.body["reason"], "timed_out");
        assert_eq!(parsed.decode::<TaskCancellationEvent>().unwrap(), event);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Message::from_bytes(b"not json").is_err());
    }
}
