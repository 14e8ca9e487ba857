//! Payload model: the record of one inbound request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::WorkflowRequestEvent;

/// Immutable record of a received data payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub payload_id: String,
    pub bucket: String,
    pub correlation_id: String,
    #[serde(default)]
    pub calling_ae_title: Option<String>,
    #[serde(default)]
    pub called_ae_title: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Workflow ids named by the request.
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created: DateTime<Utc>,
}

impl Payload {
    pub fn from_request(request: &WorkflowRequestEvent) -> Self {
        Self {
            payload_id: request.payload_id.clone(),
            bucket: request.bucket.clone(),
            correlation_id: request.correlation_id.clone(),
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            timestamp: request.timestamp,
            workflows: request.workflows.clone(),
            metadata: request.metadata.clone(),
            created: Utc::now(),
        }
    }
}
