//! Error types for the Workflow Manager.
//!
//! `AppError` is the error every orchestrator operation returns. Its
//! [`Disposition`] decides what happens to the inbound message that caused
//! it, so handlers branch on the error kind and never on message text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::engine::artifacts::ArtifactError;
use crate::nats::NatsError;
use crate::storage::StorageError;

/// Application-level errors for the workflow manager.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Workflow, instance or task execution not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed request or event payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conditional write lost against a concurrent handler
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Message bus error
    #[error("Messaging error: {0}")]
    Messaging(#[from] NatsError),

    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Artifact resolution error
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML workflow definitions)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What a message handler should do with the message that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the message; redelivery can never succeed.
    Reject,
    /// Redeliver later; the failure may be a race or an outage.
    Requeue,
}

impl AppError {
    /// Classify the error for message handling.
    pub fn disposition(&self) -> Disposition {
        match self {
            AppError::Validation(_) | AppError::Parse(_) => Disposition::Reject,
            AppError::Database(_)
            | AppError::NotFound(_)
            | AppError::Conflict(_)
            | AppError::Messaging(_)
            | AppError::Storage(_)
            | AppError::Artifact(_)
            | AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Internal(_) => Disposition::Requeue,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Messaging(e) => {
                tracing::error!(error = %e, "Messaging error");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::Storage(e) => {
                tracing::warn!(error = %e, "Storage error");
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::Parse(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            _ => {
                tracing::error!(error = %self, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}
