//! Payload listener.
//!
//! Validates inbound requests, task updates and export completions, hands
//! them to the orchestrator and maps the result to ack, reject or requeue.

pub mod receiver;
pub mod validator;

pub use receiver::EventReceiver;
pub use validator::{validate_export_complete, validate_request, validate_update, ValidationError};
