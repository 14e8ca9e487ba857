//! HTTP handlers for the Workflow Manager.

pub mod health;

pub use health::{api_health, health_check};
