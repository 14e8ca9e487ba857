//! Workflow Manager Library
//!
//! Event-driven workflow execution service:
//!
//! - **Request handling**: A workflow request for a stored payload creates one
//!   workflow instance per matching workflow and dispatches its first task
//! - **Task routing**: Task results drive conditional task and export
//!   destinations until every branch is closed
//! - **Timeouts**: A background supervisor fails and cancels stalled tasks
//!
//! ## Architecture
//!
//! Instances and task executions live in PostgreSQL; every state change is a
//! conditional write so handlers can run concurrently and messages can be
//! redelivered. NATS JetStream carries requests, dispatches, updates and
//! exports. Workflow definitions are YAML documents stored as immutable
//! revisions.
//!
//! ## Modules
//!
//! - [`conditions`]: Destination condition expressions
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Store traits, PostgreSQL and in-memory implementations
//! - [`definitions`]: Loading workflow YAML from a directory
//! - [`engine`]: Artifact resolution and the execution orchestrator
//! - [`error`]: Error types with message dispositions and Axum integration
//! - [`events`]: Message bodies
//! - [`handlers`]: HTTP health routes
//! - [`listener`]: Inbound message validation and routing
//! - [`nats`]: JetStream publisher and subscriber
//! - [`storage`]: Object storage existence checks
//! - [`supervisor`]: Task timeout supervisor
//! - [`workflow`]: Workflow definition model and parser

pub mod conditions;
pub mod config;
pub mod db;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod listener;
pub mod nats;
pub mod result_ext;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod workflow;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
