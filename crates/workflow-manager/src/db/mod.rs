//! Persistence for workflow instances, task executions, payloads and
//! workflow revisions.
//!
//! The orchestrator works against the [`WorkflowStore`] and
//! [`WorkflowDefinitions`] traits; [`PgStore`] backs them with PostgreSQL
//! through SQLx and [`MemoryStore`] keeps everything in process.

pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use pool::{create_pool, health_check, DbPool};
pub use postgres::PgStore;
pub use store::{WorkflowDefinitions, WorkflowStore};
