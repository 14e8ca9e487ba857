//! Shared state for the HTTP handlers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::supervisor::SupervisorStatus;

/// Cloned into every handler through Axum's state.
#[derive(Clone)]
pub struct AppState {
    /// Database pool; `None` when running against the in-memory store.
    pub db: Option<DbPool>,

    pub config: Arc<AppConfig>,

    /// Live timeout supervisor status.
    pub supervisor: watch::Receiver<SupervisorStatus>,

    /// NATS client, when connected.
    pub nats: Option<Arc<async_nats::Client>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        db: Option<DbPool>,
        config: AppConfig,
        supervisor: watch::Receiver<SupervisorStatus>,
        nats: Option<Arc<async_nats::Client>>,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            supervisor,
            nats,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn supervisor_status(&self) -> SupervisorStatus {
        self.supervisor.borrow().clone()
    }

    /// Connection state of the NATS client, if there is one.
    pub fn nats_state(&self) -> Option<String> {
        self.nats
            .as_ref()
            .map(|client| format!("{:?}", client.connection_state()).to_lowercase())
    }
}
