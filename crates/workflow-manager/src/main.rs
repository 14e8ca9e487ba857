//! Workflow Manager Server
//!
//! Consumes workflow requests, task updates and export completions from NATS
//! JetStream, runs the timeout supervisor and serves health endpoints.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use workflow_manager::{
    config::{AppConfig, DatabaseConfig},
    db::{create_pool, PgStore},
    definitions,
    engine::{ArtifactResolver, ExecutorConfig, WorkflowExecutor},
    handlers,
    listener::EventReceiver,
    nats::{NatsPublisher, NatsSubscriber, Subscription},
    state::AppState,
    storage::HttpStorage,
    supervisor::{SupervisorConfig, TimeoutSupervisor},
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,workflow_manager=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env()?;
    let db_config = DatabaseConfig::from_env()?;

    init_tracing(app_config.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %app_config.host,
        port = app_config.port,
        nats_url = %app_config.nats_url,
        "Starting Workflow Manager"
    );

    // Store
    let db_pool = create_pool(&db_config).await?;
    let store = Arc::new(PgStore::new(db_pool.clone(), &db_config.schema)?);
    store.bootstrap().await?;

    if let Some(dir) = &app_config.workflow_dir {
        let report = definitions::load_directory(Path::new(dir), &*store).await?;
        tracing::info!(
            dir = %dir,
            saved = report.saved.len(),
            rejected = report.rejected.len(),
            "Workflow definitions loaded"
        );
    }

    // Messaging
    let topics = app_config.topics();
    let nats_client = Arc::new(async_nats::connect(&app_config.nats_url).await?);
    tracing::info!(url = %app_config.nats_url, "Connected to NATS");

    let publisher = Arc::new(
        NatsPublisher::new(
            nats_client.clone(),
            Some(app_config.nats_stream.as_str()),
            topics.stream_subjects(),
        )
        .await?,
    );
    let subscriber = NatsSubscriber::new(publisher.context().clone(), &app_config.nats_stream);

    let storage = Arc::new(HttpStorage::new(&app_config.storage_endpoint));

    let executor = Arc::new(WorkflowExecutor::new(
        store.clone(),
        store.clone(),
        publisher.clone(),
        ArtifactResolver::new(storage),
        ExecutorConfig::from_app(&app_config),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // Timeout supervisor
    let supervisor = Arc::new(TimeoutSupervisor::new(
        store.clone(),
        publisher.clone(),
        SupervisorConfig::from_app(&app_config),
    ));
    let supervisor_status = supervisor.subscribe();
    {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            supervisor.run(shutdown).await;
        });
    }

    // Listeners
    let receiver = Arc::new(EventReceiver::new(executor, store.clone(), topics.clone()));
    for (topic, consumer) in [
        (&topics.workflow_request, "workflow-manager-request"),
        (&topics.task_update, "workflow-manager-task-update"),
        (&topics.export_complete, "workflow-manager-export-complete"),
    ] {
        let subscription = Subscription {
            topic: topic.clone(),
            consumer: consumer.to_string(),
            max_concurrent: app_config.max_concurrent_handlers,
            requeue_delay: app_config.requeue_delay(),
        };
        let subscriber = subscriber.clone();
        let receiver = receiver.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let topic = subscription.topic.clone();
            if let Err(e) = subscriber.run(subscription, receiver, shutdown.clone()).await {
                tracing::error!(topic = %topic, error = %e, "Subscriber stopped");
                shutdown.cancel();
            }
        });
    }

    // Health server
    let state = AppState::new(
        Some(db_pool),
        app_config.clone(),
        supervisor_status,
        Some(nats_client),
    );
    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
