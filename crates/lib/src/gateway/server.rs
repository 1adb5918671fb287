//! Gateway process: builds the ingestion pipeline, holds the platform connection open,
//! and serves the status endpoint until shutdown.

use crate::clock::{Clock, SystemClock};
use crate::config::{self, Config};
use crate::connection::{
    ConnectionManager, Connector, HealthSnapshot, WatchdogSettings, WebSocketConnector,
};
use crate::handoff::ForwardingHandler;
use crate::ingest::{AdmissionPolicy, DedupCache, DedupSettings};
use crate::routing::{EventRouter, HandlerRegistry, MessageClassifier, ParticipationStore};
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// The wired ingestion pipeline: router plus the connection feeding it.
#[derive(Clone)]
pub struct Pipeline {
    pub router: Arc<EventRouter>,
    pub manager: Arc<ConnectionManager>,
}

impl Pipeline {
    /// Wire clock -> dedup cache -> classifier -> router -> connection manager.
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn Connector>,
        handlers: HandlerRegistry,
    ) -> Self {
        let dedup = Arc::new(DedupCache::new(
            DedupSettings::from_config(&config.ingest),
            clock.clone(),
        ));
        let participation = Arc::new(ParticipationStore::new(
            config.routing.participation_capacity,
        ));
        let classifier = MessageClassifier::new(
            config::resolve_bot_id(config),
            config.routing.bypass_commands.clone(),
            participation,
        );
        let router = Arc::new(EventRouter::new(
            clock.clone(),
            AdmissionPolicy::from_config(&config.ingest),
            dedup,
            classifier,
            handlers,
        ));
        let manager = Arc::new(ConnectionManager::new(
            connector,
            router.clone(),
            clock,
            WatchdogSettings::from_config(&config.watchdog),
        ));
        Self { router, manager }
    }
}

/// Handlers that forward every handoff to the configured downstream.
pub fn forwarding_handlers(config: &Config) -> HandlerRegistry {
    let forward = Arc::new(ForwardingHandler::from_config(&config.downstream));
    match forward.url() {
        Some(url) => log::info!("gateway: forwarding handoffs to {}", url),
        None => log::info!("gateway: no downstream url configured; handoffs are logged only"),
    }
    HandlerRegistry::new()
        .with_messages(forward.clone())
        .with_card_actions(forward.clone())
        .with_tasks(forward)
}

#[derive(Clone)]
struct GatewayState {
    manager: Arc<ConnectionManager>,
}

#[derive(Serialize)]
struct StatusBody {
    runtime: &'static str,
    connection: HealthSnapshot,
}

/// Run the gateway with the platform WebSocket connector until SIGINT/SIGTERM.
/// `config_path` is the file the config was loaded from (for logging).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    log::info!("gateway: using config {}", config_path.display());
    if config::resolve_bot_id(&config).is_none() {
        log::warn!("gateway: platform.botId not set; group mentions will not be detected");
    }
    let connector = Arc::new(WebSocketConnector::from_config(&config));
    let pipeline = Pipeline::new(
        &config,
        Arc::new(SystemClock),
        connector,
        forwarding_handlers(&config),
    );
    serve(&config, pipeline, shutdown_signal()).await
}

/// Start the connection and watchdog, serve `GET /` on the gateway port, and tear
/// everything down once `shutdown` completes.
pub async fn serve<F>(config: &Config, pipeline: Pipeline, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = config.gateway.bind.trim();
    if !config::is_loopback_bind(bind) {
        log::warn!(
            "gateway: status endpoint bound to non-loopback address {}; it is unauthenticated",
            bind
        );
    }
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let manager = pipeline.manager.clone();
    if !manager.start("startup").await {
        log::warn!("gateway: initial connection failed; the watchdog will retry");
    }
    let (stop_tx, stop_rx) = watch::channel(false);
    let watchdog = manager.spawn_watchdog(stop_rx);

    let app = Router::new()
        .route("/", get(health_http))
        .with_state(GatewayState {
            manager: manager.clone(),
        });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown signal received, stopping watchdog and connection");
            let _ = stop_tx.send(true);
        })
        .await
        .context("gateway server exited")?;

    if let Err(e) = watchdog.await {
        log::warn!("watchdog: task ended abnormally: {}", e);
    }
    manager.shutdown().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// GET / returns runtime status and connection health (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<StatusBody> {
    Json(StatusBody {
        runtime: "running",
        connection: state.manager.health(),
    })
}
