//! Room Service
//!
//! WebSocket signaling server for multi-party media rooms.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Initialize the negotiation backend
//! 4. Spawn the room pool
//! 5. Serve signaling, inspection, health and metrics routes
//! 6. Wait for shutdown signal, then drain rooms

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use room_service::actors::{ActorMetrics, RoomPoolHandle};
use room_service::config::Config;
use room_service::negotiation::mock::MockNegotiationBackend;
use room_service::negotiation::NegotiationBackend;
use room_service::observability::metrics::init_metrics_recorder;
use room_service::observability::{health_router, HealthState};
use room_service::transport::{signaling_router, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for each room to detach its participants.
const ROOM_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address(),
        idle_timeout_seconds = config.idle_timeout_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        allowed_rooms = ?config.allowed_rooms,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    warn!("Using the in-process loopback negotiation backend; no media is relayed");
    let backend: Arc<dyn NegotiationBackend> = Arc::new(MockNegotiationBackend::accepting());

    let actor_metrics = ActorMetrics::new();
    let pool = RoomPoolHandle::new(config.pool_config(), backend, actor_metrics);
    info!("Room pool initialized");

    // Cancelled only after the pool has drained.
    let server_shutdown = CancellationToken::new();
    let health_state = Arc::new(HealthState::new());

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = signaling_router(AppState::new(pool.clone(), config.allowed_rooms.clone()))
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address().parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address(), "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind server");
        format!("Failed to bind server to {addr}: {e}")
    })?;

    let server_token = server_shutdown.clone();
    let server = tokio::spawn(async move {
        info!(addr = %addr, "Server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    health_state.set_ready();
    info!(addr = %addr, "Room Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Rooms say goodbye to their participants before the server stops.
    if !pool.drain(ROOM_DRAIN_TIMEOUT).await {
        warn!("Room pool did not drain before the deadline");
    }
    server_shutdown.cancel();

    if let Err(e) = server.await {
        warn!(error = %e, "Server task ended abnormally");
    }

    info!("Room Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
