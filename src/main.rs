// Main entry point - Dependency injection and server setup
use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use dashboard_sync::application::connection_manager::{ConnectionStatus, Feed};
use dashboard_sync::application::session::SyncSession;
use dashboard_sync::domain::envelope::Topic;
use dashboard_sync::infrastructure::config::load_sync_config;
use dashboard_sync::infrastructure::http_widget_repository::HttpWidgetRepository;
use dashboard_sync::infrastructure::websocket_transport::WebSocketTransport;
use dashboard_sync::presentation::app_state::AppState;
use dashboard_sync::presentation::handlers::{
    apply_command, create_widget, get_session, health_check, list_widgets, stream_events,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_sync_config().context("Failed to load configuration")?;

    // Create adapters (infrastructure layer)
    let transport = Arc::new(WebSocketTransport::new(config.realtime.connect_timeout()));
    let repository = Arc::new(HttpWidgetRepository::new(
        &config.api.base_url,
        config.api.token.clone(),
        config.api.timeout(),
    )?);

    // Create session (application layer)
    let session = Arc::new(SyncSession::new(
        config.realtime.connection_settings(),
        transport,
        repository,
    ));

    session.subscribe(Topic::SystemAlert, |envelope| {
        match envelope.system_alert() {
            Ok(alert) => tracing::warn!(severity = ?alert.severity, "System alert: {}", alert.message),
            Err(e) => tracing::warn!(payload = %envelope.payload(), "Unreadable system alert: {}", e),
        }
        Ok(())
    });

    let mut state_rx = session.watch();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            if state.degraded {
                tracing::warn!("Live channel degraded; serve snapshot data only");
            } else if state.status != ConnectionStatus::Connecting {
                tracing::info!(status = ?state.status, attempts = state.reconnect_attempts, "Live channel state changed");
            }
        }
    });

    for feed in [Feed::Market, Feed::Assets, Feed::Bids] {
        session.request_feed(feed).await;
    }
    session.connect().await;

    match session.hydrate().await {
        Ok(count) => tracing::info!("Loaded {} widgets from backend", count),
        Err(e) => tracing::warn!("Starting with an empty dashboard: {}", e),
    }

    // Create application state
    let state = Arc::new(AppState {
        session: Arc::clone(&session),
    });

    // Build router (presentation layer)
    // Responses are compressed by our own builders, so no CompressionLayer here.
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/session", get(get_session))
        .route("/widgets", get(list_widgets).post(create_widget))
        .route("/widgets/commands", post(apply_command))
        .route("/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {:?}", config.server.bind))?;
    tracing::info!("Starting dashboard-sync service on {}", addr);

    // Closing the session ends open event streams so graceful shutdown can finish.
    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            session.shutdown().await;
        })
        .await?;

    Ok(())
}
