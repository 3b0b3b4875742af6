//! Liquidation service entry point.
//!
//! Polls the upstream liquidations indexer, maintains the cached derived
//! views in Redis, and serves the read API plus the live SSE stream.

use anyhow::Result;
use external_services::hyperliquid::{ClientConfig, LiquidationsClient};
use external_services::CacheClient;
use liquidation_service::{
    create_router, run_heartbeat, AppState, BroadcastBus, RefreshConfig, RefreshService,
    RegistryConfig, SseRegistry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting liquidation service");

    // Read configuration from environment
    let upstream_url =
        env::var("UPSTREAM_API_URL").unwrap_or_else(|_| "https://api.hypurrscan.io".to_string());
    let upstream_api_key = env::var("UPSTREAM_API_KEY").ok();
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let http_port: u16 = env_parse("HTTP_PORT", 8080);
    let metrics_port: u16 = env_parse("METRICS_PORT", 9090);
    let refresh_interval_secs: u64 = env_parse("REFRESH_INTERVAL_SECS", 60);
    let recent_ttl_secs: u64 = env_parse("RECENT_CACHE_TTL_SECS", 60);
    let max_connections: usize = env_parse("SSE_MAX_CONNECTIONS", 1000);
    let max_per_ip: usize = env_parse("SSE_MAX_PER_IP", 3);
    let heartbeat_interval_secs: u64 = env_parse("HEARTBEAT_INTERVAL_SECS", 30);

    info!("Configuration:");
    info!("  UPSTREAM_API_URL: {}", upstream_url);
    info!("  REDIS_URL: {}", redis_url);
    info!("  HTTP_PORT: {}", http_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  REFRESH_INTERVAL_SECS: {}", refresh_interval_secs);
    info!("  SSE_MAX_CONNECTIONS: {}", max_connections);
    info!("  SSE_MAX_PER_IP: {}", max_per_ip);
    info!("  HEARTBEAT_INTERVAL_SECS: {}", heartbeat_interval_secs);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!("Prometheus metrics available on port {}", metrics_port);

    // Connect to Redis
    info!("Connecting to Redis at {}...", redis_url);
    let cache = CacheClient::new(&redis_url)?;

    // Create the upstream client
    let client = Arc::new(LiquidationsClient::new(ClientConfig {
        base_url: upstream_url,
        api_key: upstream_api_key,
        ..Default::default()
    })?);

    // Create the session registry
    let registry = Arc::new(SseRegistry::new(RegistryConfig {
        max_connections,
        max_per_ip,
        heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
        ..Default::default()
    }));

    // Spawn the refresh loop
    let refresh_interval = Duration::from_secs(refresh_interval_secs);
    let refresh = Arc::new(RefreshService::new(
        client.clone(),
        cache.clone(),
        RefreshConfig {
            interval: refresh_interval,
            derived_ttl: refresh_interval.max(Duration::from_secs(180)),
            ..Default::default()
        },
    ));
    let (refresh_shutdown_tx, refresh_shutdown_rx) = mpsc::channel(1);
    let refresh_handle = tokio::spawn(refresh.clone().run(refresh_shutdown_rx));

    // Spawn the broadcast bus
    let bus = BroadcastBus::new(cache.clone(), registry.clone());
    let (bus_shutdown_tx, bus_shutdown_rx) = mpsc::channel(1);
    let bus_handle = tokio::spawn(bus.run(bus_shutdown_rx));

    // Spawn the heartbeat timer
    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = mpsc::channel(1);
    let heartbeat_handle = tokio::spawn(run_heartbeat(registry.clone(), heartbeat_shutdown_rx));

    // Create HTTP server
    let app = create_router(AppState {
        cache,
        client,
        registry: registry.clone(),
        recent_ttl: Duration::from_secs(recent_ttl_secs),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP API listening on {}", addr);

    // On shutdown: stop the timers and the bus, then close all sessions.
    // Closing sessions ends the open SSE bodies, letting the graceful
    // shutdown drain.
    let shutdown = {
        let registry = registry.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down background tasks...");
            let _ = refresh_shutdown_tx.send(()).await;
            let _ = bus_shutdown_tx.send(()).await;
            let _ = heartbeat_shutdown_tx.send(()).await;
            registry.shutdown();
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    let _ = refresh_handle.await;
    let _ = bus_handle.await;
    let _ = heartbeat_handle.await;

    info!("Liquidation service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
