//! Drover consumer host.
//!
//! Loads the YAML configuration, starts one supervisor with every configured
//! consumer group, and runs until SIGINT/SIGTERM. Shutdown is graceful with
//! a bounded overall timeout; workers that miss the deadline are stopped
//! immediately and their in-flight deliveries requeued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drover_common::StatsSink;
use drover_config::Settings;
use drover_consumer::{ConsumerRegistry, LapinBroker};
use drover_supervisor::{LogStatsSink, MetricsSink, Supervisor, SupervisorOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Drover");

    let config_path =
        std::env::var("DROVER_CONFIG").unwrap_or_else(|_| "drover.yaml".to_string());
    let settings = Settings::load(&config_path)?;
    info!(
        path = %config_path,
        connections = settings.connections.len(),
        consumers = settings.consumers.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(ConsumerRegistry::with_builtins());
    info!(handlers = ?registry.names(), "Consumer registry ready");
    let stats: Arc<dyn StatsSink> = match std::env::var("DROVER_STATS").as_deref() {
        Ok("log") => Arc::new(LogStatsSink),
        _ => Arc::new(MetricsSink),
    };

    let supervisor = Supervisor::new(
        settings.connections.clone(),
        registry,
        Arc::new(LapinBroker::new()),
        stats,
        SupervisorOptions::default(),
    );
    supervisor.start_groups(settings.consumers.iter().cloned());
    let reporter = supervisor.spawn_stats_reporter();

    info!("Drover started. Press Ctrl+C to shut down.");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let shutdown_timeout = std::env::var("DROVER_SHUTDOWN_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let graceful = tokio::time::timeout(
        Duration::from_secs(shutdown_timeout),
        supervisor.shutdown(true),
    )
    .await;
    if graceful.is_err() {
        warn!(
            timeout_secs = shutdown_timeout,
            "Graceful shutdown timed out, stopping immediately"
        );
        supervisor.shutdown(false).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), reporter).await;

    info!("Drover shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
