//! Token agent
//!
//! Long-running sidecar that:
//! 1. Obtains a bearer token from a credential helper command
//! 2. Mirrors it into one or more token files
//! 3. Refreshes it ahead of expiry, retrying with backoff on failure
//!
//! Exits non-zero when refreshing can no longer keep up with expiry, so a
//! supervisor can re-authenticate and restart it.

mod command;
mod config;
mod error;
mod sink;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusBuilder;
use token_lifecycle::{Clock, CredentialManager, ManagerEvent, TokioClock};

use crate::command::CommandFetcher;
use crate::config::Config;
use crate::sink::FileSink;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-agent");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        command = %config.fetcher.command,
        timeout_secs = config.fetcher.timeout_secs,
        sinks = config.sinks.len(),
        margin_ms = config.refresh.margin.as_millis() as u64,
        "configuration loaded"
    );

    if let Some(metrics) = &config.metrics {
        PrometheusBuilder::new()
            .with_http_listener(metrics.listen_addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(listen_addr = %metrics.listen_addr, "metrics exporter listening");
    }

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let fetcher = Arc::new(CommandFetcher::from_config(&config.fetcher, Arc::clone(&clock)));
    let manager = CredentialManager::new(clock, fetcher, config.refresh.clone())
        .context("failed to build credential manager")?;

    // Sinks must outlive the manager's bindings, which only hold weak refs.
    let sinks: Vec<Arc<FileSink>> = config
        .sinks
        .iter()
        .map(|s| Arc::new(FileSink::new(&s.path)))
        .collect();
    for sink in &sinks {
        let id = manager.bind(sink);
        debug!(binding = %id, path = %sink.path().display(), "sink bound");
    }

    let mut events = manager.subscribe_events();
    manager
        .start(None)
        .context("failed to start refresh cycle")?;

    let outcome = tokio::select! {
        result = watch_events(&mut events) => result,
        () = shutdown_signal() => Ok(()),
    };

    manager.stop().await;
    info!(phase = manager.phase().label(), "shutdown complete");
    outcome
}

/// Log manager events until one of them is fatal.
async fn watch_events(events: &mut broadcast::Receiver<ManagerEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(ManagerEvent::Refreshed {
                reason,
                attempt,
                expires_at,
            }) => {
                info!(reason = reason.label(), attempt, expires_at, "token refreshed");
            }
            Ok(ManagerEvent::ExpiryImminent { error }) => {
                error!(error = %error, "token about to expire and cannot be refreshed");
                anyhow::bail!("credential expiry imminent: {error}");
            }
            Ok(ManagerEvent::Stopped) => anyhow::bail!("credential manager stopped unexpectedly"),
            Ok(event) => debug!(event = event.label(), "manager event"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged, events dropped");
            }
            Err(RecvError::Closed) => anyhow::bail!("manager event channel closed"),
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
