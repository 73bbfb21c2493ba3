//! Pinch relay daemon.
//!
//! Wires the subsystems together: opens the database, starts the hub
//! event loop and the retention sweeps, serves the HTTP/WebSocket
//! surface, and shuts everything down cleanly on SIGINT/SIGTERM.
//!
//! Exit codes: 0 on clean shutdown, 1 on unrecoverable startup error
//! (port bind, database open, bad configuration).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pinch_relay::{build_router, Hub};
use pinch_store::{KeyRegistry, MessageQueue};
use pinch_types::config::RelayConfig;
use pinch_types::{PinchError, Result};

/// Interval between queue retention sweeps.
const QUEUE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Arc::new(RelayConfig::from_env()?);

    let db = pinch_store::open_db(std::path::Path::new(&config.db_path))?;
    let registry = Arc::new(KeyRegistry::new(&db)?);
    let queue = Arc::new(MessageQueue::new(
        &db,
        config.max_queue_per_recipient,
        Duration::from_secs(config.message_retention_secs),
    )?);

    // Clear enrollments left unclaimed since previous runs.
    registry.sweep_pending(Duration::from_secs(config.pending_ttl_secs))?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let hub = Hub::new(queue.clone(), registry);
    if let Some(host) = &config.relay_host {
        hub.set_relay_host(host.clone());
        tracing::info!(relay_host = %host, "recipient host check enabled");
    }
    tokio::spawn(hub.clone().run(cancel.child_token()));
    spawn_queue_sweep(queue, cancel.clone());

    let router = build_router(hub, config.clone());
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.map_err(|e| {
        PinchError::TransportError {
            reason: format!("failed to bind {bind_addr}: {e}"),
        }
    })?;
    tracing::info!(port = config.port, "relay starting");

    let shutdown = cancel.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        tracing::info!("shutting down relay");
    });

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    tokio::select! {
        result = serve => {
            result.map_err(|e| PinchError::TransportError {
                reason: format!("server error: {e}"),
            })?;
        }
        _ = expired_grace(cancel.clone(), grace) => {
            tracing::warn!("shutdown grace period expired, abandoning open connections");
        }
    }

    if let Err(e) = db.flush() {
        tracing::warn!(error = %e, "final database flush failed");
    }
    tracing::info!("relay stopped");
    Ok(())
}

/// Resolves `grace` after the shutdown signal fires, capping how long
/// connection draining may take.
async fn expired_grace(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Cancels the root token on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
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
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Periodically expires queued messages past the retention window.
fn spawn_queue_sweep(queue: Arc<MessageQueue>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(QUEUE_SWEEP_INTERVAL);
        // Skip the immediate first tick; the queue was just opened.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match queue.sweep() {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "expired queued messages"),
                        Err(e) => tracing::warn!(error = %e, "queue sweep failed"),
                    }
                }
            }
        }
    });
}
