//! Graceful shutdown: listens for SIGINT/SIGTERM and flips a
//! `tokio::sync::watch` channel that the accept loop and health loops both
//! select on (spec.md §5 "shutdown cancels all health loops and drains
//! in-flight requests", §6 exit codes).

use tokio::sync::watch;
use tracing::info;

/// Spawns the signal-listening task and returns the receiver side of the
/// shutdown channel. Every loop that needs to stop on shutdown clones this.
pub fn listen() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Waits out a drain grace period after the accept loop has stopped,
/// letting in-flight requests (already bounded by the per-request timeout)
/// finish before the process exits.
pub async fn drain(grace_period: std::time::Duration) {
    tokio::time::sleep(grace_period).await;
}
