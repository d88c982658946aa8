//! Shutdown triggers.
//!
//! A supervisor is shut down by an OS signal; the worker it supervises is
//! shut down by its stdin pipe closing.

use suiteq_config::ShutdownSignal;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn signal_kind(signal: ShutdownSignal) -> SignalKind {
    match signal {
        ShutdownSignal::Term => SignalKind::terminate(),
        ShutdownSignal::Int => SignalKind::interrupt(),
        ShutdownSignal::Hup => SignalKind::hangup(),
        ShutdownSignal::Quit => SignalKind::quit(),
    }
}

/// Install a handler that cancels the returned token on the configured
/// signal or SIGINT.
pub fn install_shutdown_handler(configured: ShutdownSignal) -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut configured_stream = signal(signal_kind(configured))?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = configured_stream.recv() => {
                info!(signal = ?configured, "Received shutdown signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}

/// Cancel `token` once stdin reaches EOF or fails. The supervisor closes
/// our stdin to ask for a graceful stop.
pub fn cancel_on_stdin_close(token: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        info!("Supervisor pipe closed, shutting down after the current job");
        token.cancel();
    });
}
