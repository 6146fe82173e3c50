use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The scanner finishes its current pass and stops; in-flight worker calls
/// are left to their own timeouts.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "Shutting down"),
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "Shutting down"),
        }
        cancel.cancel();
    });

    Ok(token)
}
