use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install a shutdown handler that listens for Ctrl-C and, on Unix, SIGTERM.
///
/// Returns a `CancellationToken` cancelled when either signal arrives.
/// Workers stop claiming and finish their current job.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
                Err(e) => {
                    warn!(error = %e, "Failed to listen for Ctrl-C; signal shutdown disabled");
                    return;
                }
            },
            _ = terminate() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        token_clone.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
