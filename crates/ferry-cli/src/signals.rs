//! Process signal handling

use tokio_util::sync::CancellationToken;

/// Cancel `cancel` on Ctrl+C or SIGTERM
pub fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}

/// Call `on_reload` for every SIGHUP until `cancel` fires
#[cfg(unix)]
pub fn spawn_reload_listener<F>(cancel: CancellationToken, on_reload: F)
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("Failed to install SIGHUP handler: {}", e);
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    tracing::info!("Received SIGHUP, reconnecting");
                    on_reload();
                }
            }
        }
    });
}

/// SIGHUP does not exist here
#[cfg(not(unix))]
pub fn spawn_reload_listener<F>(_cancel: CancellationToken, _on_reload: F)
where
    F: Fn() + Send + 'static,
{
}
