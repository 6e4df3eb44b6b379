//! Signal handling.

use tracing::{info, warn};

/// Resolve on SIGTERM or SIGINT.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).ok()
    };

    let terminate = async {
        #[cfg(unix)]
        {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("SIGINT handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
        _ = interrupt => info!("Received SIGINT, starting graceful shutdown"),
    }
}
