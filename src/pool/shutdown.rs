use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Pool;

/// Close the pool on Ctrl+C or SIGTERM
///
/// The relay task ends quietly if the pool is closed some other way.
pub fn close_on_signal(pool: &Pool) -> JoinHandle<()> {
    let pool = pool.clone();
    let done = pool.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                pool.close().await;
            }
            _ = done.cancelled() => {}
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
