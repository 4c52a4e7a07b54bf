//! The `bespoke-coordinator` binary: loads configuration from the
//! environment, brings the Supervisor up, and waits for a shutdown signal
//! (Ctrl+C or SIGTERM).

use std::time::Duration;

use bespoke_orchestration::Supervisor;
use bespoke_shared::config::ExecutorConfig;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bespoke-coordinator");

    let config = ExecutorConfig::from_env();
    let mut supervisor = Supervisor::bootstrap(config.clone())
        .await
        .map_err(|e| format!("failed to bootstrap supervisor: {e}"))?;

    info!(bind = %config.bind_address, "bespoke-coordinator started");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");

    match tokio::time::timeout(config.shutdown_grace + Duration::from_secs(5), supervisor.stop()).await {
        Ok(Ok(())) => info!("supervisor stopped cleanly"),
        Ok(Err(e)) => error!(error = %e, "supervisor reported an error while stopping"),
        Err(_) => error!("supervisor shutdown exceeded its grace period, exiting anyway"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
