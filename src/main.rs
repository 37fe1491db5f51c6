#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use streamhub::media::MediaConfig;
use streamhub::metrics::ServerMetrics;
use streamhub::room::RoomManager;
use streamhub::signaling::SignalingServer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for room teardown after SIGINT.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamhub=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("streamhub - starting server");

    let metrics = ServerMetrics::new();
    let media_config = Arc::new(MediaConfig::from_env());
    let room_manager = Arc::new(RoomManager::new(metrics.clone()));
    let server = SignalingServer::new(room_manager.clone(), media_config, metrics);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                error!(error = %e, "signaling server error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            if tokio::time::timeout(SHUTDOWN_GRACE, room_manager.close_all_rooms())
                .await
                .is_err()
            {
                error!("room teardown exceeded grace period, forcing shutdown");
                std::process::exit(1);
            }
        }
    }

    info!("server exited gracefully");
    Ok(())
}
