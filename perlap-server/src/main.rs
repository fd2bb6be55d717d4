//! PerLap Server
//!
//! Race control server with REST and SSE API

use anyhow::{Context, Result};
use perlap_server::manager::{camera_sources, Command, Manager, ManagerOptions};
use perlap_server::store::{DataDirs, RaceArchive};
use perlap_server::{api, state};
use std::future::IntoFuture;
use std::net::SocketAddr;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

const ADDR_ENV: &str = "PERLAP_ADDR";
/// Set to 1 to time synthetic footage instead of the camera
const DEMO_ENV: &str = "PERLAP_DEMO";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting PerLap Server");

    let dirs = DataDirs::resolve()?;
    info!(
        "Config in {}, data in {}",
        dirs.config_dir.display(),
        dirs.data_dir.display()
    );

    // Create application state
    let (frames_tx, frames_rx) = watch::channel(None);
    let (state, commands) = state::AppState::new(frames_rx, RaceArchive::new(dirs.races_dir()));

    let demo = std::env::var(DEMO_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if demo {
        info!("Demo footage enabled, the camera is not used");
    }

    // Start the race manager in background
    let options = ManagerOptions {
        frame_sources: camera_sources(demo),
        ..ManagerOptions::default()
    };
    let manager = Manager::new(&dirs, state.notifications.clone(), frames_tx, options);
    let manager_task = tokio::spawn(manager.run(commands));

    // Build the router
    let app = api::create_router(state.clone());

    // Start server
    let addr: SocketAddr = match std::env::var(ADDR_ENV) {
        Ok(addr) => addr
            .parse()
            .with_context(|| format!("invalid {} {:?}", ADDR_ENV, addr))?,
        Err(_) => SocketAddr::from(([0, 0, 0, 0], 9200)),
    };
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    // Open SSE streams never finish, so stop serving on ctrl-c instead of
    // waiting for connections to drain
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        },
    }

    // Close any running race and stop the workers
    let (done, stopped) = oneshot::channel();
    if state.commands.send(Command::Shutdown(done)).await.is_ok() {
        let _ = stopped.await;
    }
    manager_task.await.context("race manager panicked")?;

    Ok(())
}
