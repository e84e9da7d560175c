//! syncd - peer-to-peer device sync daemon
//!
//! This daemon holds one device's append-only event log, discovers other
//! devices belonging to the same user on the LAN, and reconciles G-Sets
//! with them over an authenticated, end-to-end encrypted sync protocol.

use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use syncd::config::Config;
use syncd::server::{run_background_sync_loop, run_http_server, Coordinator};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let default_level = if config.verbose { "syncd=debug" } else { "syncd=info" };
    let filter = EnvFilter::from_default_env().add_directive(default_level.parse().unwrap());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("syncd v{} - device sync daemon", env!("CARGO_PKG_VERSION"));

    let coordinator = match Coordinator::new(config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to initialize coordinator: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(user_id = %coordinator.user_id(), device_id = %coordinator.device_id, "identity loaded");

    let discovery_socket = match sync_net::discovery::bind_discovery_socket(coordinator.config.discovery_port) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to bind discovery socket: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let broadcast_socket = match discovery_socket.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to clone discovery socket: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler: flips the shared running flag, which every
    // background loop (HTTP server, broadcast, listen, sync sweep) observes
    // at its next suspension point.
    let shutdown_coordinator = coordinator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_coordinator.shutdown();
    });

    let broadcast_device_id = coordinator.device_id.clone();
    let broadcast_device_name = coordinator.config.device_name();
    let broadcast_running = coordinator.running.clone();
    let broadcast_identity_user_id = coordinator.user_id();
    let broadcast_coordinator = coordinator.clone();
    let broadcast_discovery_port = coordinator.config.discovery_port;
    let broadcast_interval = coordinator.config.broadcast_interval();
    let broadcast_handle = tokio::task::spawn_blocking(move || {
        // The HTTP listener binds lazily inside run_http_server; wait for it
        // to publish its port before the first beacon goes out.
        let mut port = broadcast_coordinator.http_port();
        while port == 0 && broadcast_running.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(20));
            port = broadcast_coordinator.http_port();
        }
        info!(user_id = %broadcast_identity_user_id, "starting discovery broadcast loop");
        sync_net::discovery::run_broadcast_loop(
            &broadcast_socket,
            &broadcast_coordinator.identity,
            &broadcast_device_id,
            &broadcast_device_name,
            port,
            broadcast_discovery_port,
            broadcast_interval,
            broadcast_running,
        );
    });

    let listen_directory = coordinator.peer_directory.clone();
    let listen_user_id = coordinator.user_id();
    let listen_device_id = coordinator.device_id.clone();
    let listen_running = coordinator.running.clone();
    let listen_peer_timeout_ms = coordinator.config.peer_timeout().as_millis() as u64;
    let listen_handle = tokio::task::spawn_blocking(move || {
        info!("starting discovery listen loop");
        sync_net::discovery::run_listen_loop(
            &discovery_socket,
            &listen_user_id,
            &listen_device_id,
            &listen_directory,
            listen_peer_timeout_ms,
            listen_running,
        );
    });

    let background_sync = tokio::spawn(run_background_sync_loop(coordinator.clone()));

    let http_coordinator = coordinator.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = run_http_server(http_coordinator.clone()).await {
            error!("sync HTTP server error: {}", e);
            http_coordinator.shutdown();
        }
    });

    // Drive the command surface until `quit`/EOF; this is what normally
    // triggers shutdown in an interactive run.
    syncd::repl::run(coordinator.clone()).await;

    let _ = http_handle.await;
    let _ = background_sync.await;
    let _ = broadcast_handle.await;
    let _ = listen_handle.await;

    info!("syncd shut down cleanly");
    ExitCode::SUCCESS
}
