// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - Daemon
// Owns the VPN session and exposes it over a local control socket

mod api;
mod cleanup;
mod config;
mod connection;
mod firewall;
mod helper;
mod manager;
mod permissions;
mod pidfile;
mod policy;
mod probe;
mod prober;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vpn_engine_common::{EngineEvent, SettingsStore};

use api::{create_router, AppState};
use config::DaemonConfig;
use helper::linux::CommandHelperConfig;
use helper::CommandHelper;
use manager::{ConnectionManager, EngineDeps};
use probe::HttpProbeService;

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpn_engine_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("VPN Engine Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = DaemonConfig::load()?;

    permissions::ensure_directory_with_permissions(&config::runtime_dir(), daemon_config.group_access)?;
    let _pid_guard = pidfile::PidFileGuard::create(&config::pid_file_path())
        .context("Failed to create PID file - another daemon may already be running")?;

    permissions::ensure_directory_with_permissions(&daemon_config.data_dir, false)?;
    info!("Data directory: {}", daemon_config.data_dir.display());

    let settings = SettingsStore::open(&daemon_config.settings_path).with_context(|| {
        format!(
            "Failed to open settings {}",
            daemon_config.settings_path.display()
        )
    })?;

    let helper = Arc::new(CommandHelper::new(CommandHelperConfig {
        wg_interface: daemon_config.wireguard.interface.clone(),
        data_dir: daemon_config.data_dir.clone(),
        stunnel_executable: daemon_config.stunnel_executable.clone(),
        wstunnel_executable: daemon_config.wstunnel_executable.clone(),
        hosts_file: PathBuf::from("/etc/hosts"),
    }));
    let probe = Arc::new(HttpProbeService::new(daemon_config.probe_url.clone())?);

    let manager = ConnectionManager::new(EngineDeps {
        helper,
        probe,
        settings,
        config: daemon_config.clone(),
    });

    // Log engine events
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                EngineEvent::Statistics { .. } => debug!("Engine event: {:?}", event),
                _ => info!("Engine event: {:?}", event),
            }
        }
    });

    // Closes SSE streams on shutdown
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state);

    serve_unix_socket(app, &daemon_config, manager, shutdown_tx).await?;

    info!("Daemon shut down");
    Ok(())
}

/// Serve the control API on the Unix domain socket
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    manager: ConnectionManager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path();

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(manager).await;
        let _ = shutdown_broadcast.send(());
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // `vpnctl watch` interrupted with Ctrl+C
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then tear the session down
async fn wait_for_shutdown(manager: ConnectionManager) {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    };

    manager.shutdown().await;
    info!("Session stopped");
}
