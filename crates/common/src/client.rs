// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - Daemon Client Module
// Control API client shared by the CLI and other front ends

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ConnectRequest;
use crate::sse::parse_sse_line;
use crate::types::{EngineEvent, EngineStatus};

const APP_DIR: &str = "vpn-engine";
const SOCKET_NAME: &str = "vpn-engine.sock";

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP on loopback (testing only)
    Http,
}

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Socket path override for UnixSocket mode
    #[serde(default)]
    pub socket_path: String,

    /// Daemon address for Http mode
    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,
}

fn default_daemon_addr() -> String {
    "127.0.0.1:3480".to_string()
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            socket_path: String::new(),
            daemon_addr: default_daemon_addr(),
        }
    }
}

impl DaemonClientConfig {
    pub fn daemon_base_url(&self) -> String {
        match self.connection_mode {
            // reqwest needs a host even when talking over a socket
            ConnectionMode::UnixSocket => "http://daemon".to_string(),
            ConnectionMode::Http => format!("http://{}", self.daemon_addr),
        }
    }

    /// Resolve the Unix socket path
    ///
    /// Order: explicit override, user runtime directory, system-wide
    /// `/run/vpn-engine/vpn-engine.sock`.
    pub fn resolve_socket_path(&self) -> Result<PathBuf> {
        let candidate = self.socket_path.trim();
        if !candidate.is_empty() {
            return Ok(PathBuf::from(candidate));
        }

        if let Some(runtime_dir) = dirs::runtime_dir() {
            let user_socket = user_socket_path(&runtime_dir);
            if user_socket.exists() {
                return Ok(user_socket);
            }
        }

        let system_socket = PathBuf::from("/run").join(APP_DIR).join(SOCKET_NAME);
        if system_socket.exists() {
            return Ok(system_socket);
        }

        dirs::runtime_dir()
            .map(|runtime_dir| user_socket_path(&runtime_dir))
            .ok_or_else(|| {
                anyhow::anyhow!("Could not determine runtime directory and no system socket found")
            })
    }
}

fn user_socket_path(runtime_dir: &std::path::Path) -> PathBuf {
    if runtime_dir.file_name() == Some(OsStr::new(APP_DIR)) {
        runtime_dir.join(SOCKET_NAME)
    } else {
        runtime_dir.join(APP_DIR).join(SOCKET_NAME)
    }
}

/// Create an HTTP client configured to reach the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder().timeout(Duration::from_secs(30));

    if config.connection_mode == ConnectionMode::UnixSocket {
        let socket_path = config.resolve_socket_path()?;
        client_builder = client_builder.unix_socket(socket_path);
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Client for the streaming events endpoint (no overall request timeout)
pub fn create_event_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder().connect_timeout(Duration::from_secs(5));

    if config.connection_mode == ConnectionMode::UnixSocket {
        let socket_path = config.resolve_socket_path()?;
        client_builder = client_builder.unix_socket(socket_path);
    }

    client_builder
        .build()
        .context("Failed to build daemon event client")
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

async fn error_from_response(resp: reqwest::Response, what: &str) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    anyhow::anyhow!("{} failed: {} - {}", what, status, message)
}

/// Fetch the engine status
pub async fn fetch_status(client: &Client, config: &DaemonClientConfig) -> Result<EngineStatus> {
    let url = format!("{}/api/status", config.daemon_base_url());
    let resp = client
        .get(&url)
        .send()
        .await
        .context("Failed to reach daemon. Is the daemon running?")?;

    if !resp.status().is_success() {
        return Err(error_from_response(resp, "Status request").await);
    }

    resp.json().await.context("Failed to parse engine status")
}

/// Ask the daemon to tear the current session down
pub async fn disconnect(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    post_empty(client, config, "/api/disconnect", "Disconnect").await
}

/// Kill leftover tunnel processes and restore DNS/firewall state
pub async fn cleanup(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    post_empty(client, config, "/api/cleanup", "Cleanup").await
}

async fn post_empty(
    client: &Client,
    config: &DaemonClientConfig,
    path: &str,
    what: &str,
) -> Result<()> {
    let url = format!("{}{}", config.daemon_base_url(), path);
    let resp = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to send {} request to daemon", what.to_lowercase()))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(resp, what).await)
    }
}

/// Start a session without waiting for the outcome
pub async fn connect(
    client: &Client,
    config: &DaemonClientConfig,
    request: &ConnectRequest,
) -> Result<()> {
    let url = format!("{}/api/connect", config.daemon_base_url());
    let resp = client
        .post(&url)
        .json(request)
        .send()
        .await
        .context("Failed to send connect request to daemon. Is the daemon running?")?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(resp, "Connect").await)
    }
}

/// Callback for progress of a connect call
pub trait EngineEventHandler: Send {
    fn on_event(&mut self, _event: &EngineEvent) {}
}

/// Connect and follow the event stream until the tunnel is up or the
/// session ends
///
/// Subscribes to events before sending the request so nothing fired right
/// after the request is missed.
pub async fn connect_with_events<H: EngineEventHandler>(
    client: &Client,
    config: &DaemonClientConfig,
    request: &ConnectRequest,
    handler: &mut H,
    overall_timeout: Duration,
) -> Result<()> {
    let event_client = create_event_client(config)?;
    let url = format!("{}/api/events", config.daemon_base_url());
    let resp = event_client
        .get(&url)
        .send()
        .await
        .context("Failed to subscribe to daemon events")?;

    if !resp.status().is_success() {
        anyhow::bail!("Daemon returned non-success status for events: {}", resp.status());
    }

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = event_tx.send(Err(anyhow::anyhow!(e)));
                    break;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end().to_string();
                buffer.drain(..=pos);

                match parse_sse_line(&line) {
                    Some(Ok(event)) => {
                        if event_tx.send(Ok(event)).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = event_tx.send(Err(e));
                    }
                    None => {}
                }
            }
        }
    });

    connect(client, config, request).await?;

    let overall_timer = tokio::time::sleep(overall_timeout);
    tokio::pin!(overall_timer);

    loop {
        tokio::select! {
            _ = &mut overall_timer => {
                anyhow::bail!("Timed out waiting for the tunnel to connect");
            }
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        handler.on_event(&event);
                        match event {
                            EngineEvent::Connected { .. } => return Ok(()),
                            EngineEvent::Error { error, .. } => anyhow::bail!("Connection failed: {error}"),
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Event stream error: {e}");
                    }
                    None => {
                        // Stream ended; reconcile once
                        let status = fetch_status(client, config).await?;
                        if status.state.is_connected() {
                            return Ok(());
                        }
                        anyhow::bail!("Event stream closed and tunnel is {}", status.state);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonClientConfig::default();
        assert_eq!(config.connection_mode, ConnectionMode::UnixSocket);
        assert_eq!(config.daemon_base_url(), "http://daemon");
    }

    #[test]
    fn test_http_base_url() {
        let config = DaemonClientConfig {
            connection_mode: ConnectionMode::Http,
            daemon_addr: "127.0.0.1:9000".to_string(),
            ..Default::default()
        };
        assert_eq!(config.daemon_base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_socket_override() {
        let config = DaemonClientConfig {
            socket_path: "/tmp/engine.sock".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_socket_path().unwrap(),
            PathBuf::from("/tmp/engine.sock")
        );
    }

    #[test]
    fn test_user_socket_path_layout() {
        assert_eq!(
            user_socket_path(std::path::Path::new("/run/user/1000")),
            PathBuf::from("/run/user/1000/vpn-engine/vpn-engine.sock")
        );
        assert_eq!(
            user_socket_path(std::path::Path::new("/run/user/1000/vpn-engine")),
            PathBuf::from("/run/user/1000/vpn-engine/vpn-engine.sock")
        );
    }
}
