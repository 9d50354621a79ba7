// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Privileged helper contract
//!
//! Every operation that needs elevated rights (services, processes, DNS,
//! firewall) goes through this trait. The engine never touches the OS
//! directly, so the protocol state machines can be driven by a fake in tests.

pub mod linux;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use linux::CommandHelper;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("{0} failed executable verification")]
    VerifyFailed(String),

    #[error("Helper command failed: {0}")]
    Execute(String),

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HelperResult<T> = std::result::Result<T, HelperError>;

/// State of the WireGuard tunnel service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireGuardServiceState {
    Inactive,
    Starting,
    Active,
    Error,
}

/// Snapshot of the WireGuard tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardStatus {
    pub state: WireGuardServiceState,
    /// None until the first handshake completes
    pub last_handshake: Option<DateTime<Utc>>,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
}

impl WireGuardStatus {
    pub fn inactive() -> Self {
        Self {
            state: WireGuardServiceState::Inactive,
            last_handshake: None,
            bytes_received: 0,
            bytes_transmitted: 0,
        }
    }
}

/// Local TLS/websocket wrapper in front of OpenVPN TCP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelWrapperKind {
    Stunnel,
    Wstunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelWrapperParams {
    pub kind: TunnelWrapperKind,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ikev2Params {
    pub server_ip: String,
    pub remote_id: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Ikev2Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ikev2Params")
            .field("server_ip", &self.server_ip)
            .field("remote_id", &self.remote_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ikev2Status {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

#[async_trait]
pub trait PrivilegedHelper: Send + Sync {
    // WireGuard
    /// Verify the WireGuard tooling and register the tunnel config
    async fn install_wireguard(&self, config_path: &Path) -> HelperResult<()>;
    async fn start_wireguard_service(&self) -> HelperResult<()>;
    async fn is_wireguard_service_running(&self) -> bool;
    async fn wireguard_status(&self) -> HelperResult<WireGuardStatus>;
    /// Stop the service and unregister the tunnel; safe when not running
    async fn stop_wireguard(&self) -> HelperResult<()>;

    // OpenVPN family
    async fn start_openvpn(
        &self,
        executable: &str,
        config_path: &Path,
        management_port: u16,
    ) -> HelperResult<()>;
    async fn start_tunnel_wrapper(&self, params: &TunnelWrapperParams) -> HelperResult<()>;

    // IKEv2
    async fn start_ikev2(&self, params: &Ikev2Params) -> HelperResult<()>;
    async fn ikev2_status(&self) -> HelperResult<Ikev2Status>;
    async fn stop_ikev2(&self) -> HelperResult<()>;

    // DNS and processes
    async fn enable_dns_leak_protection(&self) -> HelperResult<()>;
    async fn disable_dns_leak_protection(&self) -> HelperResult<()>;
    async fn remove_hosts(&self) -> HelperResult<()>;
    /// Kill every process with this executable name; no-op when none runs
    async fn kill_process(&self, name: &str) -> HelperResult<()>;

    // Firewall
    async fn firewall_on(&self, ips: &[String], allow_lan: bool) -> HelperResult<()>;
    /// Remove the engine's rules; with `restore_prior` a firewall that was
    /// already on before the engine touched it stays on
    async fn firewall_off(&self, restore_prior: bool) -> HelperResult<()>;
    async fn firewall_actual_state(&self) -> bool;
    async fn set_prior_firewall_state(&self, enabled: bool) -> HelperResult<()>;
    async fn prior_firewall_state(&self) -> Option<bool>;
}
