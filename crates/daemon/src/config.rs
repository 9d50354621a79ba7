// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - Daemon Config Module
// Paths, tunnel test overrides and protocol executables

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

const APP_DIR: &str = "vpn-engine";

/// Upper bound for configured probe attempts
pub const MAX_TUNNEL_TEST_ATTEMPTS: u32 = 10;

/// Get the runtime directory for daemon state
///
/// Root daemons without a user runtime directory use `/run/vpn-engine`.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/run").join(APP_DIR))
}

/// Get the socket path for the daemon
pub fn socket_path() -> PathBuf {
    runtime_dir().join("vpn-engine.sock")
}

/// Get the PID file path
pub fn pid_file_path() -> PathBuf {
    runtime_dir().join("daemon.pid")
}

/// Tunnel test overrides; unset fields keep the built-in schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelTestConfig {
    /// Delay before the first probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_delay_ms: Option<u64>,

    /// Number of probes (0 skips the test)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Fixed timeout per probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Delay between failed probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

impl TunnelTestConfig {
    /// Any of attempts/timeout/retry delay set
    pub fn is_overridden(&self) -> bool {
        self.attempts.is_some() || self.timeout_ms.is_some() || self.retry_delay_ms.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WireGuardConfig {
    /// Give up on a connecting tunnel after this long in automatic mode
    #[serde(default = "default_automatic_timeout_secs")]
    pub automatic_timeout_secs: u64,

    /// Interface / service name
    #[serde(default = "default_wg_interface")]
    pub interface: String,
}

fn default_automatic_timeout_secs() -> u64 {
    20
}

fn default_wg_interface() -> String {
    "wg-vpnengine".to_string()
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            automatic_timeout_secs: default_automatic_timeout_secs(),
            interface: default_wg_interface(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OpenVpnConfig {
    #[serde(default = "default_openvpn_executable")]
    pub executable: String,

    /// Base `.ovpn` file; `remote`, `proto` and proxy lines are appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_template: Option<PathBuf>,

    /// Fixed management port; a free loopback port is picked when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_port: Option<u16>,
}

fn default_openvpn_executable() -> String {
    "openvpn".to_string()
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            executable: default_openvpn_executable(),
            config_template: None,
            management_port: None,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Enable group access to Unix socket and runtime directory
    /// When true, sets permissions to 0770/0660 instead of 0700/0600
    #[serde(default)]
    pub group_access: bool,

    /// Generated tunnel configs and the WireGuard log live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Durable settings (last successful protocol)
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// URL answering with the caller's public IP as plain text
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    #[serde(default)]
    pub tunnel_test: TunnelTestConfig,

    #[serde(default)]
    pub wireguard: WireGuardConfig,

    #[serde(default)]
    pub openvpn: OpenVpnConfig,

    #[serde(default = "default_stunnel_executable")]
    pub stunnel_executable: String,

    #[serde(default = "default_wstunnel_executable")]
    pub wstunnel_executable: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(APP_DIR)
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.toml")
}

fn default_probe_url() -> String {
    "https://checkip.amazonaws.com/".to_string()
}

fn default_stunnel_executable() -> String {
    "stunnel".to_string()
}

fn default_wstunnel_executable() -> String {
    "wstunnel".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            group_access: false,
            data_dir: default_data_dir(),
            settings_path: default_settings_path(),
            probe_url: default_probe_url(),
            tunnel_test: TunnelTestConfig::default(),
            wireguard: WireGuardConfig::default(),
            openvpn: OpenVpnConfig::default(),
            stunnel_executable: default_stunnel_executable(),
            wstunnel_executable: default_wstunnel_executable(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.probe_url.trim().is_empty() {
            anyhow::bail!("probe_url cannot be empty");
        }

        if self.wireguard.automatic_timeout_secs == 0 {
            anyhow::bail!("wireguard.automatic_timeout_secs must be greater than 0");
        }

        if self.wireguard.interface.is_empty() {
            anyhow::bail!("wireguard.interface cannot be empty");
        }

        if let Some(attempts) = self.tunnel_test.attempts {
            if attempts > MAX_TUNNEL_TEST_ATTEMPTS {
                anyhow::bail!(
                    "tunnel_test.attempts is {} but at most {} are allowed",
                    attempts,
                    MAX_TUNNEL_TEST_ATTEMPTS
                );
            }
        }

        if self.tunnel_test.timeout_ms == Some(0) {
            anyhow::bail!("tunnel_test.timeout_ms must be greater than 0");
        }

        Ok(())
    }

    /// Load daemon configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration, writing defaults if the file does not exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to a file with 0600 permissions
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("daemon.toml"))
    }
}
