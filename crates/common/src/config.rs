// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// Connect request structures shared by the daemon and its clients

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::location::LocationInfo;
use crate::types::{PortMap, Protocol};

/// Everything the engine needs to open a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub location: LocationInfo,
    pub port_map: PortMap,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<WireGuardKeys>,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub firewall: FirewallRequest,
}

/// Automatic fallback over the port map, or one user-chosen protocol/port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Automatic,
    Manual { protocol: Protocol, port: u16 },
}

impl ConnectionMode {
    pub fn is_automatic(&self) -> bool {
        matches!(self, ConnectionMode::Automatic)
    }
}

/// Client-side WireGuard keys
#[derive(Clone, Serialize, Deserialize)]
pub struct WireGuardKeys {
    pub private_key: String,
    /// Interface address in CIDR notation
    pub address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

impl std::fmt::Debug for WireGuardKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardKeys")
            .field("address", &self.address)
            .field("dns", &self.dns)
            .finish_non_exhaustive()
    }
}

/// HTTP proxy the tunnel must go through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ProxySettings {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.host.is_empty() && self.port != 0
    }
}

/// OpenVPN / IKEv2 account credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Kill-switch settings for a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_allow_lan")]
    pub allow_lan: bool,
}

fn default_allow_lan() -> bool {
    true
}

impl ConnectRequest {
    /// Load a request from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let request: ConnectRequest = toml::from_str(&content)?;
        request.validate()?;
        Ok(request)
    }

    /// Validate the request before handing it to the engine
    pub fn validate(&self) -> Result<()> {
        self.location.validate()?;
        self.port_map.validate()?;

        match &self.mode {
            ConnectionMode::Automatic => {
                if self.port_map.is_empty() {
                    return Err(Error::Config(
                        "Port map cannot be empty in automatic mode".to_string(),
                    ));
                }
            }
            ConnectionMode::Manual { protocol, port } => {
                if *port == 0 {
                    return Err(Error::Config("Port must be greater than 0".to_string()));
                }
                if *protocol == Protocol::WireGuard && self.wireguard.is_none() {
                    return Err(Error::Config(
                        "WireGuard keys required for WireGuard".to_string(),
                    ));
                }
            }
        }

        if self.proxy.enabled && !self.proxy.is_active() {
            return Err(Error::Config(
                "Proxy enabled but host or port missing".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Node;
    use crate::types::PortMapEntry;

    fn request() -> ConnectRequest {
        ConnectRequest {
            location: LocationInfo::new(
                "nl",
                "nl.example.net",
                vec![Node {
                    ips: vec!["198.51.100.1".to_string()],
                    hostname: "nl-1.example.net".to_string(),
                    wg_public_key: String::new(),
                    wg_ip: String::new(),
                }],
            ),
            port_map: PortMap::new(vec![PortMapEntry::new(Protocol::OpenVpnUdp, vec![443])]),
            mode: ConnectionMode::Automatic,
            wireguard: None,
            proxy: ProxySettings::default(),
            credentials: None,
            firewall: FirewallRequest::default(),
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut manual_wg = request();
        manual_wg.mode = ConnectionMode::Manual {
            protocol: Protocol::WireGuard,
            port: 51820,
        };
        assert!(manual_wg.validate().is_err());

        let mut bad_proxy = request();
        bad_proxy.proxy.enabled = true;
        assert!(bad_proxy.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let toml = r#"
[location]
id = "nl"
dns_name = "nl.example.net"

[[location.nodes]]
ips = ["198.51.100.1", "198.51.100.2"]
hostname = "nl-1.example.net"

[[port_map.entries]]
protocol = "WireGuard"
ports = [51820, 443]
use_ip_index = 1

[[port_map.entries]]
protocol = "OpenVPN TCP"
ports = [443]

[mode]
type = "manual"
protocol = "OpenVPN TCP"
port = 443

[firewall]
enabled = true
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.toml");
        std::fs::write(&path, toml).unwrap();

        let request = ConnectRequest::load(&path).unwrap();
        assert_eq!(request.port_map.len(), 2);
        assert_eq!(request.port_map.use_ip_index(Protocol::WireGuard), 1);
        assert!(request.firewall.enabled);
        assert!(request.firewall.allow_lan);
        assert_eq!(
            request.mode,
            ConnectionMode::Manual {
                protocol: Protocol::OpenVpnTcp,
                port: 443
            }
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
