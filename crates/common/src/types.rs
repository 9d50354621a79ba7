// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// Common types for the VPN engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// VPN protocol
///
/// The long string form (`Display`) is what gets persisted, so it must stay
/// stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Protocol {
    OpenVpnUdp,
    OpenVpnTcp,
    Ikev2,
    WireGuard,
    /// OpenVPN TCP wrapped in a TLS tunnel by stunnel
    Stunnel,
    /// OpenVPN TCP wrapped in a websocket by wstunnel
    Wstunnel,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::OpenVpnUdp,
        Protocol::OpenVpnTcp,
        Protocol::Ikev2,
        Protocol::WireGuard,
        Protocol::Stunnel,
        Protocol::Wstunnel,
    ];

    pub fn is_ikev2(&self) -> bool {
        matches!(self, Protocol::Ikev2)
    }

    /// Protocols driven by an OpenVPN process (wrapped or not)
    pub fn is_openvpn_family(&self) -> bool {
        matches!(
            self,
            Protocol::OpenVpnUdp | Protocol::OpenVpnTcp | Protocol::Stunnel | Protocol::Wstunnel
        )
    }

    /// Protocols that cannot pass through an HTTP/SOCKS proxy
    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::OpenVpnUdp | Protocol::WireGuard)
    }

    pub fn as_long_str(&self) -> &'static str {
        match self {
            Protocol::OpenVpnUdp => "OpenVPN UDP",
            Protocol::OpenVpnTcp => "OpenVPN TCP",
            Protocol::Ikev2 => "IKEv2",
            Protocol::WireGuard => "WireGuard",
            Protocol::Stunnel => "Stunnel",
            Protocol::Wstunnel => "WStunnel",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_long_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "openvpn udp" | "udp" => Ok(Protocol::OpenVpnUdp),
            "openvpn tcp" | "tcp" => Ok(Protocol::OpenVpnTcp),
            "ikev2" => Ok(Protocol::Ikev2),
            "wireguard" | "wg" => Ok(Protocol::WireGuard),
            "stunnel" => Ok(Protocol::Stunnel),
            "wstunnel" => Ok(Protocol::Wstunnel),
            _ => Err(Error::UnknownProtocol(s.to_string())),
        }
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_long_str().to_string()
    }
}

impl TryFrom<String> for Protocol {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Candidate ports for one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapEntry {
    pub protocol: Protocol,
    /// Candidate ports, in preference order
    pub ports: Vec<u16>,
    /// Which of a node's addresses this protocol connects to
    #[serde(default)]
    pub use_ip_index: usize,
}

impl PortMapEntry {
    pub fn new(protocol: Protocol, ports: Vec<u16>) -> Self {
        Self {
            protocol,
            ports,
            use_ip_index: 0,
        }
    }
}

/// Ordered protocol/port preferences served by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(default)]
    pub entries: Vec<PortMapEntry>,
}

impl PortMap {
    pub fn new(entries: Vec<PortMapEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&PortMapEntry> {
        self.entries.get(index)
    }

    pub fn find(&self, protocol: Protocol) -> Option<&PortMapEntry> {
        self.entries.iter().find(|e| e.protocol == protocol)
    }

    /// Address index for a protocol (0 when the protocol is not listed)
    pub fn use_ip_index(&self, protocol: Protocol) -> usize {
        self.find(protocol).map(|e| e.use_ip_index).unwrap_or(0)
    }

    pub fn validate(&self) -> crate::Result<()> {
        for entry in &self.entries {
            if entry.ports.is_empty() {
                return Err(Error::Config(format!(
                    "Port map entry for {} has no ports",
                    entry.protocol
                )));
            }
        }
        Ok(())
    }
}

/// One step of an attempt plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    pub protocol: Protocol,
    pub port_map_index: usize,
    /// Select the next server node after this attempt fails
    pub change_node: bool,
}

/// How the resolved descriptor was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionNodeType {
    Default,
    StaticIp,
}

/// Ready-to-use parameters for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub node_type: ConnectionNodeType,
    pub protocol: Protocol,
    pub port: u16,
    pub ip: String,
    pub hostname: String,
    pub dns_host_name: String,
    pub wg_peer_public_key: String,
    pub verify_x509_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ip_ports: Vec<u16>,
}

/// State of the tunnel, owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,
    Connecting,
    Testing,
    Connected,
    Reconnecting,
    Disconnecting,
    Failed,
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Check if the state represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting
                | TunnelState::Testing
                | TunnelState::Reconnecting
                | TunnelState::Disconnecting
        )
    }

    /// A session exists (anything but Idle/Failed)
    pub fn is_active(&self) -> bool {
        !matches!(self, TunnelState::Idle | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Testing => "testing",
            TunnelState::Connected => "connected",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Disconnecting => "disconnecting",
            TunnelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a connection attempt or session failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectError {
    #[error("{protocol} executable failed signature verification")]
    ExeVerifyFailed { protocol: Protocol },

    #[error("{protocol} service could not be installed or started")]
    ServiceStartFailed { protocol: Protocol },

    #[error("{protocol} connection failed: {reason}")]
    ConnectionFailed { protocol: Protocol, reason: String },

    #[error("WireGuard adapter setup failed")]
    AdapterSetupFailed,

    #[error("No WireGuard handshake for {seconds} seconds")]
    HandshakeStale { seconds: i64 },

    #[error("Timed out waiting for connection in automatic mode")]
    AutomaticModeTimeout,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Tunnel test failed")]
    ProbeTimeout,

    #[error("All connection attempts failed")]
    PolicyExhausted,

    #[error("{protocol} is not supported on this platform")]
    Unsupported { protocol: Protocol },
}

impl ConnectError {
    /// Retrying the same protocol in this session would hit the same wall
    pub fn is_fatal_for_protocol(&self) -> bool {
        matches!(
            self,
            ConnectError::ExeVerifyFailed { .. } | ConnectError::Unsupported { .. }
        )
    }
}

/// Adapter identification reported when a tunnel comes up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub adapter_name: String,
    #[serde(default)]
    pub adapter_ip: String,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Events published by the engine daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        state: TunnelState,
        timestamp: DateTime<Utc>,
    },

    /// Tunnel connected and passed the health test
    Connected {
        protocol: Protocol,
        port: u16,
        adapter: AdapterInfo,
        /// External IP reported by the tunnel test
        tunnel_ip: String,
        timestamp: DateTime<Utc>,
    },

    Statistics {
        bytes_in: u64,
        bytes_out: u64,
        timestamp: DateTime<Utc>,
    },

    /// One attempt failed (automatic mode keeps going)
    AttemptFailed {
        protocol: Protocol,
        error: ConnectError,
        timestamp: DateTime<Utc>,
    },

    /// Session-ending error
    Error {
        error: ConnectError,
        timestamp: DateTime<Utc>,
    },

    Disconnected {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

/// Snapshot returned by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<uuid::Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ConnectError>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: TunnelState::Idle,
            session_id: None,
            protocol: None,
            port: None,
            tunnel_ip: None,
            connected_since: None,
            bytes_in: 0,
            bytes_out: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_long_string_round_trip() {
        for protocol in Protocol::ALL {
            let parsed: Protocol = protocol.to_string().parse().unwrap();
            assert_eq!(parsed, protocol);
        }
    }

    #[test]
    fn test_protocol_short_forms() {
        assert_eq!("wg".parse::<Protocol>().unwrap(), Protocol::WireGuard);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::OpenVpnUdp);
        assert_eq!("openvpn_tcp".parse::<Protocol>().unwrap(), Protocol::OpenVpnTcp);
        assert!("l2tp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_predicates() {
        assert!(Protocol::Ikev2.is_ikev2());
        assert!(!Protocol::WireGuard.is_ikev2());
        assert!(Protocol::Stunnel.is_openvpn_family());
        assert!(!Protocol::WireGuard.is_openvpn_family());
        assert!(Protocol::WireGuard.is_udp());
        assert!(!Protocol::OpenVpnTcp.is_udp());
    }

    #[test]
    fn test_protocol_serializes_as_long_string() {
        let json = serde_json::to_string(&Protocol::OpenVpnUdp).unwrap();
        assert_eq!(json, "\"OpenVPN UDP\"");
        let back: Protocol = serde_json::from_str("\"IKEv2\"").unwrap();
        assert_eq!(back, Protocol::Ikev2);
    }

    #[test]
    fn test_port_map_use_ip_index() {
        let mut wg = PortMapEntry::new(Protocol::WireGuard, vec![51820]);
        wg.use_ip_index = 2;
        let map = PortMap::new(vec![PortMapEntry::new(Protocol::Ikev2, vec![500]), wg]);

        assert_eq!(map.use_ip_index(Protocol::WireGuard), 2);
        assert_eq!(map.use_ip_index(Protocol::Ikev2), 0);
        assert_eq!(map.use_ip_index(Protocol::Stunnel), 0);
    }

    #[test]
    fn test_port_map_rejects_empty_ports() {
        let map = PortMap::new(vec![PortMapEntry::new(Protocol::OpenVpnTcp, vec![])]);
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ConnectError::ExeVerifyFailed {
            protocol: Protocol::WireGuard
        }
        .is_fatal_for_protocol());
        assert!(!ConnectError::AutomaticModeTimeout.is_fatal_for_protocol());
    }

    #[test]
    fn test_event_json_shape() {
        let event = EngineEvent::Error {
            error: ConnectError::PolicyExhausted,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"kind\":\"policy_exhausted\""));
    }
}
