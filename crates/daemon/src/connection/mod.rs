// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Protocol connections
//!
//! One object per protocol family. `start` spawns a background run that
//! reports back to the orchestrator over an unbounded channel; every message
//! carries the `RunId` of the run that produced it so late events from a
//! superseded run can be dropped.

pub mod ikev2;
pub mod openvpn;
pub mod ring_log;
pub mod schedule;
pub mod wireguard;
pub mod wireguard_config;
pub mod worker;

use async_trait::async_trait;

use vpn_engine_common::{
    AdapterInfo, ConnectError, ConnectionDescriptor, Credentials, Protocol, ProxySettings,
    WireGuardKeys,
};

use crate::helper::HelperError;

pub use ikev2::Ikev2Connection;
pub use openvpn::{OpenVpnConnection, OpenVpnSettings};
pub use wireguard::{WireGuardConnection, WireGuardSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    OpenVpn,
    Ikev2,
    WireGuard,
}

impl ConnectionKind {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Ikev2 => ConnectionKind::Ikev2,
            Protocol::WireGuard => ConnectionKind::WireGuard,
            Protocol::OpenVpnUdp | Protocol::OpenVpnTcp | Protocol::Stunnel | Protocol::Wstunnel => {
                ConnectionKind::OpenVpn
            }
        }
    }
}

/// Identifies one run of one connection object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId {
    pub kind: ConnectionKind,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected(AdapterInfo),
    Error(ConnectError),
    Statistics { bytes_in: u64, bytes_out: u64 },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMessage {
    pub run: RunId,
    pub event: ConnectionEvent,
}

/// Per-start options that are not part of the descriptor
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Automatic mode arms the connect timeout
    pub automatic: bool,
    pub wireguard: Option<WireGuardKeys>,
    pub credentials: Option<Credentials>,
}

#[async_trait]
pub trait ProtocolConnection: Send {
    fn kind(&self) -> ConnectionKind;

    /// Stop any previous run (waiting for it to finish) and start a new one
    async fn start(
        &mut self,
        descriptor: ConnectionDescriptor,
        proxy: ProxySettings,
        options: StartOptions,
    ) -> RunId;

    /// Request teardown; `Disconnected` follows once resources are released
    async fn stop(&mut self);

    /// No platform resource of this protocol is up
    async fn is_disconnected(&self) -> bool;
}

/// Map a helper failure while bringing `protocol` up
pub fn connect_error(protocol: Protocol, error: &HelperError) -> ConnectError {
    match error {
        HelperError::VerifyFailed(_) => ConnectError::ExeVerifyFailed { protocol },
        HelperError::Unsupported(_) => ConnectError::Unsupported { protocol },
        HelperError::Execute(reason) => ConnectError::ConnectionFailed {
            protocol,
            reason: reason.clone(),
        },
        HelperError::Io(e) => ConnectError::ConnectionFailed {
            protocol,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_protocol() {
        assert_eq!(ConnectionKind::for_protocol(Protocol::Stunnel), ConnectionKind::OpenVpn);
        assert_eq!(ConnectionKind::for_protocol(Protocol::Ikev2), ConnectionKind::Ikev2);
        assert_eq!(
            ConnectionKind::for_protocol(Protocol::WireGuard),
            ConnectionKind::WireGuard
        );
    }

    #[test]
    fn test_connect_error_mapping() {
        let err = connect_error(
            Protocol::WireGuard,
            &HelperError::VerifyFailed("WireGuard".to_string()),
        );
        assert!(err.is_fatal_for_protocol());

        let err = connect_error(Protocol::Ikev2, &HelperError::Execute("boom".to_string()));
        assert_eq!(
            err,
            ConnectError::ConnectionFailed {
                protocol: Protocol::Ikev2,
                reason: "boom".to_string()
            }
        );
    }
}
