// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Connection attempt policy
//!
//! Automatic mode builds an ordered plan of (protocol, port map entry, node)
//! attempts once per session and walks it on every failure. Manual mode is a
//! single attempt with the user's protocol and port.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use vpn_engine_common::{
    AttemptInfo, ConnectionDescriptor, ConnectionNodeType, LocationInfo, PortMap, Protocol,
    SettingsStore, SUCCESS_CONNECTION_PROTOCOL,
};

/// IKEv2 drops out of automatic plans after this many failed sessions
pub const MAX_IKEV2_FAILED_ATTEMPTS: u32 = 4;

/// Process-wide count of sessions in which IKEv2 failed
///
/// Kept in memory only; a daemon restart clears it.
#[derive(Debug, Clone, Default)]
pub struct Ikev2FailureCounter {
    count: Arc<Mutex<u32>>,
}

impl Ikev2FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment(&self) -> u32 {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        *count
    }

    pub fn reset(&self) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }
}

pub trait ConnectionPolicy: Send {
    /// Rewind to the first attempt without rebuilding the plan
    fn reset(&mut self);

    /// The current attempt failed; move on or mark the policy failed
    fn advance_on_failure(&mut self);

    fn is_failed(&self) -> bool;

    /// Parameters for the current attempt; None once nothing is left
    fn current_descriptor(&self) -> Option<ConnectionDescriptor>;

    /// The current attempt connected and passed the tunnel test
    fn record_success(&mut self);

    fn is_automatic(&self) -> bool;

    /// Do not try `protocol` again in this session
    fn skip_protocol(&mut self, protocol: Protocol);
}

/// Build a descriptor for `protocol`/`port` against the location's selected node
fn resolve_descriptor(
    location: &LocationInfo,
    port_map: &PortMap,
    protocol: Protocol,
    port: u16,
) -> ConnectionDescriptor {
    let use_ip_index = port_map.use_ip_index(protocol);
    let mut descriptor = ConnectionDescriptor {
        node_type: ConnectionNodeType::Default,
        protocol,
        port,
        ip: location.ip_for_selected_node(use_ip_index),
        hostname: location.hostname_for_selected_node(),
        dns_host_name: location.dns_name.clone(),
        wg_peer_public_key: location.wg_public_key_for_selected_node(),
        verify_x509_name: location.verify_x509_name.clone(),
        username: None,
        password: None,
        static_ip_ports: Vec::new(),
    };

    if let Some(static_ip) = &location.static_ip {
        descriptor.node_type = ConnectionNodeType::StaticIp;
        descriptor.username = Some(static_ip.username.clone());
        descriptor.password = Some(static_ip.password.clone());
        descriptor.static_ip_ports = static_ip.ports.clone();
        if protocol == Protocol::WireGuard {
            descriptor.ip = location.wg_ip_for_selected_node();
        }
    }

    descriptor
}

pub struct AutoConnectionPolicy {
    location: LocationInfo,
    port_map: PortMap,
    attempts: Vec<AttemptInfo>,
    cursor: usize,
    all_failed: bool,
    ikev2_failure_counted: bool,
    ikev2_failures: Ikev2FailureCounter,
    settings: SettingsStore,
    skipped: BTreeSet<Protocol>,
}

impl AutoConnectionPolicy {
    pub fn new(
        location: LocationInfo,
        port_map: PortMap,
        proxy_enabled: bool,
        ikev2_failures: Ikev2FailureCounter,
        settings: SettingsStore,
    ) -> Self {
        let remembered = settings
            .get(SUCCESS_CONNECTION_PROTOCOL)
            .and_then(|s| match s.parse::<Protocol>() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Ignoring remembered protocol: {}", e);
                    None
                }
            });

        let attempts = build_plan(
            &port_map,
            location.node_count(),
            proxy_enabled,
            ikev2_failures.get(),
            remembered,
        );
        debug!(
            "Automatic plan for {}: {} attempts over {} node(s), static IP: {}",
            location.id,
            attempts.len(),
            location.node_count(),
            location.is_static_ip()
        );

        Self {
            location,
            port_map,
            attempts,
            cursor: 0,
            all_failed: false,
            ikev2_failure_counted: false,
            ikev2_failures,
            settings,
            skipped: BTreeSet::new(),
        }
    }

    /// Move to the next attempt, rotating nodes at the end of each pass
    fn step(&mut self) -> bool {
        if self.cursor + 1 >= self.attempts.len() {
            info!("All {} connection attempts failed", self.attempts.len());
            self.all_failed = true;
            return false;
        }
        if self.attempts[self.cursor].change_node {
            self.location.select_next_node();
        }
        self.cursor += 1;
        true
    }

    /// Skipped protocols never become the current attempt
    fn skip_disabled(&mut self) {
        while let Some(attempt) = self.current() {
            if !self.skipped.contains(&attempt.protocol) {
                return;
            }
            debug!("Skipping attempt {} ({} is disabled)", self.cursor, attempt.protocol);
            if !self.step() {
                return;
            }
        }
    }

    fn current(&self) -> Option<AttemptInfo> {
        if self.is_failed() {
            return None;
        }
        self.attempts.get(self.cursor).copied()
    }
}

#[cfg(test)]
impl AutoConnectionPolicy {
    pub fn plan(&self) -> &[AttemptInfo] {
        &self.attempts
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Ordered attempt list for one session
pub fn build_plan(
    port_map: &PortMap,
    node_count: usize,
    proxy_enabled: bool,
    ikev2_failures: u32,
    remembered: Option<Protocol>,
) -> Vec<AttemptInfo> {
    let mut local: Vec<AttemptInfo> = port_map
        .entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| !(proxy_enabled && entry.protocol == Protocol::OpenVpnUdp))
        .filter(|(_, entry)| {
            !(entry.protocol.is_ikev2() && ikev2_failures >= MAX_IKEV2_FAILED_ATTEMPTS)
        })
        .map(|(index, entry)| AttemptInfo {
            protocol: entry.protocol,
            port_map_index: index,
            change_node: false,
        })
        .collect();

    if let Some(last) = local.last_mut() {
        last.change_node = true;
    }

    // A remembered protocol goes first, unless IKEv2 already is
    if let Some(protocol) = remembered {
        if let Some(pos) = local.iter().position(|a| a.protocol == protocol) {
            let attempt = local.remove(pos);
            let at = match local.first() {
                Some(first) if first.protocol.is_ikev2() => 1,
                _ => 0,
            };
            local.insert(at, attempt);
        }
    }

    let mut plan = Vec::with_capacity(local.len() * node_count * 2);
    for _ in 0..node_count {
        plan.extend_from_slice(&local);
    }
    plan.extend_from_within(..);
    plan
}

impl ConnectionPolicy for AutoConnectionPolicy {
    fn reset(&mut self) {
        self.cursor = 0;
        self.all_failed = false;
        self.skip_disabled();
    }

    fn advance_on_failure(&mut self) {
        let Some(failed) = self.current() else {
            self.all_failed = true;
            return;
        };

        if failed.protocol.is_ikev2() && !self.ikev2_failure_counted {
            let count = self.ikev2_failures.increment();
            self.ikev2_failure_counted = true;
            debug!("IKEv2 failure count is now {}", count);
        }

        if self.step() {
            self.skip_disabled();
        }
    }

    fn is_failed(&self) -> bool {
        self.all_failed || self.attempts.is_empty()
    }

    fn current_descriptor(&self) -> Option<ConnectionDescriptor> {
        let attempt = self.current()?;
        let entry = self.port_map.entry(attempt.port_map_index)?;
        let port = *entry.ports.first()?;
        Some(resolve_descriptor(
            &self.location,
            &self.port_map,
            attempt.protocol,
            port,
        ))
    }

    fn record_success(&mut self) {
        let Some(attempt) = self.current() else {
            return;
        };
        if attempt.protocol.is_ikev2() {
            self.ikev2_failures.reset();
        }

        info!("Remembering {} as the last successful protocol", attempt.protocol);
        if let Err(e) = self
            .settings
            .set(SUCCESS_CONNECTION_PROTOCOL, attempt.protocol.as_long_str())
        {
            warn!("Failed to persist successful protocol: {}", e);
        }
    }

    fn is_automatic(&self) -> bool {
        true
    }

    fn skip_protocol(&mut self, protocol: Protocol) {
        if self.skipped.insert(protocol) {
            info!("{} disabled for the rest of this session", protocol);
        }
    }
}

/// Single attempt with a user-chosen protocol and port
pub struct ManualConnectionPolicy {
    location: LocationInfo,
    port_map: PortMap,
    protocol: Protocol,
    port: u16,
    failed: bool,
}

impl ManualConnectionPolicy {
    pub fn new(location: LocationInfo, port_map: PortMap, protocol: Protocol, port: u16) -> Self {
        Self {
            location,
            port_map,
            protocol,
            port,
            failed: false,
        }
    }
}

impl ConnectionPolicy for ManualConnectionPolicy {
    fn reset(&mut self) {
        self.failed = false;
    }

    fn advance_on_failure(&mut self) {
        self.failed = true;
    }

    fn is_failed(&self) -> bool {
        self.failed
    }

    fn current_descriptor(&self) -> Option<ConnectionDescriptor> {
        if self.failed {
            return None;
        }
        Some(resolve_descriptor(
            &self.location,
            &self.port_map,
            self.protocol,
            self.port,
        ))
    }

    fn record_success(&mut self) {
        debug!("Manual connection with {} succeeded", self.protocol);
    }

    fn is_automatic(&self) -> bool {
        false
    }

    fn skip_protocol(&mut self, protocol: Protocol) {
        if protocol == self.protocol {
            self.failed = true;
        }
    }
}
