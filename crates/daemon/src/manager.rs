// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Connection orchestrator
//!
//! `ConnectionManager` is a cheap handle; the session itself is owned by one
//! orchestration task that serializes API commands, protocol connection
//! events and tunnel test outcomes.
//!
//! Idle -> Connecting -> Testing -> Connected <-> Reconnecting -> Disconnecting -> Idle

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vpn_engine_common::{
    AdapterInfo, ConnectError, ConnectRequest, ConnectionDescriptor, ConnectionMode, EngineEvent,
    EngineStatus, SettingsStore, TunnelState,
};

use crate::cleanup::{finish_all_active_connections, CleanupTargets};
use crate::config::DaemonConfig;
use crate::connection::{
    ConnectionEvent, ConnectionKind, ConnectionMessage, Ikev2Connection, OpenVpnConnection,
    OpenVpnSettings, ProtocolConnection, RunId, StartOptions, WireGuardConnection,
    WireGuardSettings,
};
use crate::firewall::FirewallController;
use crate::helper::PrivilegedHelper;
use crate::policy::{
    AutoConnectionPolicy, ConnectionPolicy, Ikev2FailureCounter, ManualConnectionPolicy,
};
use crate::probe::ProbeService;
use crate::prober::{ProbeOutcome, ProbeSchedule, TunnelProber};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Upper bound on waiting for teardown when the daemon exits
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the engine needs from the outside
pub struct EngineDeps {
    pub helper: Arc<dyn PrivilegedHelper>,
    pub probe: Arc<dyn ProbeService>,
    pub settings: SettingsStore,
    pub config: DaemonConfig,
}

enum Command {
    Connect {
        request: Box<ConnectRequest>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Cleanup {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection engine
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<EngineStatus>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl ConnectionManager {
    /// Build the engine and spawn its orchestration task
    pub fn new(deps: EngineDeps) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(EngineStatus::default()));

        let config = &deps.config;
        let automatic_timeout = Duration::from_secs(config.wireguard.automatic_timeout_secs);

        let mut connections: HashMap<ConnectionKind, Box<dyn ProtocolConnection>> =
            HashMap::new();
        connections.insert(
            ConnectionKind::WireGuard,
            Box::new(WireGuardConnection::new(
                deps.helper.clone(),
                WireGuardSettings {
                    interface: config.wireguard.interface.clone(),
                    data_dir: config.data_dir.clone(),
                    automatic_timeout,
                },
                conn_tx.clone(),
            )),
        );
        connections.insert(
            ConnectionKind::OpenVpn,
            Box::new(OpenVpnConnection::new(
                deps.helper.clone(),
                OpenVpnSettings {
                    executable: config.openvpn.executable.clone(),
                    config_template: config.openvpn.config_template.clone(),
                    management_port: config.openvpn.management_port,
                    data_dir: config.data_dir.clone(),
                    automatic_timeout,
                    stunnel_executable: config.stunnel_executable.clone(),
                    wstunnel_executable: config.wstunnel_executable.clone(),
                },
                conn_tx.clone(),
            )),
        );
        connections.insert(
            ConnectionKind::Ikev2,
            Box::new(Ikev2Connection::new(
                deps.helper.clone(),
                automatic_timeout,
                conn_tx,
            )),
        );

        let orchestrator = Orchestrator {
            firewall: FirewallController::new(deps.helper.clone()),
            prober: TunnelProber::new(
                deps.probe.clone(),
                ProbeSchedule::from_config(&config.tunnel_test),
                probe_tx,
            ),
            cleanup_targets: CleanupTargets {
                openvpn_executable: config.openvpn.executable.clone(),
                stunnel_executable: config.stunnel_executable.clone(),
                wstunnel_executable: config.wstunnel_executable.clone(),
            },
            helper: deps.helper,
            connections,
            ikev2_failures: Ikev2FailureCounter::new(),
            settings: deps.settings,
            publisher: Publisher {
                status: status.clone(),
                event_tx: event_tx.clone(),
            },
            session: None,
        };
        tokio::spawn(orchestrator.run(command_rx, conn_rx, probe_rx));

        Self {
            commands: command_tx,
            status,
            event_tx,
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    pub async fn state(&self) -> TunnelState {
        self.status.read().await.state
    }

    /// Start a session; progress is reported through events
    pub async fn connect(&self, request: ConnectRequest) -> Result<Uuid> {
        request.validate().context("Invalid connect request")?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            request: Box::new(request),
            reply,
        })?;
        rx.await.context("Connection engine stopped")?
    }

    /// Tear the session down; returns once everything is released
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        rx.await.context("Connection engine stopped")
    }

    /// Remove leftovers of earlier sessions; refused while a session runs
    pub async fn cleanup(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cleanup { reply })?;
        rx.await.context("Connection engine stopped")?
    }

    /// Disconnect and stop the orchestration task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Connection engine stopped"))
    }
}

/// Shared status plus the event fan-out
struct Publisher {
    status: Arc<RwLock<EngineStatus>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Publisher {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn set_state(&self, state: TunnelState) {
        {
            let mut status = self.status.write().await;
            if status.state == state {
                return;
            }
            status.state = state;
        }
        info!("Engine state: {}", state);
        self.emit(EngineEvent::StateChanged {
            state,
            timestamp: Utc::now(),
        });
    }

    async fn update(&self, f: impl FnOnce(&mut EngineStatus)) {
        f(&mut *self.status.write().await);
    }

    async fn state(&self) -> TunnelState {
        self.status.read().await.state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDisconnect {
    NextAttempt,
    Finish,
}

struct Session {
    id: Uuid,
    request: ConnectRequest,
    policy: Box<dyn ConnectionPolicy>,
    active: Option<RunId>,
    descriptor: Option<ConnectionDescriptor>,
    adapter: Option<AdapterInfo>,
    probe_generation: Option<u64>,
    after_disconnect: Option<AfterDisconnect>,
    final_error: Option<ConnectError>,
    firewall_enabled: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

struct Orchestrator {
    helper: Arc<dyn PrivilegedHelper>,
    firewall: FirewallController,
    prober: TunnelProber,
    connections: HashMap<ConnectionKind, Box<dyn ProtocolConnection>>,
    ikev2_failures: Ikev2FailureCounter,
    settings: SettingsStore,
    cleanup_targets: CleanupTargets,
    publisher: Publisher,
    session: Option<Session>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionMessage>,
        mut probe_rx: mpsc::UnboundedReceiver<ProbeOutcome>,
    ) {
        debug!("Orchestrator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown(&mut conn_rx).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown(&mut conn_rx).await;
                        break;
                    }
                },
                Some(message) = conn_rx.recv() => self.on_connection_message(message).await,
                Some(outcome) = probe_rx.recv() => self.on_probe_outcome(outcome).await,
            }
        }
        debug!("Orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { request, reply } => {
                let result = self.connect(*request).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => self.begin_disconnect(Some(reply)).await,
            Command::Cleanup { reply } => {
                let result = self.cleanup().await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self, request: ConnectRequest) -> Result<Uuid> {
        if self.session.is_some() {
            let state = self.publisher.state().await;
            anyhow::bail!("A session is already active ({})", state);
        }

        let policy: Box<dyn ConnectionPolicy> = match &request.mode {
            ConnectionMode::Automatic => Box::new(AutoConnectionPolicy::new(
                request.location.clone(),
                request.port_map.clone(),
                request.proxy.is_active(),
                self.ikev2_failures.clone(),
                self.settings.clone(),
            )),
            ConnectionMode::Manual { protocol, port } => Box::new(ManualConnectionPolicy::new(
                request.location.clone(),
                request.port_map.clone(),
                *protocol,
                *port,
            )),
        };

        let id = Uuid::new_v4();
        info!(
            "Starting session {} to {} ({})",
            id,
            request.location.id,
            if policy.is_automatic() { "automatic" } else { "manual" }
        );

        self.publisher
            .update(|status| {
                *status = EngineStatus {
                    state: status.state,
                    session_id: Some(id),
                    ..EngineStatus::default()
                }
            })
            .await;
        self.publisher.set_state(TunnelState::Connecting).await;

        // Fresh session: nothing from an earlier run may keep claiming the network
        finish_all_active_connections(self.helper.as_ref(), &self.cleanup_targets).await;

        let mut firewall_enabled = false;
        if request.firewall.enabled {
            let ips = request.location.all_ips();
            match self.firewall.firewall_on(&ips, request.firewall.allow_lan).await {
                Ok(()) => firewall_enabled = true,
                Err(e) => warn!("Failed to enable firewall: {}", e),
            }
        } else if let Err(e) = self.firewall.firewall_off().await {
            warn!("Failed to clear stale firewall rules: {}", e);
        }

        self.session = Some(Session {
            id,
            request,
            policy,
            active: None,
            descriptor: None,
            adapter: None,
            probe_generation: None,
            after_disconnect: None,
            final_error: None,
            firewall_enabled,
            waiters: Vec::new(),
        });
        self.start_attempt().await;
        Ok(id)
    }

    async fn cleanup(&mut self) -> Result<()> {
        if self.session.is_some() {
            anyhow::bail!("Cannot clean up while a session is active");
        }
        finish_all_active_connections(self.helper.as_ref(), &self.cleanup_targets).await;
        self.firewall
            .firewall_off()
            .await
            .context("Failed to turn the firewall off")?;
        Ok(())
    }

    /// Start the policy's current attempt, or end the session when none is left
    async fn start_attempt(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let descriptor = if session.policy.is_failed() {
            None
        } else {
            session.policy.current_descriptor()
        };
        let Some(descriptor) = descriptor else {
            if session.final_error.is_none() {
                session.final_error = Some(ConnectError::PolicyExhausted);
            }
            self.finish().await;
            return;
        };

        let options = StartOptions {
            automatic: session.policy.is_automatic(),
            wireguard: session.request.wireguard.clone(),
            credentials: session.request.credentials.clone(),
        };
        let proxy = session.request.proxy.clone();
        let kind = ConnectionKind::for_protocol(descriptor.protocol);

        info!(
            "Attempting {} to {}:{} ({})",
            descriptor.protocol, descriptor.ip, descriptor.port, descriptor.hostname
        );
        session.descriptor = Some(descriptor.clone());
        session.adapter = None;
        session.after_disconnect = None;

        let protocol = descriptor.protocol;
        let port = descriptor.port;
        self.publisher
            .update(|status| {
                status.protocol = Some(protocol);
                status.port = Some(port);
                status.tunnel_ip = None;
                status.connected_since = None;
            })
            .await;
        self.publisher.set_state(TunnelState::Connecting).await;

        let Some(connection) = self.connections.get_mut(&kind) else {
            warn!("No connection object for {:?}", kind);
            return;
        };
        let run = connection.start(descriptor, proxy, options).await;
        if let Some(session) = self.session.as_mut() {
            session.active = Some(run);
        }
    }

    async fn on_connection_message(&mut self, message: ConnectionMessage) {
        let Some(session) = self.session.as_ref() else {
            debug!("Ignoring {:?} from {:?}: no session", message.event, message.run);
            return;
        };
        if session.active != Some(message.run) {
            debug!("Ignoring {:?} from superseded run {:?}", message.event, message.run);
            return;
        }

        match message.event {
            ConnectionEvent::Statistics {
                bytes_in,
                bytes_out,
            } => {
                self.publisher
                    .update(|status| {
                        status.bytes_in = bytes_in;
                        status.bytes_out = bytes_out;
                    })
                    .await;
                self.publisher.emit(EngineEvent::Statistics {
                    bytes_in,
                    bytes_out,
                    timestamp: Utc::now(),
                });
            }
            ConnectionEvent::Connected(adapter) => self.on_connected(adapter).await,
            ConnectionEvent::Error(error) => self.on_attempt_error(error).await,
            ConnectionEvent::Disconnected => self.on_disconnected().await,
        }
    }

    async fn on_connected(&mut self, adapter: AdapterInfo) {
        let state = self.publisher.state().await;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if state != TunnelState::Connecting {
            debug!("Connected while {}, ignoring", state);
            return;
        }
        let Some(protocol) = session.descriptor.as_ref().map(|d| d.protocol) else {
            return;
        };

        info!(
            "{} up on {} ({}), testing tunnel",
            protocol, adapter.adapter_name, adapter.adapter_ip
        );
        session.adapter = Some(adapter);
        session.probe_generation = Some(self.prober.start(protocol));
        self.publisher.set_state(TunnelState::Testing).await;
    }

    async fn on_attempt_error(&mut self, error: ConnectError) {
        let state = self.publisher.state().await;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if state == TunnelState::Disconnecting {
            debug!("Error while disconnecting: {}", error);
            return;
        }
        let Some(protocol) = session.descriptor.as_ref().map(|d| d.protocol) else {
            return;
        };

        warn!("{} attempt failed: {}", protocol, error);
        self.publisher.emit(EngineEvent::AttemptFailed {
            protocol,
            error: error.clone(),
            timestamp: Utc::now(),
        });
        if error.is_fatal_for_protocol() {
            session.policy.skip_protocol(protocol);
        }

        // The connection tears itself down after an error
        self.fail_attempt(error).await;
    }

    /// Decide what happens once the failed attempt reports `Disconnected`
    async fn fail_attempt(&mut self, error: ConnectError) {
        self.prober.stop();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.probe_generation = None;

        if session.policy.is_automatic() {
            session.after_disconnect = Some(AfterDisconnect::NextAttempt);
            self.publisher.set_state(TunnelState::Reconnecting).await;
        } else {
            session.after_disconnect = Some(AfterDisconnect::Finish);
            session.final_error = Some(error);
            self.publisher.set_state(TunnelState::Disconnecting).await;
        }
    }

    async fn on_disconnected(&mut self) {
        let state = self.publisher.state().await;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.active = None;

        match session.after_disconnect.take() {
            Some(AfterDisconnect::Finish) => self.finish().await,
            Some(AfterDisconnect::NextAttempt) => {
                session.policy.advance_on_failure();
                self.start_attempt().await;
            }
            None => match state {
                TunnelState::Connected => {
                    info!("Tunnel dropped, reconnecting from the top of the plan");
                    self.prober.stop();
                    session.probe_generation = None;
                    session.policy.reset();
                    self.publisher.set_state(TunnelState::Reconnecting).await;
                    self.start_attempt().await;
                }
                TunnelState::Disconnecting => self.finish().await,
                _ => {
                    // Dropped before the attempt completed
                    let protocol = session.descriptor.as_ref().map(|d| d.protocol);
                    self.prober.stop();
                    session.probe_generation = None;
                    if session.policy.is_automatic() {
                        session.policy.advance_on_failure();
                        self.start_attempt().await;
                    } else {
                        session.final_error = protocol.map(|protocol| {
                            ConnectError::ConnectionFailed {
                                protocol,
                                reason: "connection dropped".to_string(),
                            }
                        });
                        self.finish().await;
                    }
                }
            },
        }
    }

    async fn on_probe_outcome(&mut self, outcome: ProbeOutcome) {
        let state = self.publisher.state().await;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.probe_generation != Some(outcome.generation) || state != TunnelState::Testing {
            debug!("Ignoring stale tunnel test outcome #{}", outcome.generation);
            return;
        }
        session.probe_generation = None;
        let Some(descriptor) = session.descriptor.clone() else {
            return;
        };

        if outcome.success {
            session.policy.record_success();
            let adapter = session.adapter.clone().unwrap_or_default();
            let now = Utc::now();
            let tunnel_ip = outcome.ip.clone();
            self.publisher
                .update(|status| {
                    status.tunnel_ip = (!tunnel_ip.is_empty()).then_some(tunnel_ip);
                    status.connected_since = Some(now);
                    status.last_error = None;
                })
                .await;
            info!(
                "Connected with {} on port {} (session {})",
                descriptor.protocol, descriptor.port, session.id
            );
            self.publisher.set_state(TunnelState::Connected).await;
            self.publisher.emit(EngineEvent::Connected {
                protocol: descriptor.protocol,
                port: descriptor.port,
                adapter,
                tunnel_ip: outcome.ip,
                timestamp: now,
            });
            return;
        }

        warn!("Tunnel test failed for {}", descriptor.protocol);
        self.publisher.emit(EngineEvent::AttemptFailed {
            protocol: descriptor.protocol,
            error: ConnectError::ProbeTimeout,
            timestamp: Utc::now(),
        });
        let active = session.active;
        self.fail_attempt(ConnectError::ProbeTimeout).await;
        if let Some(run) = active {
            if let Some(connection) = self.connections.get_mut(&run.kind) {
                connection.stop().await;
            }
        }
    }

    /// Stop the session; `waiter` fires once it is fully torn down
    async fn begin_disconnect(&mut self, waiter: Option<oneshot::Sender<()>>) {
        let state = self.publisher.state().await;
        let Some(session) = self.session.as_mut() else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
            return;
        };
        if let Some(waiter) = waiter {
            session.waiters.push(waiter);
        }
        if state == TunnelState::Disconnecting
            && session.after_disconnect == Some(AfterDisconnect::Finish)
        {
            return;
        }

        info!("Disconnecting session {}", session.id);
        session.after_disconnect = Some(AfterDisconnect::Finish);
        session.final_error = None;
        session.probe_generation = None;
        let active = session.active;

        self.prober.stop();
        self.publisher.set_state(TunnelState::Disconnecting).await;

        match active {
            Some(run) => match self.connections.get_mut(&run.kind) {
                Some(connection) => connection.stop().await,
                None => self.finish().await,
            },
            None => self.finish().await,
        }
    }

    /// Release session resources and go back to Idle, passing through
    /// Failed when the session ended with an error
    async fn finish(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.prober.stop();

        if session.firewall_enabled {
            if let Err(e) = self.firewall.firewall_off().await {
                warn!("Failed to turn the firewall off: {}", e);
            }
        }

        let error = session.final_error;
        let last_error = error.clone();
        self.publisher
            .update(|status| {
                status.session_id = None;
                status.protocol = None;
                status.port = None;
                status.tunnel_ip = None;
                status.connected_since = None;
                status.last_error = last_error;
            })
            .await;

        let reason = match &error {
            Some(error) => {
                warn!("Session {} failed: {}", session.id, error);
                self.publisher.emit(EngineEvent::Error {
                    error: error.clone(),
                    timestamp: Utc::now(),
                });
                error.to_string()
            }
            None => {
                info!("Session {} ended", session.id);
                "disconnected".to_string()
            }
        };
        if error.is_some() {
            self.publisher.set_state(TunnelState::Failed).await;
        }
        self.publisher.set_state(TunnelState::Idle).await;
        self.publisher.emit(EngineEvent::Disconnected {
            reason,
            timestamp: Utc::now(),
        });

        for waiter in session.waiters {
            let _ = waiter.send(());
        }
    }

    async fn shutdown(&mut self, conn_rx: &mut mpsc::UnboundedReceiver<ConnectionMessage>) {
        if self.session.is_none() {
            return;
        }
        info!("Shutting down active session");
        self.begin_disconnect(None).await;

        let drain = async {
            while self.session.is_some() {
                match conn_rx.recv().await {
                    Some(message) => self.on_connection_message(message).await,
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("Timed out waiting for the tunnel to stop");
        }
        self.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::Ikev2Status;
    use crate::testing::{FakeFailure, FakeHelper, FakeProbeService, ProbeScript};
    use vpn_engine_common::{
        Credentials, FirewallRequest, LocationInfo, Node, PortMap, PortMapEntry, Protocol,
        ProxySettings, WireGuardKeys, SUCCESS_CONNECTION_PROTOCOL,
    };

    const TUNNEL_IP: &str = "203.0.113.9";

    struct Fixture {
        _dir: tempfile::TempDir,
        helper: Arc<FakeHelper>,
        probe: Arc<FakeProbeService>,
        settings: SettingsStore,
        manager: ConnectionManager,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn fixture(helper: FakeHelper, script: Vec<ProbeScript>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let helper = Arc::new(helper);
        let probe = Arc::new(FakeProbeService::new(script));
        let settings = SettingsStore::in_memory();

        let mut config = DaemonConfig::default();
        config.data_dir = dir.path().to_path_buf();

        let manager = ConnectionManager::new(EngineDeps {
            helper: helper.clone(),
            probe: probe.clone(),
            settings: settings.clone(),
            config,
        });
        let events = manager.subscribe();
        Fixture {
            _dir: dir,
            helper,
            probe,
            settings,
            manager,
            events,
        }
    }

    fn request(protocols: &[Protocol], mode: ConnectionMode) -> ConnectRequest {
        ConnectRequest {
            location: LocationInfo::new(
                "nl",
                "nl.example.net",
                vec![Node {
                    ips: vec!["198.51.100.1".to_string()],
                    hostname: "nl-1.example.net".to_string(),
                    wg_public_key: "PEER=".to_string(),
                    wg_ip: "198.51.100.2".to_string(),
                }],
            ),
            port_map: PortMap::new(
                protocols
                    .iter()
                    .map(|p| PortMapEntry::new(*p, vec![443]))
                    .collect(),
            ),
            mode,
            wireguard: Some(WireGuardKeys {
                private_key: "KEY=".to_string(),
                address: "100.64.0.2/32".to_string(),
                dns: vec![],
                preshared_key: None,
            }),
            proxy: ProxySettings::default(),
            credentials: Some(Credentials {
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
            firewall: FirewallRequest::default(),
        }
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        predicate: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not seen")
    }

    fn is_connected(event: &EngineEvent) -> bool {
        matches!(event, EngineEvent::Connected { .. })
    }

    fn is_disconnected(event: &EngineEvent) -> bool {
        matches!(event, EngineEvent::Disconnected { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_wireguard_session_connects_and_disconnects() {
        let mut f = fixture(
            FakeHelper::new(),
            vec![ProbeScript::Answer(TUNNEL_IP.to_string())],
        );

        let id = f
            .manager
            .connect(request(&[Protocol::WireGuard], ConnectionMode::Automatic))
            .await
            .unwrap();

        let event = wait_for(&mut f.events, is_connected).await;
        match event {
            EngineEvent::Connected {
                protocol,
                port,
                tunnel_ip,
                ..
            } => {
                assert_eq!(protocol, Protocol::WireGuard);
                assert_eq!(port, 443);
                assert_eq!(tunnel_ip, TUNNEL_IP);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = f.manager.status().await;
        assert_eq!(status.state, TunnelState::Connected);
        assert_eq!(status.session_id, Some(id));
        assert_eq!(status.tunnel_ip.as_deref(), Some(TUNNEL_IP));
        assert_eq!(
            f.settings.get(SUCCESS_CONNECTION_PROTOCOL).as_deref(),
            Some("WireGuard")
        );

        f.manager.disconnect().await.unwrap();
        let status = f.manager.status().await;
        assert_eq!(status.state, TunnelState::Idle);
        assert!(status.session_id.is_none());
        assert!(status.last_error.is_none());
        assert!(!f.helper.snapshot().wg_running);
        assert_eq!(f.helper.call_count("stop_wireguard"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_failure_falls_back_to_next_protocol() {
        let mut f = fixture(
            FakeHelper::with(|s| s.install_failure = Some(FakeFailure::Verify)),
            vec![ProbeScript::Answer(TUNNEL_IP.to_string())],
        );

        f.manager
            .connect(request(
                &[Protocol::WireGuard, Protocol::Ikev2],
                ConnectionMode::Automatic,
            ))
            .await
            .unwrap();

        let failed = wait_for(&mut f.events, |e| {
            matches!(e, EngineEvent::AttemptFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            EngineEvent::AttemptFailed {
                protocol: Protocol::WireGuard,
                error: ConnectError::ExeVerifyFailed { .. },
                ..
            }
        ));

        let event = wait_for(&mut f.events, is_connected).await;
        assert!(matches!(
            event,
            EngineEvent::Connected {
                protocol: Protocol::Ikev2,
                ..
            }
        ));
        assert_eq!(f.helper.call_count("install_wireguard"), 1);

        f.manager.disconnect().await.unwrap();
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_plan_ends_in_failed_state() {
        let mut f = fixture(FakeHelper::new(), vec![]);

        f.manager
            .connect(request(&[Protocol::WireGuard], ConnectionMode::Automatic))
            .await
            .unwrap();

        let event = wait_for(&mut f.events, |e| matches!(e, EngineEvent::Error { .. })).await;
        assert!(matches!(
            event,
            EngineEvent::Error {
                error: ConnectError::PolicyExhausted,
                ..
            }
        ));
        wait_for(&mut f.events, is_disconnected).await;

        let status = f.manager.status().await;
        assert_eq!(status.state, TunnelState::Idle);
        assert_eq!(status.last_error, Some(ConnectError::PolicyExhausted));
        // Plan is the single entry, duplicated
        assert_eq!(f.helper.call_count("start_wireguard_service"), 2);
        // Three probes per attempt
        assert_eq!(f.probe.probe_timeouts().len(), 6);
        assert!(f.settings.get(SUCCESS_CONNECTION_PROTOCOL).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_failure_surfaces_error() {
        let mut f = fixture(
            FakeHelper::with(|s| s.install_failure = Some(FakeFailure::Execute)),
            vec![],
        );

        f.manager
            .connect(request(
                &[Protocol::WireGuard],
                ConnectionMode::Manual {
                    protocol: Protocol::WireGuard,
                    port: 51820,
                },
            ))
            .await
            .unwrap();

        let event = wait_for(&mut f.events, |e| matches!(e, EngineEvent::Error { .. })).await;
        assert!(matches!(
            event,
            EngineEvent::Error {
                error: ConnectError::ConnectionFailed {
                    protocol: Protocol::WireGuard,
                    ..
                },
                ..
            }
        ));
        wait_for(&mut f.events, is_disconnected).await;
        let status = f.manager.status().await;
        assert_eq!(status.state, TunnelState::Idle);
        assert!(status.last_error.is_some());
        assert_eq!(f.helper.call_count("install_wireguard"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tunnel_test_advances_plan() {
        let mut f = fixture(
            FakeHelper::new(),
            vec![
                ProbeScript::Fail,
                ProbeScript::Fail,
                ProbeScript::Fail,
                ProbeScript::Answer(TUNNEL_IP.to_string()),
            ],
        );

        f.manager
            .connect(request(
                &[Protocol::WireGuard, Protocol::Ikev2],
                ConnectionMode::Automatic,
            ))
            .await
            .unwrap();

        let failed = wait_for(&mut f.events, |e| {
            matches!(e, EngineEvent::AttemptFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            EngineEvent::AttemptFailed {
                protocol: Protocol::WireGuard,
                error: ConnectError::ProbeTimeout,
                ..
            }
        ));

        let event = wait_for(&mut f.events, is_connected).await;
        assert!(matches!(
            event,
            EngineEvent::Connected {
                protocol: Protocol::Ikev2,
                ..
            }
        ));
        assert!(!f.helper.snapshot().wg_running);

        f.manager.disconnect().await.unwrap();
        assert_eq!(f.helper.call_count("stop_ikev2"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firewall_follows_session() {
        let mut f = fixture(
            FakeHelper::new(),
            vec![ProbeScript::Answer(TUNNEL_IP.to_string())],
        );

        let mut req = request(&[Protocol::WireGuard], ConnectionMode::Automatic);
        req.firewall = FirewallRequest {
            enabled: true,
            allow_lan: false,
        };
        f.manager.connect(req).await.unwrap();
        wait_for(&mut f.events, is_connected).await;

        assert!(f.helper.snapshot().firewall_on);
        assert!(f
            .helper
            .calls()
            .contains(&"firewall_on:198.51.100.1,198.51.100.2:false".to_string()));

        f.manager.disconnect().await.unwrap();
        assert!(!f.helper.snapshot().firewall_on);
        assert!(f.helper.calls().contains(&"firewall_off:true".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_is_rejected() {
        let mut f = fixture(
            FakeHelper::new(),
            vec![ProbeScript::Answer(TUNNEL_IP.to_string())],
        );

        f.manager
            .connect(request(&[Protocol::WireGuard], ConnectionMode::Automatic))
            .await
            .unwrap();
        let err = f
            .manager
            .connect(request(&[Protocol::WireGuard], ConnectionMode::Automatic))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already active"));

        wait_for(&mut f.events, is_connected).await;
        f.manager.disconnect().await.unwrap();
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_tunnel_reconnects() {
        let mut f = fixture(
            FakeHelper::new(),
            vec![
                ProbeScript::Answer(TUNNEL_IP.to_string()),
                ProbeScript::Answer(TUNNEL_IP.to_string()),
            ],
        );

        f.manager
            .connect(request(&[Protocol::WireGuard], ConnectionMode::Automatic))
            .await
            .unwrap();
        wait_for(&mut f.events, is_connected).await;

        f.helper.update(|s| s.wg_running = false);
        wait_for(&mut f.events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged {
                    state: TunnelState::Reconnecting,
                    ..
                }
            )
        })
        .await;
        wait_for(&mut f.events, is_connected).await;
        assert_eq!(f.helper.call_count("start_wireguard_service"), 2);

        f.manager.disconnect().await.unwrap();
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_failure_is_not_retried_after_drop() {
        let mut f = fixture(
            FakeHelper::with(|s| s.install_failure = Some(FakeFailure::Verify)),
            vec![
                ProbeScript::Answer(TUNNEL_IP.to_string()),
                ProbeScript::Answer(TUNNEL_IP.to_string()),
            ],
        );

        f.manager
            .connect(request(
                &[Protocol::WireGuard, Protocol::Ikev2],
                ConnectionMode::Automatic,
            ))
            .await
            .unwrap();
        wait_for(&mut f.events, is_connected).await;

        f.helper.update(|s| s.ikev2_status = Ikev2Status::Disconnected);
        wait_for(&mut f.events, |e| {
            matches!(
                e,
                EngineEvent::StateChanged {
                    state: TunnelState::Reconnecting,
                    ..
                }
            )
        })
        .await;
        f.helper.update(|s| s.ikev2_status = Ikev2Status::Connected);

        let event = wait_for(&mut f.events, is_connected).await;
        assert!(matches!(
            event,
            EngineEvent::Connected {
                protocol: Protocol::Ikev2,
                ..
            }
        ));
        assert_eq!(f.helper.call_count("install_wireguard"), 1);
        assert_eq!(f.helper.call_count("start_ikev2"), 2);

        f.manager.disconnect().await.unwrap();
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_cleanup_when_idle() {
        let f = fixture(FakeHelper::new(), vec![]);

        f.manager.disconnect().await.unwrap();
        f.manager.cleanup().await.unwrap();

        let calls = f.helper.calls();
        assert!(calls.contains(&"stop_wireguard".to_string()));
        assert!(calls.contains(&"firewall_off:true".to_string()));
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_is_rejected() {
        let f = fixture(FakeHelper::new(), vec![]);

        let req = request(&[], ConnectionMode::Automatic);
        assert!(f.manager.connect(req).await.is_err());
        assert_eq!(f.manager.state().await, TunnelState::Idle);
    }
}
