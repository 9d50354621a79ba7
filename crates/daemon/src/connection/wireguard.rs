// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! WireGuard connection
//!
//! A run installs the tunnel, writes its config, starts the service and then
//! polls three sources until cancelled or something goes wrong: the service
//! ring log, the service status and the service liveness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vpn_engine_common::{
    AdapterInfo, ConnectError, ConnectionDescriptor, Protocol, ProxySettings, WireGuardKeys,
};

use super::ring_log::RingLogReader;
use super::schedule::Schedule;
use super::wireguard_config::{self, ConfigFileGuard};
use super::worker::{RunContext, Worker};
use super::{
    connect_error, ConnectionEvent, ConnectionKind, ConnectionMessage, ProtocolConnection, RunId,
    StartOptions,
};
use crate::helper::{PrivilegedHelper, WireGuardServiceState, WireGuardStatus};

const LOG_PERIOD: Duration = Duration::from_millis(250);
const STATS_PERIOD: Duration = Duration::from_secs(5);
const LIVENESS_PERIOD: Duration = Duration::from_secs(2);

/// A peer silent this long is considered gone
pub const HANDSHAKE_STALE_SECS: i64 = 180;

#[derive(Debug, Clone)]
pub struct WireGuardSettings {
    pub interface: String,
    pub data_dir: PathBuf,
    pub automatic_timeout: Duration,
}

impl WireGuardSettings {
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.conf", self.interface))
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("log.bin")
    }
}

pub struct WireGuardConnection {
    helper: Arc<dyn PrivilegedHelper>,
    settings: WireGuardSettings,
    worker: Worker,
}

impl WireGuardConnection {
    pub fn new(
        helper: Arc<dyn PrivilegedHelper>,
        settings: WireGuardSettings,
        events: mpsc::UnboundedSender<ConnectionMessage>,
    ) -> Self {
        Self {
            helper,
            settings,
            worker: Worker::new(ConnectionKind::WireGuard, events),
        }
    }
}

#[async_trait]
impl ProtocolConnection for WireGuardConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::WireGuard
    }

    async fn start(
        &mut self,
        descriptor: ConnectionDescriptor,
        _proxy: ProxySettings,
        options: StartOptions,
    ) -> RunId {
        let helper = self.helper.clone();
        let settings = self.settings.clone();
        self.worker
            .restart(move |ctx| async move {
                let Some(keys) = options.wireguard else {
                    ctx.emit(ConnectionEvent::Error(ConnectError::ConnectionFailed {
                        protocol: Protocol::WireGuard,
                        reason: "no WireGuard keys supplied".to_string(),
                    }));
                    ctx.emit(ConnectionEvent::Disconnected);
                    return;
                };
                let run = WireGuardRun {
                    ctx,
                    helper,
                    settings,
                    descriptor,
                    keys,
                    automatic: options.automatic,
                    connected: false,
                    terminal_sent: false,
                };
                run.run().await;
            })
            .await
    }

    async fn stop(&mut self) {
        if !self.worker.cancel() && self.is_disconnected().await {
            self.worker.emit_disconnected();
        }
    }

    async fn is_disconnected(&self) -> bool {
        !self.helper.is_wireguard_service_running().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Log,
    Stats,
    Liveness,
    AutomaticTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quit {
    Cancelled,
    HandshakeStale(i64),
    ServiceStopped,
    AutomaticTimeout,
}

struct WireGuardRun {
    ctx: RunContext,
    helper: Arc<dyn PrivilegedHelper>,
    settings: WireGuardSettings,
    descriptor: ConnectionDescriptor,
    keys: WireGuardKeys,
    automatic: bool,
    connected: bool,
    terminal_sent: bool,
}

impl WireGuardRun {
    async fn run(mut self) {
        info!(
            "Connecting WireGuard to {}:{} ({})",
            self.descriptor.ip, self.descriptor.port, self.descriptor.hostname
        );

        if let Err(e) = self.helper.install_wireguard(&self.settings.config_path()).await {
            warn!("WireGuard install failed: {}", e);
            self.emit_error(connect_error(Protocol::WireGuard, &e));
            self.ctx.emit(ConnectionEvent::Disconnected);
            return;
        }

        let text = wireguard_config::render(&self.keys, &self.descriptor);
        let config = match ConfigFileGuard::write(&self.settings.config_path(), &text) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Failed to write WireGuard config: {:#}", e);
                self.emit_error(ConnectError::ConnectionFailed {
                    protocol: Protocol::WireGuard,
                    reason: format!("{:#}", e),
                });
                self.ctx.emit(ConnectionEvent::Disconnected);
                return;
            }
        };

        let mut log = RingLogReader::new(self.settings.log_path());
        let mut dns_enabled = false;
        let mut quit = Quit::Cancelled;

        let service_started = match self.helper.start_wireguard_service().await {
            Ok(()) => true,
            Err(e) => {
                warn!("WireGuard service failed to start: {}", e);
                false
            }
        };

        if service_started {
            match self.helper.enable_dns_leak_protection().await {
                Ok(()) => dns_enabled = true,
                Err(e) => warn!("Failed to enable DNS leak protection: {}", e),
            }

            quit = self.poll(&mut log).await;
            debug!("WireGuard run leaving poll loop: {:?}", quit);
            self.final_stats().await;
        }

        // Teardown runs on every path from here
        if let Err(e) = self.helper.stop_wireguard().await {
            warn!("Failed to stop WireGuard: {}", e);
        }
        log.read_final_lines();
        drop(config);
        if dns_enabled {
            if let Err(e) = self.helper.disable_dns_leak_protection().await {
                warn!("Failed to disable DNS leak protection: {}", e);
            }
        }

        if log.adapter_setup_failed() {
            self.emit_error(ConnectError::AdapterSetupFailed);
        } else if !service_started {
            self.emit_error(ConnectError::ServiceStartFailed {
                protocol: Protocol::WireGuard,
            });
        } else if !self.connected {
            match quit {
                Quit::Cancelled => {}
                Quit::HandshakeStale(seconds) => {
                    self.emit_error(ConnectError::HandshakeStale { seconds })
                }
                Quit::ServiceStopped => self.emit_error(ConnectError::ConnectionFailed {
                    protocol: Protocol::WireGuard,
                    reason: "service stopped unexpectedly".to_string(),
                }),
                // Already reported when it fired
                Quit::AutomaticTimeout => {}
            }
        }

        info!("WireGuard disconnected");
        self.ctx.emit(ConnectionEvent::Disconnected);
    }

    async fn poll(&mut self, log: &mut RingLogReader) -> Quit {
        if self.ctx.is_cancelled() {
            return Quit::Cancelled;
        }

        // Initial sample before the first tick
        if let Some(quit) = self.on_log(log).await {
            return quit;
        }
        if !self.connected {
            if let Some(quit) = self.on_stats().await {
                return quit;
            }
        }

        let mut schedule = Schedule::new();
        schedule.every(Tick::Log, LOG_PERIOD);
        schedule.every(Tick::Stats, STATS_PERIOD);
        schedule.every(Tick::Liveness, LIVENESS_PERIOD);
        if self.automatic && !self.connected {
            schedule.once(Tick::AutomaticTimeout, self.settings.automatic_timeout);
        }

        let token = self.ctx.token.clone();
        loop {
            let due = tokio::select! {
                biased;
                _ = token.cancelled() => return Quit::Cancelled,
                due = schedule.tick() => due,
            };

            for tick in due {
                let quit = match tick {
                    Tick::Log => self.on_log(log).await,
                    Tick::Stats => self.on_stats().await,
                    Tick::Liveness => self.on_liveness().await,
                    Tick::AutomaticTimeout => self.on_automatic_timeout(),
                };
                if let Some(quit) = quit {
                    return quit;
                }
                if self.connected {
                    schedule.cancel(Tick::AutomaticTimeout);
                }
            }
        }
    }

    async fn on_log(&mut self, log: &mut RingLogReader) -> Option<Quit> {
        log.read_new_lines();

        if log.tunnel_running() {
            self.mark_connected();
            if log.handshake_failed() {
                debug!("WireGuard log reports a failed handshake");
                if let Ok(status) = self.helper.wireguard_status().await {
                    return stale(&status).map(Quit::HandshakeStale);
                }
            }
        }
        None
    }

    async fn on_stats(&mut self) -> Option<Quit> {
        let status = match self.helper.wireguard_status().await {
            Ok(status) => status,
            Err(e) => {
                debug!("WireGuard status unavailable: {}", e);
                return None;
            }
        };
        if status.state != WireGuardServiceState::Active {
            return None;
        }

        if status.last_handshake.is_some() {
            self.mark_connected();
        }
        self.ctx.emit(ConnectionEvent::Statistics {
            bytes_in: status.bytes_received,
            bytes_out: status.bytes_transmitted,
        });

        stale(&status).map(|seconds| {
            warn!("WireGuard handshake is {}s old, tearing down", seconds);
            Quit::HandshakeStale(seconds)
        })
    }

    async fn on_liveness(&mut self) -> Option<Quit> {
        if self.helper.is_wireguard_service_running().await {
            None
        } else {
            warn!("WireGuard service stopped unexpectedly");
            Some(Quit::ServiceStopped)
        }
    }

    fn on_automatic_timeout(&mut self) -> Option<Quit> {
        if self.connected {
            return None;
        }
        warn!(
            "WireGuard did not connect within {:?}",
            self.settings.automatic_timeout
        );
        self.emit_error(ConnectError::AutomaticModeTimeout);
        Some(Quit::AutomaticTimeout)
    }

    async fn final_stats(&mut self) {
        if let Ok(status) = self.helper.wireguard_status().await {
            if status.state == WireGuardServiceState::Active {
                self.ctx.emit(ConnectionEvent::Statistics {
                    bytes_in: status.bytes_received,
                    bytes_out: status.bytes_transmitted,
                });
            }
        }
    }

    fn mark_connected(&mut self) {
        if self.connected || self.terminal_sent {
            return;
        }
        self.connected = true;
        self.terminal_sent = true;
        info!("WireGuard tunnel is up");
        self.ctx.emit(ConnectionEvent::Connected(AdapterInfo {
            adapter_name: self.settings.interface.clone(),
            adapter_ip: self.keys.address.clone(),
            remote_ip: self.descriptor.ip.clone(),
            dns_servers: self.keys.dns.clone(),
        }));
    }

    fn emit_error(&mut self, error: ConnectError) {
        if self.terminal_sent {
            debug!("Suppressing WireGuard error after terminal outcome: {}", error);
            return;
        }
        self.terminal_sent = true;
        self.ctx.emit(ConnectionEvent::Error(error));
    }
}

/// Seconds since the last handshake when it is past the staleness limit
fn stale(status: &WireGuardStatus) -> Option<i64> {
    if status.state != WireGuardServiceState::Active {
        return None;
    }
    let age = Utc::now() - status.last_handshake?;
    let seconds = age.num_seconds();
    (seconds >= HANDSHAKE_STALE_SECS).then_some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ring_log::tests::ring_image;
    use crate::testing::{FakeFailure, FakeHelper};
    use vpn_engine_common::ConnectionNodeType;

    struct Fixture {
        _dir: tempfile::TempDir,
        helper: Arc<FakeHelper>,
        settings: WireGuardSettings,
        connection: WireGuardConnection,
        rx: mpsc::UnboundedReceiver<ConnectionMessage>,
    }

    fn fixture(helper: FakeHelper) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let helper = Arc::new(helper);
        let settings = WireGuardSettings {
            interface: "wg-test".to_string(),
            data_dir: dir.path().to_path_buf(),
            automatic_timeout: Duration::from_secs(20),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = WireGuardConnection::new(helper.clone(), settings.clone(), tx);
        Fixture {
            _dir: dir,
            helper,
            settings,
            connection,
            rx,
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            node_type: ConnectionNodeType::Default,
            protocol: Protocol::WireGuard,
            port: 51820,
            ip: "198.51.100.7".to_string(),
            hostname: "nl-1.example.net".to_string(),
            dns_host_name: "nl.example.net".to_string(),
            wg_peer_public_key: "PEER=".to_string(),
            verify_x509_name: String::new(),
            username: None,
            password: None,
            static_ip_ports: vec![],
        }
    }

    fn options(automatic: bool) -> StartOptions {
        StartOptions {
            automatic,
            wireguard: Some(WireGuardKeys {
                private_key: "KEY=".to_string(),
                address: "100.64.0.2/32".to_string(),
                dns: vec!["10.255.255.1".to_string()],
                preshared_key: None,
            }),
            credentials: None,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectionMessage>) -> ConnectionEvent {
        loop {
            let msg = rx.recv().await.unwrap();
            if !matches!(msg.event, ConnectionEvent::Statistics { .. }) {
                return msg.event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_handshake_and_stops_cleanly() {
        let mut f = fixture(FakeHelper::new());
        let run = f
            .connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;
        assert_eq!(run.kind, ConnectionKind::WireGuard);

        match next(&mut f.rx).await {
            ConnectionEvent::Connected(adapter) => {
                assert_eq!(adapter.adapter_name, "wg-test");
                assert_eq!(adapter.remote_ip, "198.51.100.7");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.settings.config_path().exists());

        f.connection.stop().await;
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);

        let calls = f.helper.calls();
        assert_eq!(
            calls,
            vec![
                "install_wireguard",
                "start_wireguard_service",
                "enable_dns",
                "stop_wireguard",
                "disable_dns"
            ]
        );
        assert!(!f.settings.config_path().exists());
        assert!(f.connection.is_disconnected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_from_ring_log() {
        let mut f = fixture(FakeHelper::with(|s| s.handshake_age_secs = None));
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(
            f.settings.log_path(),
            ring_image(0, &["[TUN] [wg-test] Startup complete"]),
        )
        .unwrap();

        assert!(matches!(next(&mut f.rx).await, ConnectionEvent::Connected(_)));
        f.connection.stop().await;
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_timeout_fires_once() {
        let mut f = fixture(FakeHelper::with(|s| s.handshake_age_secs = None));
        let started = tokio::time::Instant::now();
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;

        assert_eq!(
            next(&mut f.rx).await,
            ConnectionEvent::Error(ConnectError::AutomaticModeTimeout)
        );
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
        assert_eq!(f.helper.call_count("stop_wireguard"), 1);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_has_no_timeout() {
        let mut f = fixture(FakeHelper::with(|s| s.handshake_age_secs = None));
        f.connection
            .start(descriptor(), ProxySettings::default(), options(false))
            .await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(msg) = f.rx.try_recv() {
            assert!(matches!(msg.event, ConnectionEvent::Statistics { .. }));
        }

        f.connection.stop().await;
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handshake_tears_down() {
        let mut f = fixture(FakeHelper::new());
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;
        assert!(matches!(next(&mut f.rx).await, ConnectionEvent::Connected(_)));

        f.helper.update(|s| s.handshake_age_secs = Some(HANDSHAKE_STALE_SECS));
        // Connected runs do not report staleness as an error
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
        assert_eq!(f.helper.call_count("stop_wireguard"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_loss_tears_down() {
        let mut f = fixture(FakeHelper::new());
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;
        assert!(matches!(next(&mut f.rx).await, ConnectionEvent::Connected(_)));

        f.helper.update(|s| s.wg_running = false);
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_verify_failure() {
        let mut f = fixture(FakeHelper::with(|s| s.install_failure = Some(FakeFailure::Verify)));
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;

        let event = next(&mut f.rx).await;
        match &event {
            ConnectionEvent::Error(e) => assert!(e.is_fatal_for_protocol()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
        assert!(!f.settings.config_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_start_failure_is_deferred_error() {
        let mut f = fixture(FakeHelper::with(|s| {
            s.service_start_failure = Some(FakeFailure::Execute)
        }));
        f.connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;

        assert_eq!(
            next(&mut f.rx).await,
            ConnectionEvent::Error(ConnectError::ServiceStartFailed {
                protocol: Protocol::WireGuard
            })
        );
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
        // Service is still stopped, config still removed
        assert_eq!(f.helper.call_count("stop_wireguard"), 1);
        assert_eq!(f.helper.call_count("enable_dns"), 0);
        assert!(!f.settings.config_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_failure_wins_over_timeout() {
        let mut f = fixture(FakeHelper::with(|s| {
            s.handshake_age_secs = None;
            s.wg_running = true;
        }));
        // Pre-existing line is ignored, the new one is reported
        std::fs::write(f.settings.log_path(), ring_image(0, &["old"])).unwrap();
        f.connection
            .start(descriptor(), ProxySettings::default(), options(false))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(
            f.settings.log_path(),
            ring_image(0, &["old", "[TUN] Failed to setup adapter (problem code: 0x38)"]),
        )
        .unwrap();
        f.helper.update(|s| s.wg_running = false);

        assert_eq!(
            next(&mut f.rx).await,
            ConnectionEvent::Error(ConnectError::AdapterSetupFailed)
        );
        assert_eq!(next(&mut f.rx).await, ConnectionEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_reports_disconnected() {
        let mut f = fixture(FakeHelper::new());
        f.connection.stop().await;
        let msg = f.rx.recv().await.unwrap();
        assert_eq!(msg.event, ConnectionEvent::Disconnected);
        assert_eq!(msg.run.generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_tears_down_previous_run_first() {
        let mut f = fixture(FakeHelper::new());
        let first = f
            .connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;
        assert!(matches!(next(&mut f.rx).await, ConnectionEvent::Connected(_)));

        let second = f
            .connection
            .start(descriptor(), ProxySettings::default(), options(true))
            .await;
        assert_eq!(second.generation, first.generation + 1);

        let mut saw_first_disconnect = false;
        loop {
            let msg = f.rx.recv().await.unwrap();
            match msg.event {
                ConnectionEvent::Disconnected => {
                    assert_eq!(msg.run, first);
                    saw_first_disconnect = true;
                }
                ConnectionEvent::Connected(_) => {
                    assert_eq!(msg.run, second);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_first_disconnect);
    }

    #[test]
    fn test_stale_threshold() {
        let mut status = WireGuardStatus {
            state: WireGuardServiceState::Active,
            last_handshake: Some(Utc::now() - chrono::Duration::seconds(179)),
            bytes_received: 0,
            bytes_transmitted: 0,
        };
        assert!(stale(&status).is_none());

        status.last_handshake = Some(Utc::now() - chrono::Duration::seconds(181));
        assert!(stale(&status).unwrap() >= 180);

        status.state = WireGuardServiceState::Starting;
        assert!(stale(&status).is_none());
    }
}
