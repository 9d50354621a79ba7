// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// IKEv2 connection, driven entirely through the helper

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vpn_engine_common::{AdapterInfo, ConnectError, ConnectionDescriptor, Protocol, ProxySettings};

use super::schedule::Schedule;
use super::worker::{RunContext, Worker};
use super::{
    connect_error, ConnectionEvent, ConnectionKind, ConnectionMessage, ProtocolConnection, RunId,
    StartOptions,
};
use crate::helper::{Ikev2Params, Ikev2Status, PrivilegedHelper};

const STATUS_PERIOD: Duration = Duration::from_millis(500);

pub struct Ikev2Connection {
    helper: Arc<dyn PrivilegedHelper>,
    automatic_timeout: Duration,
    worker: Worker,
}

impl Ikev2Connection {
    pub fn new(
        helper: Arc<dyn PrivilegedHelper>,
        automatic_timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionMessage>,
    ) -> Self {
        Self {
            helper,
            automatic_timeout,
            worker: Worker::new(ConnectionKind::Ikev2, events),
        }
    }
}

#[async_trait]
impl ProtocolConnection for Ikev2Connection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ikev2
    }

    async fn start(
        &mut self,
        descriptor: ConnectionDescriptor,
        _proxy: ProxySettings,
        options: StartOptions,
    ) -> RunId {
        let (username, password) = match (&descriptor.username, &descriptor.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => options
                .credentials
                .as_ref()
                .map(|c| (c.username.clone(), c.password.clone()))
                .unwrap_or_default(),
        };
        let params = Ikev2Params {
            server_ip: descriptor.ip.clone(),
            remote_id: descriptor.hostname.clone(),
            username,
            password,
        };
        let helper = self.helper.clone();
        let timeout = options.automatic.then_some(self.automatic_timeout);

        self.worker
            .restart(move |ctx| run(ctx, helper, params, timeout))
            .await
    }

    async fn stop(&mut self) {
        if !self.worker.cancel() && self.is_disconnected().await {
            self.worker.emit_disconnected();
        }
    }

    async fn is_disconnected(&self) -> bool {
        matches!(
            self.helper.ikev2_status().await,
            Ok(Ikev2Status::Disconnected) | Ok(Ikev2Status::Failed(_)) | Err(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Status,
    AutomaticTimeout,
}

async fn run(
    ctx: RunContext,
    helper: Arc<dyn PrivilegedHelper>,
    params: Ikev2Params,
    automatic_timeout: Option<Duration>,
) {
    info!("Connecting IKEv2 to {} ({})", params.server_ip, params.remote_id);

    let mut connected = false;
    let mut dns_enabled = false;

    match helper.start_ikev2(&params).await {
        Ok(()) => {
            let mut schedule = Schedule::new();
            schedule.every(Tick::Status, STATUS_PERIOD);
            if let Some(timeout) = automatic_timeout {
                schedule.once(Tick::AutomaticTimeout, timeout);
            }

            'poll: loop {
                let due = tokio::select! {
                    biased;
                    _ = ctx.token.cancelled() => break,
                    due = schedule.tick() => due,
                };

                for tick in due {
                    match tick {
                        Tick::Status => match helper.ikev2_status().await {
                            Ok(Ikev2Status::Connected) if !connected => {
                                connected = true;
                                schedule.cancel(Tick::AutomaticTimeout);
                                match helper.enable_dns_leak_protection().await {
                                    Ok(()) => dns_enabled = true,
                                    Err(e) => warn!("Failed to enable DNS leak protection: {}", e),
                                }
                                info!("IKEv2 tunnel is up");
                                ctx.emit(ConnectionEvent::Connected(AdapterInfo {
                                    adapter_name: "ikev2".to_string(),
                                    adapter_ip: String::new(),
                                    remote_ip: params.server_ip.clone(),
                                    dns_servers: Vec::new(),
                                }));
                            }
                            Ok(Ikev2Status::Failed(reason)) => {
                                warn!("IKEv2 failed: {}", reason);
                                if !connected {
                                    ctx.emit(ConnectionEvent::Error(
                                        ConnectError::ConnectionFailed {
                                            protocol: Protocol::Ikev2,
                                            reason,
                                        },
                                    ));
                                }
                                break 'poll;
                            }
                            Ok(Ikev2Status::Disconnected) if connected => {
                                info!("IKEv2 tunnel dropped");
                                break 'poll;
                            }
                            Ok(_) => {}
                            Err(e) => debug!("IKEv2 status unavailable: {}", e),
                        },
                        Tick::AutomaticTimeout => {
                            warn!("IKEv2 did not connect within the automatic timeout");
                            ctx.emit(ConnectionEvent::Error(ConnectError::AutomaticModeTimeout));
                            break 'poll;
                        }
                    }
                }
            }
        }
        Err(e) => {
            warn!("IKEv2 start failed: {}", e);
            ctx.emit(ConnectionEvent::Error(connect_error(Protocol::Ikev2, &e)));
        }
    }

    if let Err(e) = helper.stop_ikev2().await {
        warn!("Failed to stop IKEv2: {}", e);
    }
    if dns_enabled {
        if let Err(e) = helper.disable_dns_leak_protection().await {
            warn!("Failed to disable DNS leak protection: {}", e);
        }
    }
    if let Err(e) = helper.remove_hosts().await {
        warn!("Failed to remove hosts overrides: {}", e);
    }

    info!("IKEv2 disconnected");
    ctx.emit(ConnectionEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFailure, FakeHelper};
    use vpn_engine_common::{ConnectionNodeType, Credentials};

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            node_type: ConnectionNodeType::Default,
            protocol: Protocol::Ikev2,
            port: 500,
            ip: "198.51.100.7".to_string(),
            hostname: "nl-1.example.net".to_string(),
            dns_host_name: "nl.example.net".to_string(),
            wg_peer_public_key: String::new(),
            verify_x509_name: String::new(),
            username: None,
            password: None,
            static_ip_ports: vec![],
        }
    }

    fn options() -> StartOptions {
        StartOptions {
            automatic: true,
            wireguard: None,
            credentials: Some(Credentials {
                username: "user".to_string(),
                password: "secret".to_string(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_stop() {
        let helper = Arc::new(FakeHelper::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Ikev2Connection::new(helper.clone(), Duration::from_secs(20), tx);

        connection
            .start(descriptor(), ProxySettings::default(), options())
            .await;
        assert!(matches!(
            rx.recv().await.unwrap().event,
            ConnectionEvent::Connected(_)
        ));

        connection.stop().await;
        assert_eq!(rx.recv().await.unwrap().event, ConnectionEvent::Disconnected);
        assert_eq!(
            helper.calls(),
            vec![
                "start_ikev2",
                "enable_dns",
                "stop_ikev2",
                "disable_dns",
                "remove_hosts"
            ]
        );
        assert!(connection.is_disconnected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_platform() {
        let helper = Arc::new(FakeHelper::with(|s| s.ikev2_failure = Some(FakeFailure::Unsupported)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Ikev2Connection::new(helper, Duration::from_secs(20), tx);

        connection
            .start(descriptor(), ProxySettings::default(), options())
            .await;
        assert_eq!(
            rx.recv().await.unwrap().event,
            ConnectionEvent::Error(ConnectError::Unsupported {
                protocol: Protocol::Ikev2
            })
        );
        assert_eq!(rx.recv().await.unwrap().event, ConnectionEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_timeout() {
        let helper = Arc::new(FakeHelper::with(|s| s.ikev2_status = Ikev2Status::Connecting));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = Ikev2Connection::new(helper, Duration::from_secs(5), tx);

        connection
            .start(descriptor(), ProxySettings::default(), options())
            .await;
        assert_eq!(
            rx.recv().await.unwrap().event,
            ConnectionEvent::Error(ConnectError::AutomaticModeTimeout)
        );
        assert_eq!(rx.recv().await.unwrap().event, ConnectionEvent::Disconnected);
    }
}
