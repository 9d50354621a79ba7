// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! OpenVPN connection (UDP, TCP, and TCP behind stunnel or wstunnel)
//!
//! OpenVPN is started through the helper with its management interface on
//! loopback and held until we attach. Everything after that (credentials,
//! state changes, byte counts) goes through the management socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use vpn_engine_common::{
    AdapterInfo, ConnectError, ConnectionDescriptor, Credentials, Protocol, ProxySettings,
};

use super::schedule::Schedule;
use super::wireguard_config::ConfigFileGuard;
use super::worker::{RunContext, Worker};
use super::{
    connect_error, ConnectionEvent, ConnectionKind, ConnectionMessage, ProtocolConnection, RunId,
    StartOptions,
};
use crate::helper::linux::OPENVPN_DEVICE;
use crate::helper::{PrivilegedHelper, TunnelWrapperKind, TunnelWrapperParams};

const MANAGEMENT_CONNECT_ATTEMPTS: u32 = 50;
const MANAGEMENT_CONNECT_DELAY: Duration = Duration::from_millis(200);
const MAX_LINE_LENGTH: usize = 64 * 1024;

const DEFAULT_TEMPLATE: &str = "\
client
nobind
persist-key
persist-tun
remote-cert-tls server
auth-retry none
verb 3
";

#[derive(Debug, Clone)]
pub struct OpenVpnSettings {
    pub executable: String,
    pub config_template: Option<PathBuf>,
    pub management_port: Option<u16>,
    pub data_dir: PathBuf,
    pub automatic_timeout: Duration,
    pub stunnel_executable: String,
    pub wstunnel_executable: String,
}

impl OpenVpnSettings {
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("openvpn.ovpn")
    }
}

/// One line from the management interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementMessage {
    State {
        name: String,
        local_ip: String,
        remote_ip: String,
    },
    ByteCount {
        bytes_in: u64,
        bytes_out: u64,
    },
    NeedPassword,
    PasswordFailed,
    Hold,
    Fatal(String),
    Log(String),
    Other(String),
}

pub fn parse_management_line(line: &str) -> ManagementMessage {
    let line = line.trim_end_matches('\r');

    if let Some(rest) = line.strip_prefix(">STATE:") {
        let fields: Vec<&str> = rest.split(',').collect();
        let field = |i: usize| fields.get(i).map(|s| s.to_string()).unwrap_or_default();
        return ManagementMessage::State {
            name: field(1),
            local_ip: field(3),
            remote_ip: field(4),
        };
    }

    if let Some(rest) = line.strip_prefix(">BYTECOUNT:") {
        if let Some((bytes_in, bytes_out)) = rest.split_once(',') {
            if let (Ok(bytes_in), Ok(bytes_out)) =
                (bytes_in.trim().parse(), bytes_out.trim().parse())
            {
                return ManagementMessage::ByteCount {
                    bytes_in,
                    bytes_out,
                };
            }
        }
        return ManagementMessage::Other(line.to_string());
    }

    if let Some(rest) = line.strip_prefix(">PASSWORD:") {
        if rest.starts_with("Need 'Auth'") {
            return ManagementMessage::NeedPassword;
        }
        if rest.starts_with("Verification Failed") {
            return ManagementMessage::PasswordFailed;
        }
        return ManagementMessage::Other(line.to_string());
    }

    if line.starts_with(">HOLD:") {
        return ManagementMessage::Hold;
    }
    if let Some(rest) = line.strip_prefix(">FATAL:") {
        return ManagementMessage::Fatal(rest.to_string());
    }
    if let Some(rest) = line.strip_prefix(">LOG:") {
        return ManagementMessage::Log(rest.to_string());
    }

    ManagementMessage::Other(line.to_string())
}

/// Quote a value for a management command
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Append connection-specific directives to the base template
pub fn render_config(
    template: &str,
    protocol: Protocol,
    remote: (&str, u16),
    verify_x509_name: &str,
    proxy: &ProxySettings,
) -> String {
    let mut out = String::from(template);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }

    out.push_str(&format!("dev {}\n", OPENVPN_DEVICE));
    out.push_str("dev-type tun\n");
    let proto = if protocol.is_udp() { "udp" } else { "tcp-client" };
    out.push_str(&format!("proto {}\n", proto));
    out.push_str(&format!("remote {} {}\n", remote.0, remote.1));
    if !verify_x509_name.is_empty() {
        out.push_str(&format!("verify-x509-name {} name\n", verify_x509_name));
    }
    if proxy.is_active() && !protocol.is_udp() {
        out.push_str(&format!("http-proxy {} {}\n", proxy.host, proxy.port));
    }
    out.push_str("auth-user-pass\n");
    out
}

async fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to reserve a loopback port")?;
    Ok(listener.local_addr()?.port())
}

fn executable_name(executable: &str) -> String {
    Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string())
}

pub struct OpenVpnConnection {
    helper: Arc<dyn PrivilegedHelper>,
    settings: OpenVpnSettings,
    worker: Worker,
}

impl OpenVpnConnection {
    pub fn new(
        helper: Arc<dyn PrivilegedHelper>,
        settings: OpenVpnSettings,
        events: mpsc::UnboundedSender<ConnectionMessage>,
    ) -> Self {
        Self {
            helper,
            settings,
            worker: Worker::new(ConnectionKind::OpenVpn, events),
        }
    }
}

#[async_trait]
impl ProtocolConnection for OpenVpnConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::OpenVpn
    }

    async fn start(
        &mut self,
        descriptor: ConnectionDescriptor,
        proxy: ProxySettings,
        options: StartOptions,
    ) -> RunId {
        let credentials = match (&descriptor.username, &descriptor.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => options.credentials.clone(),
        };
        let run = OpenVpnRun {
            helper: self.helper.clone(),
            settings: self.settings.clone(),
            protocol: descriptor.protocol,
            descriptor,
            proxy,
            credentials,
            automatic: options.automatic,
            connected: false,
            terminal_sent: false,
        };
        self.worker.restart(move |ctx| run.run(ctx)).await
    }

    async fn stop(&mut self) {
        if !self.worker.cancel() && self.is_disconnected().await {
            self.worker.emit_disconnected();
        }
    }

    async fn is_disconnected(&self) -> bool {
        !self.worker.is_running()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    AutomaticTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Quit {
    Cancelled,
    Exited,
    Reconnecting,
    Fatal(String),
    AuthFailed,
    AutomaticTimeout,
}

type Management = Framed<TcpStream, LinesCodec>;

struct OpenVpnRun {
    helper: Arc<dyn PrivilegedHelper>,
    settings: OpenVpnSettings,
    protocol: Protocol,
    descriptor: ConnectionDescriptor,
    proxy: ProxySettings,
    credentials: Option<Credentials>,
    automatic: bool,
    connected: bool,
    terminal_sent: bool,
}

impl OpenVpnRun {
    async fn run(mut self, ctx: RunContext) {
        info!(
            "Connecting {} to {}:{} ({})",
            self.protocol, self.descriptor.ip, self.descriptor.port, self.descriptor.hostname
        );

        let wrapper = match self.protocol {
            Protocol::Stunnel => Some(TunnelWrapperKind::Stunnel),
            Protocol::Wstunnel => Some(TunnelWrapperKind::Wstunnel),
            _ => None,
        };

        let mut quit = Quit::Cancelled;
        let mut dns_enabled = false;
        let mut management: Option<Management> = None;
        let mut config: Option<ConfigFileGuard> = None;
        let mut management_port = None;

        match self.bring_up(wrapper).await {
            Ok((guard, port)) => {
                config = Some(guard);
                management_port = Some(port);
            }
            Err(error) => self.emit_error(&ctx, error),
        }

        if let Some(port) = management_port.filter(|_| !ctx.is_cancelled()) {
            match self.attach(&ctx, port).await {
                Ok(Some(mgmt)) => management = Some(mgmt),
                Ok(None) => {}
                Err(e) => {
                    warn!("OpenVPN management interface unreachable: {:#}", e);
                    self.emit_error(
                        &ctx,
                        ConnectError::ConnectionFailed {
                            protocol: self.protocol,
                            reason: format!("{:#}", e),
                        },
                    );
                }
            }
        }

        if let Some(mgmt) = management.as_mut() {
            quit = self.session(&ctx, mgmt, &mut dns_enabled).await;
            debug!("OpenVPN run leaving session: {:?}", quit);
        }

        // Teardown runs on every path from here
        if let Some(mut mgmt) = management.take() {
            if let Err(e) = mgmt.send("signal SIGTERM").await {
                debug!("Failed to signal OpenVPN: {}", e);
            }
        }
        let openvpn = executable_name(&self.settings.executable);
        if let Err(e) = self.helper.kill_process(&openvpn).await {
            warn!("Failed to stop {}: {}", openvpn, e);
        }
        if let Some(kind) = wrapper {
            let exe = match kind {
                TunnelWrapperKind::Stunnel => &self.settings.stunnel_executable,
                TunnelWrapperKind::Wstunnel => &self.settings.wstunnel_executable,
            };
            let name = executable_name(exe);
            if let Err(e) = self.helper.kill_process(&name).await {
                warn!("Failed to stop {}: {}", name, e);
            }
        }
        drop(config);
        if dns_enabled {
            if let Err(e) = self.helper.disable_dns_leak_protection().await {
                warn!("Failed to disable DNS leak protection: {}", e);
            }
        }

        if !self.connected {
            let error = match quit {
                Quit::Cancelled | Quit::AutomaticTimeout => None,
                Quit::AuthFailed => Some(ConnectError::AuthFailed),
                Quit::Fatal(reason) => Some(ConnectError::ConnectionFailed {
                    protocol: self.protocol,
                    reason,
                }),
                Quit::Exited | Quit::Reconnecting => Some(ConnectError::ConnectionFailed {
                    protocol: self.protocol,
                    reason: "OpenVPN exited before connecting".to_string(),
                }),
            };
            if let Some(error) = error {
                self.emit_error(&ctx, error);
            }
        }

        info!("{} disconnected", self.protocol);
        ctx.emit(ConnectionEvent::Disconnected);
    }

    /// Start the wrapper (if any), write the config and start OpenVPN
    async fn bring_up(
        &self,
        wrapper: Option<TunnelWrapperKind>,
    ) -> std::result::Result<(ConfigFileGuard, u16), ConnectError> {
        let failed = |reason: String| ConnectError::ConnectionFailed {
            protocol: self.protocol,
            reason,
        };

        let mut remote_host = self.descriptor.ip.clone();
        let mut remote_port = self.descriptor.port;
        if let Some(kind) = wrapper {
            let local_port = free_local_port().await.map_err(|e| failed(format!("{:#}", e)))?;
            let params = TunnelWrapperParams {
                kind,
                remote_host: self.descriptor.ip.clone(),
                remote_port: self.descriptor.port,
                local_port,
            };
            self.helper
                .start_tunnel_wrapper(&params)
                .await
                .map_err(|e| connect_error(self.protocol, &e))?;
            remote_host = "127.0.0.1".to_string();
            remote_port = local_port;
        }

        let template = match &self.settings.config_template {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                failed(format!("Failed to read template {}: {}", path.display(), e))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        let text = render_config(
            &template,
            self.protocol,
            (&remote_host, remote_port),
            &self.descriptor.verify_x509_name,
            &self.proxy,
        );
        let guard = ConfigFileGuard::write(&self.settings.config_path(), &text)
            .map_err(|e| failed(format!("{:#}", e)))?;

        let port = match self.settings.management_port {
            Some(port) => port,
            None => free_local_port().await.map_err(|e| failed(format!("{:#}", e)))?,
        };
        self.helper
            .start_openvpn(&self.settings.executable, guard.path(), port)
            .await
            .map_err(|e| connect_error(self.protocol, &e))?;

        Ok((guard, port))
    }

    /// Connect to the management interface; None when cancelled first
    async fn attach(&self, ctx: &RunContext, port: u16) -> Result<Option<Management>> {
        let mut last_error = None;
        for _ in 0..MANAGEMENT_CONNECT_ATTEMPTS {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    debug!("Attached to OpenVPN management on port {}", port);
                    let mut mgmt =
                        Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
                    for command in ["state on", "bytecount 5", "hold release"] {
                        mgmt.send(command).await?;
                    }
                    return Ok(Some(mgmt));
                }
                Err(e) => last_error = Some(e),
            }
            tokio::select! {
                _ = ctx.token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(MANAGEMENT_CONNECT_DELAY) => {}
            }
        }

        Err(anyhow::anyhow!(
            "no management connection on port {}: {}",
            port,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn session(
        &mut self,
        ctx: &RunContext,
        mgmt: &mut Management,
        dns_enabled: &mut bool,
    ) -> Quit {
        let mut schedule = Schedule::new();
        if self.automatic {
            schedule.once(Tick::AutomaticTimeout, self.settings.automatic_timeout);
        }

        loop {
            let line = tokio::select! {
                biased;
                _ = ctx.token.cancelled() => return Quit::Cancelled,
                due = schedule.tick() => {
                    if due.contains(&Tick::AutomaticTimeout) && !self.connected {
                        warn!(
                            "{} did not connect within {:?}",
                            self.protocol, self.settings.automatic_timeout
                        );
                        self.emit_error(ctx, ConnectError::AutomaticModeTimeout);
                        return Quit::AutomaticTimeout;
                    }
                    continue;
                }
                line = mgmt.next() => line,
            };

            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!("OpenVPN management read failed: {}", e);
                    return Quit::Exited;
                }
                None => {
                    info!("OpenVPN management interface closed");
                    return Quit::Exited;
                }
            };

            match parse_management_line(&line) {
                ManagementMessage::State {
                    name,
                    local_ip,
                    remote_ip,
                } => {
                    debug!(target: "openvpn", "state {}", name);
                    match name.as_str() {
                        "CONNECTED" if !self.connected => {
                            self.connected = true;
                            self.terminal_sent = true;
                            schedule.cancel(Tick::AutomaticTimeout);
                            match self.helper.enable_dns_leak_protection().await {
                                Ok(()) => *dns_enabled = true,
                                Err(e) => warn!("Failed to enable DNS leak protection: {}", e),
                            }
                            info!("{} tunnel is up ({})", self.protocol, local_ip);
                            ctx.emit(ConnectionEvent::Connected(AdapterInfo {
                                adapter_name: OPENVPN_DEVICE.to_string(),
                                adapter_ip: local_ip,
                                remote_ip,
                                dns_servers: Vec::new(),
                            }));
                        }
                        "RECONNECTING" if self.connected => return Quit::Reconnecting,
                        "EXITING" => return Quit::Exited,
                        _ => {}
                    }
                }
                ManagementMessage::ByteCount {
                    bytes_in,
                    bytes_out,
                } => ctx.emit(ConnectionEvent::Statistics {
                    bytes_in,
                    bytes_out,
                }),
                ManagementMessage::NeedPassword => {
                    let Some(creds) = self.credentials.clone() else {
                        warn!("OpenVPN asked for credentials but none were supplied");
                        return Quit::AuthFailed;
                    };
                    let username = format!("username \"Auth\" {}", quote(&creds.username));
                    let password = format!("password \"Auth\" {}", quote(&creds.password));
                    if mgmt.send(username).await.is_err() || mgmt.send(password).await.is_err() {
                        return Quit::Exited;
                    }
                }
                ManagementMessage::PasswordFailed => {
                    warn!("OpenVPN authentication failed");
                    return Quit::AuthFailed;
                }
                ManagementMessage::Hold => {
                    if mgmt.send("hold release").await.is_err() {
                        return Quit::Exited;
                    }
                }
                ManagementMessage::Fatal(reason) => {
                    warn!("OpenVPN fatal error: {}", reason);
                    return Quit::Fatal(reason);
                }
                ManagementMessage::Log(text) => debug!(target: "openvpn", "{}", text),
                ManagementMessage::Other(text) => debug!(target: "openvpn", "{}", text),
            }
        }
    }

    fn emit_error(&mut self, ctx: &RunContext, error: ConnectError) {
        if self.terminal_sent {
            return;
        }
        self.terminal_sent = true;
        ctx.emit(ConnectionEvent::Error(error));
    }
}
