// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Linux helper backed by the standard command line tools
//!
//! The daemon runs as root, so the helper shells out directly: `wg-quick`
//! and `wg` for WireGuard, `openvpn`, `stunnel` and `wstunnel` for the
//! OpenVPN family, `resolvectl` for DNS and `nft` for the firewall.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    HelperError, HelperResult, Ikev2Params, Ikev2Status, PrivilegedHelper, TunnelWrapperKind,
    TunnelWrapperParams, WireGuardServiceState, WireGuardStatus,
};

/// Device name handed to OpenVPN so DNS and firewall rules can target it
pub const OPENVPN_DEVICE: &str = "tun-vpnengine";

const NFT_TABLE: &str = "vpn_engine";
const HOSTS_TAG: &str = "# vpn-engine";

const LAN_RANGES_V4: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];
const LAN_RANGES_V6: &[&str] = &["fe80::/10", "fc00::/7"];

/// Paths and executables used by the helper
#[derive(Debug, Clone)]
pub struct CommandHelperConfig {
    pub wg_interface: String,
    pub data_dir: PathBuf,
    pub stunnel_executable: String,
    pub wstunnel_executable: String,
    pub hosts_file: PathBuf,
}

#[derive(Debug, Default)]
struct HelperState {
    wg_config_path: Option<PathBuf>,
    /// Interface DNS leak protection was applied to
    dns_interface: Option<String>,
    tunnel_interface: Option<String>,
    prior_firewall: Option<bool>,
}

pub struct CommandHelper {
    config: CommandHelperConfig,
    state: Mutex<HelperState>,
}

impl CommandHelper {
    pub fn new(config: CommandHelperConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HelperState::default()),
        }
    }
}

/// Run a command to completion, returning stdout
async fn run(program: &str, args: &[&str]) -> HelperResult<String> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(HelperError::Execute(format!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

/// Run a command feeding `input` on stdin
async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> HelperResult<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(HelperError::Execute(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Locate an executable by name or path
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Refuse executables that are missing or writable by anyone but the owner
fn verify_executable(name: &str, protocol: &str) -> HelperResult<PathBuf> {
    let path = resolve_executable(name).ok_or_else(|| {
        warn!("Executable {} not found", name);
        HelperError::VerifyFailed(protocol.to_string())
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        if mode & 0o022 != 0 {
            warn!(
                "Executable {} is group/world writable ({:o})",
                path.display(),
                mode & 0o777
            );
            return Err(HelperError::VerifyFailed(protocol.to_string()));
        }
    }

    Ok(path)
}

/// Parse `wg show <iface> dump`
///
/// The first line describes the interface, every further line a peer:
/// `pubkey psk endpoint allowed-ips latest-handshake rx tx keepalive`.
pub fn parse_wg_dump(output: &str) -> WireGuardStatus {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    if lines.next().is_none() {
        return WireGuardStatus::inactive();
    }

    let mut status = WireGuardStatus {
        state: WireGuardServiceState::Active,
        last_handshake: None,
        bytes_received: 0,
        bytes_transmitted: 0,
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            continue;
        }

        let handshake: i64 = fields[4].parse().unwrap_or(0);
        if handshake > 0 {
            if let Some(ts) = Utc.timestamp_opt(handshake, 0).single() {
                status.last_handshake = Some(match status.last_handshake {
                    Some(prev) if prev > ts => prev,
                    _ => ts,
                });
            }
        }
        status.bytes_received += fields[5].parse::<u64>().unwrap_or(0);
        status.bytes_transmitted += fields[6].parse::<u64>().unwrap_or(0);
    }

    status
}

/// Render the kill-switch table for `nft -f -`
///
/// Everything is dropped except loopback, established flows, DHCP, the
/// tunnel interfaces, the VPN servers and (optionally) the LAN.
pub fn render_nft_ruleset(ips: &[String], allow_lan: bool, tunnel_interfaces: &[&str]) -> String {
    let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = ips
        .iter()
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .partition(|ip| ip.is_ipv4());

    let mut out_rules = vec![
        "oifname \"lo\" accept".to_string(),
        "ct state established,related accept".to_string(),
        "udp dport { 67, 68 } accept".to_string(),
    ];
    let mut in_rules = vec![
        "iifname \"lo\" accept".to_string(),
        "ct state established,related accept".to_string(),
        "udp sport { 67, 68 } accept".to_string(),
    ];

    for iface in tunnel_interfaces {
        out_rules.push(format!("oifname \"{}\" accept", iface));
        in_rules.push(format!("iifname \"{}\" accept", iface));
    }

    let join = |ips: &[IpAddr]| {
        ips.iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    if !v4.is_empty() {
        out_rules.push(format!("ip daddr {{ {} }} accept", join(&v4)));
    }
    if !v6.is_empty() {
        out_rules.push(format!("ip6 daddr {{ {} }} accept", join(&v6)));
    }

    if allow_lan {
        out_rules.push(format!("ip daddr {{ {} }} accept", LAN_RANGES_V4.join(", ")));
        out_rules.push(format!("ip6 daddr {{ {} }} accept", LAN_RANGES_V6.join(", ")));
        in_rules.push(format!("ip saddr {{ {} }} accept", LAN_RANGES_V4.join(", ")));
        in_rules.push(format!("ip6 saddr {{ {} }} accept", LAN_RANGES_V6.join(", ")));
    }

    let indent = |rules: &[String]| {
        rules
            .iter()
            .map(|r| format!("\t\t{}\n", r))
            .collect::<String>()
    };

    // Declaring the table first makes the delete valid when it does not exist yet
    format!(
        "table inet {table}\ndelete table inet {table}\ntable inet {table} {{\n\
         \tchain output {{\n\t\ttype filter hook output priority 0; policy drop;\n{out}\t}}\n\
         \tchain input {{\n\t\ttype filter hook input priority 0; policy drop;\n{inp}\t}}\n}}\n",
        table = NFT_TABLE,
        out = indent(&out_rules),
        inp = indent(&in_rules),
    )
}

/// Drop every hosts line the engine added
pub fn remove_tagged_hosts(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim_end().ends_with(HOSTS_TAG))
        .map(|line| format!("{}\n", line))
        .collect()
}

fn render_stunnel_config(params: &TunnelWrapperParams, pid_file: &Path) -> String {
    format!(
        "foreground = no\npid = {}\n\n[openvpn]\nclient = yes\naccept = 127.0.0.1:{}\nconnect = {}:{}\n",
        pid_file.display(),
        params.local_port,
        params.remote_host,
        params.remote_port
    )
}

#[async_trait]
impl PrivilegedHelper for CommandHelper {
    async fn install_wireguard(&self, config_path: &Path) -> HelperResult<()> {
        verify_executable("wg-quick", "WireGuard")?;
        verify_executable("wg", "WireGuard")?;

        let mut state = self.state.lock().await;
        state.wg_config_path = Some(config_path.to_path_buf());
        state.tunnel_interface = Some(self.config.wg_interface.clone());
        Ok(())
    }

    async fn start_wireguard_service(&self) -> HelperResult<()> {
        let path = self
            .state
            .lock()
            .await
            .wg_config_path
            .clone()
            .ok_or_else(|| HelperError::Execute("WireGuard is not installed".to_string()))?;

        let path_str = path.to_string_lossy().into_owned();
        run("wg-quick", &["up", &path_str]).await?;
        info!("WireGuard interface {} is up", self.config.wg_interface);
        Ok(())
    }

    async fn is_wireguard_service_running(&self) -> bool {
        run("wg", &["show", &self.config.wg_interface]).await.is_ok()
    }

    async fn wireguard_status(&self) -> HelperResult<WireGuardStatus> {
        match run("wg", &["show", &self.config.wg_interface, "dump"]).await {
            Ok(output) => Ok(parse_wg_dump(&output)),
            Err(HelperError::Execute(_)) => Ok(WireGuardStatus::inactive()),
            Err(e) => Err(e),
        }
    }

    async fn stop_wireguard(&self) -> HelperResult<()> {
        let path = self.state.lock().await.wg_config_path.take();

        if self.is_wireguard_service_running().await {
            match path {
                Some(path) => {
                    let path_str = path.to_string_lossy().into_owned();
                    run("wg-quick", &["down", &path_str]).await?;
                }
                None => {
                    run("ip", &["link", "delete", "dev", &self.config.wg_interface]).await?;
                }
            }
            info!("WireGuard interface {} is down", self.config.wg_interface);
        }
        Ok(())
    }

    async fn start_openvpn(
        &self,
        executable: &str,
        config_path: &Path,
        management_port: u16,
    ) -> HelperResult<()> {
        let exe = verify_executable(executable, "OpenVPN")?;
        let exe = exe.to_string_lossy().into_owned();
        let config = config_path.to_string_lossy().into_owned();
        let port = management_port.to_string();

        run(
            &exe,
            &[
                "--config",
                &config,
                "--management",
                "127.0.0.1",
                &port,
                "--management-hold",
                "--management-query-passwords",
                "--daemon",
                "vpn-engine-openvpn",
            ],
        )
        .await?;

        self.state.lock().await.tunnel_interface = Some(OPENVPN_DEVICE.to_string());
        Ok(())
    }

    async fn start_tunnel_wrapper(&self, params: &TunnelWrapperParams) -> HelperResult<()> {
        match params.kind {
            TunnelWrapperKind::Stunnel => {
                let exe = verify_executable(&self.config.stunnel_executable, "Stunnel")?;
                let conf_path = self.config.data_dir.join("stunnel.conf");
                let pid_path = self.config.data_dir.join("stunnel.pid");
                tokio::fs::create_dir_all(&self.config.data_dir).await?;
                tokio::fs::write(&conf_path, render_stunnel_config(params, &pid_path)).await?;

                let exe = exe.to_string_lossy().into_owned();
                let conf = conf_path.to_string_lossy().into_owned();
                run(&exe, &[&conf]).await?;
            }
            TunnelWrapperKind::Wstunnel => {
                let exe = verify_executable(&self.config.wstunnel_executable, "WStunnel")?;
                let local = format!("tcp://127.0.0.1:{}:127.0.0.1:1194", params.local_port);
                let remote = format!("wss://{}:{}", params.remote_host, params.remote_port);

                // wstunnel has no daemon mode; it is reaped by kill_process
                Command::new(exe)
                    .args(["client", "-L", &local, &remote])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
            }
        }

        info!(
            "{:?} forwarding 127.0.0.1:{} to {}:{}",
            params.kind, params.local_port, params.remote_host, params.remote_port
        );
        Ok(())
    }

    async fn start_ikev2(&self, _params: &Ikev2Params) -> HelperResult<()> {
        Err(HelperError::Unsupported("IKEv2".to_string()))
    }

    async fn ikev2_status(&self) -> HelperResult<Ikev2Status> {
        Ok(Ikev2Status::Disconnected)
    }

    async fn stop_ikev2(&self) -> HelperResult<()> {
        Ok(())
    }

    async fn enable_dns_leak_protection(&self) -> HelperResult<()> {
        let mut state = self.state.lock().await;
        let Some(iface) = state.tunnel_interface.clone() else {
            return Err(HelperError::Execute(
                "No tunnel interface for DNS leak protection".to_string(),
            ));
        };

        run("resolvectl", &["domain", &iface, "~."]).await?;
        run("resolvectl", &["default-route", &iface, "yes"]).await?;
        state.dns_interface = Some(iface);
        Ok(())
    }

    async fn disable_dns_leak_protection(&self) -> HelperResult<()> {
        let iface = self.state.lock().await.dns_interface.take();
        if let Some(iface) = iface {
            // The interface may already be gone together with its settings
            if let Err(e) = run("resolvectl", &["revert", &iface]).await {
                debug!("resolvectl revert {}: {}", iface, e);
            }
        }
        Ok(())
    }

    async fn remove_hosts(&self) -> HelperResult<()> {
        let path = &self.config.hosts_file;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let cleaned = remove_tagged_hosts(&content);
        if cleaned != content {
            tokio::fs::write(path, cleaned).await?;
            info!("Removed engine entries from {}", path.display());
        }
        Ok(())
    }

    async fn kill_process(&self, name: &str) -> HelperResult<()> {
        let status = Command::new("pkill")
            .args(["-x", name])
            .stdin(Stdio::null())
            .status()
            .await?;

        // pkill exits 1 when nothing matched
        match status.code() {
            Some(0) => {
                info!("Killed running {} processes", name);
                Ok(())
            }
            Some(1) => Ok(()),
            _ => Err(HelperError::Execute(format!("pkill -x {} failed: {}", name, status))),
        }
    }

    async fn firewall_on(&self, ips: &[String], allow_lan: bool) -> HelperResult<()> {
        let ruleset = render_nft_ruleset(
            ips,
            allow_lan,
            &[self.config.wg_interface.as_str(), OPENVPN_DEVICE],
        );
        run_with_stdin("nft", &["-f", "-"], &ruleset).await?;
        info!("Firewall on ({} server addresses, lan={})", ips.len(), allow_lan);
        Ok(())
    }

    async fn firewall_off(&self, restore_prior: bool) -> HelperResult<()> {
        if restore_prior && self.state.lock().await.prior_firewall == Some(true) {
            info!("Firewall was on before this session, leaving it on");
            return Ok(());
        }

        if self.firewall_actual_state().await {
            run("nft", &["delete", "table", "inet", NFT_TABLE]).await?;
            info!("Firewall off");
        }
        Ok(())
    }

    async fn firewall_actual_state(&self) -> bool {
        run("nft", &["list", "table", "inet", NFT_TABLE]).await.is_ok()
    }

    async fn set_prior_firewall_state(&self, enabled: bool) -> HelperResult<()> {
        self.state.lock().await.prior_firewall = Some(enabled);
        Ok(())
    }

    async fn prior_firewall_state(&self) -> Option<bool> {
        self.state.lock().await.prior_firewall
    }
}
