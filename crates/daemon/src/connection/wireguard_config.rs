// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// WireGuard tunnel config file rendering

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use vpn_engine_common::{ConnectionDescriptor, WireGuardKeys};

use crate::permissions::write_private_file;

/// Render the `[Interface]` / `[Peer]` sections for one descriptor
pub fn render(keys: &WireGuardKeys, descriptor: &ConnectionDescriptor) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", keys.private_key));
    out.push_str(&format!("Address = {}\n", keys.address));
    if !keys.dns.is_empty() {
        out.push_str(&format!("DNS = {}\n", keys.dns.join(", ")));
    }

    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", descriptor.wg_peer_public_key));
    if let Some(psk) = &keys.preshared_key {
        out.push_str(&format!("PresharedKey = {}\n", psk));
    }
    out.push_str("AllowedIPs = 0.0.0.0/0, ::/0\n");
    out.push_str(&format!("Endpoint = {}\n", endpoint(&descriptor.ip, descriptor.port)));
    out.push_str("PersistentKeepalive = 25\n");
    out
}

fn endpoint(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// Generated config file, removed on drop
#[derive(Debug)]
pub struct ConfigFileGuard {
    path: PathBuf,
}

impl ConfigFileGuard {
    /// Write `contents` to `path` readable only by the owner
    pub fn write(path: &Path, contents: &str) -> Result<Self> {
        write_private_file(path, contents)?;
        debug!("Wrote tunnel config {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed tunnel config {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpn_engine_common::{ConnectionNodeType, Protocol};

    fn descriptor(ip: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            node_type: ConnectionNodeType::Default,
            protocol: Protocol::WireGuard,
            port: 51820,
            ip: ip.to_string(),
            hostname: "nl-1.example.net".to_string(),
            dns_host_name: "nl.example.net".to_string(),
            wg_peer_public_key: "PEERKEY=".to_string(),
            verify_x509_name: String::new(),
            username: None,
            password: None,
            static_ip_ports: vec![],
        }
    }

    fn keys() -> WireGuardKeys {
        WireGuardKeys {
            private_key: "PRIVATEKEY=".to_string(),
            address: "100.64.0.2/32".to_string(),
            dns: vec!["10.255.255.1".to_string()],
            preshared_key: None,
        }
    }

    #[test]
    fn test_render_config() {
        let text = render(&keys(), &descriptor("198.51.100.7"));
        assert!(text.starts_with("[Interface]\nPrivateKey = PRIVATEKEY=\n"));
        assert!(text.contains("DNS = 10.255.255.1\n"));
        assert!(text.contains("PublicKey = PEERKEY=\n"));
        assert!(text.contains("Endpoint = 198.51.100.7:51820\n"));
        assert!(!text.contains("PresharedKey"));
    }

    #[test]
    fn test_ipv6_endpoint_is_bracketed() {
        let mut k = keys();
        k.preshared_key = Some("PSK=".to_string());
        let text = render(&k, &descriptor("2001:db8::7"));
        assert!(text.contains("Endpoint = [2001:db8::7]:51820\n"));
        assert!(text.contains("PresharedKey = PSK=\n"));
    }

    #[test]
    fn test_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-test.conf");
        {
            let guard = ConfigFileGuard::write(&path, "[Interface]\n").unwrap();
            assert!(guard.path().exists());
        }
        assert!(!path.exists());
    }
}
