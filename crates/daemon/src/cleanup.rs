// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// Tear down whatever a previous session (or a crashed daemon) left behind

use std::path::Path;

use tracing::{debug, info, warn};

use crate::helper::{HelperError, PrivilegedHelper};

/// Executables the engine may have started
#[derive(Debug, Clone)]
pub struct CleanupTargets {
    pub openvpn_executable: String,
    pub stunnel_executable: String,
    pub wstunnel_executable: String,
}

fn process_name(executable: &str) -> String {
    Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string())
}

/// Stop every protocol's platform resources and release DNS protections
///
/// Best effort: failures are logged and the remaining steps still run.
pub async fn finish_all_active_connections(helper: &dyn PrivilegedHelper, targets: &CleanupTargets) {
    info!("Finishing all active connections");

    for exe in [
        &targets.openvpn_executable,
        &targets.stunnel_executable,
        &targets.wstunnel_executable,
    ] {
        let name = process_name(exe);
        if let Err(e) = helper.kill_process(&name).await {
            warn!("Failed to kill {}: {}", name, e);
        }
    }

    match helper.stop_ikev2().await {
        Ok(()) => {}
        Err(HelperError::Unsupported(_)) => debug!("IKEv2 not available, nothing to close"),
        Err(e) => warn!("Failed to close IKEv2 connection: {}", e),
    }

    if helper.is_wireguard_service_running().await {
        info!("Stopping leftover WireGuard service");
    }
    if let Err(e) = helper.stop_wireguard().await {
        warn!("Failed to stop WireGuard: {}", e);
    }

    if let Err(e) = helper.disable_dns_leak_protection().await {
        warn!("Failed to disable DNS leak protection: {}", e);
    }
    if let Err(e) = helper.remove_hosts().await {
        warn!("Failed to remove hosts overrides: {}", e);
    }
}
