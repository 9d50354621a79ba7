// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Firewall controller
//!
//! Tracks the ruleset the engine wants and applies it through the helper
//! only when it differs from what is in place. A single lock covers both the
//! tracked state and the helper calls.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::helper::{HelperResult, PrivilegedHelper};

#[derive(Debug, Default)]
struct FirewallState {
    enabled: bool,
    ips: Vec<String>,
    allow_lan: bool,
    prior_recorded: bool,
}

#[derive(Clone)]
pub struct FirewallController {
    helper: Arc<dyn PrivilegedHelper>,
    state: Arc<Mutex<FirewallState>>,
}

impl FirewallController {
    pub fn new(helper: Arc<dyn PrivilegedHelper>) -> Self {
        Self {
            helper,
            state: Arc::new(Mutex::new(FirewallState::default())),
        }
    }

    /// Allow only `ips` (plus LAN when asked) outside the tunnel
    pub async fn firewall_on(&self, ips: &[String], allow_lan: bool) -> HelperResult<()> {
        let mut state = self.state.lock().await;

        if !state.prior_recorded {
            if self.helper.prior_firewall_state().await.is_none() {
                let prior = self.helper.firewall_actual_state().await;
                debug!("Firewall was {} before the engine touched it", on_off(prior));
                self.helper.set_prior_firewall_state(prior).await?;
            }
            state.prior_recorded = true;
        }

        let mut ips = ips.to_vec();
        ips.sort();
        ips.dedup();

        if state.enabled
            && state.ips == ips
            && state.allow_lan == allow_lan
            && self.helper.firewall_actual_state().await
        {
            debug!("Firewall already on with the requested rules");
            return Ok(());
        }

        self.helper.firewall_on(&ips, allow_lan).await?;
        info!("Firewall on ({} allowed addresses, LAN {})", ips.len(), on_off(allow_lan));

        state.enabled = true;
        state.ips = ips;
        state.allow_lan = allow_lan;
        Ok(())
    }

    /// Remove the engine's rules, leaving a pre-existing firewall in place
    pub async fn firewall_off(&self) -> HelperResult<()> {
        let mut state = self.state.lock().await;
        self.helper.firewall_off(true).await?;
        if state.enabled {
            info!("Firewall off");
        }
        state.enabled = false;
        state.ips.clear();
        Ok(())
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn actual_state(&self) -> bool {
        let _state = self.state.lock().await;
        self.helper.firewall_actual_state().await
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
