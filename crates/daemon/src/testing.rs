// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! In-memory fakes for the probe service and the privileged helper

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::helper::{
    HelperError, HelperResult, Ikev2Params, Ikev2Status, PrivilegedHelper, TunnelWrapperParams,
    WireGuardServiceState, WireGuardStatus,
};
use crate::probe::{ProbeAnswer, ProbeCode, ProbeService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeScript {
    Fail,
    Answer(String),
    /// Never answers
    Hang,
}

#[derive(Default)]
struct FakeProbeState {
    script: VecDeque<ProbeScript>,
    timeouts: Vec<Duration>,
    cancelled: Vec<u64>,
    hanging: Vec<mpsc::UnboundedSender<ProbeAnswer>>,
}

/// Answers probes from a script, one entry per call; an exhausted script fails
pub struct FakeProbeService {
    state: Mutex<FakeProbeState>,
}

impl FakeProbeService {
    pub fn new(script: Vec<ProbeScript>) -> Self {
        Self {
            state: Mutex::new(FakeProbeState {
                script: script.into(),
                ..Default::default()
            }),
        }
    }

    pub fn probe_timeouts(&self) -> Vec<Duration> {
        self.state.lock().unwrap().timeouts.clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

impl ProbeService for FakeProbeService {
    fn probe(&self, cmd_id: u64, timeout: Duration, reply: mpsc::UnboundedSender<ProbeAnswer>) {
        let mut state = self.state.lock().unwrap();
        state.timeouts.push(timeout);
        match state.script.pop_front().unwrap_or(ProbeScript::Fail) {
            ProbeScript::Fail => {
                let _ = reply.send(ProbeAnswer {
                    cmd_id,
                    code: ProbeCode::NetworkError,
                    data: "unreachable".to_string(),
                });
            }
            ProbeScript::Answer(data) => {
                let _ = reply.send(ProbeAnswer {
                    cmd_id,
                    code: ProbeCode::Success,
                    data,
                });
            }
            ProbeScript::Hang => state.hanging.push(reply),
        }
    }

    fn cancel(&self, cmd_id: u64) {
        self.state.lock().unwrap().cancelled.push(cmd_id);
    }
}

/// Failure a fake helper call should report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Verify,
    Unsupported,
    Execute,
}

impl FakeFailure {
    fn error(self, what: &str) -> HelperError {
        match self {
            FakeFailure::Verify => HelperError::VerifyFailed(what.to_string()),
            FakeFailure::Unsupported => HelperError::Unsupported(what.to_string()),
            FakeFailure::Execute => HelperError::Execute(format!("{} failed", what)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeHelperState {
    pub calls: Vec<String>,

    pub install_failure: Option<FakeFailure>,
    pub service_start_failure: Option<FakeFailure>,
    pub wg_running: bool,
    /// State reported while the service runs
    pub wg_state: WireGuardServiceState,
    /// Seconds since the last handshake; None means no handshake yet
    pub handshake_age_secs: Option<i64>,
    pub wg_bytes: (u64, u64),

    pub openvpn_failure: Option<FakeFailure>,
    pub wrapper_failure: Option<FakeFailure>,

    pub ikev2_failure: Option<FakeFailure>,
    pub ikev2_status: Ikev2Status,

    pub firewall_on: bool,
    pub prior_firewall: Option<bool>,
}

impl Default for FakeHelperState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            install_failure: None,
            service_start_failure: None,
            wg_running: false,
            wg_state: WireGuardServiceState::Active,
            handshake_age_secs: Some(1),
            wg_bytes: (0, 0),
            openvpn_failure: None,
            wrapper_failure: None,
            ikev2_failure: None,
            ikev2_status: Ikev2Status::Connected,
            firewall_on: false,
            prior_firewall: None,
        }
    }
}

#[derive(Default)]
pub struct FakeHelper {
    state: Mutex<FakeHelperState>,
}

impl FakeHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut FakeHelperState)) -> Self {
        let helper = Self::new();
        helper.update(configure);
        helper
    }

    pub fn update(&self, configure: impl FnOnce(&mut FakeHelperState)) {
        configure(&mut self.state.lock().unwrap());
    }

    pub fn snapshot(&self) -> FakeHelperState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    fn fail_with(&self, call: &str, failure: Option<FakeFailure>) -> HelperResult<()> {
        self.record(call);
        match failure {
            Some(f) => Err(f.error(call)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PrivilegedHelper for FakeHelper {
    async fn install_wireguard(&self, _config_path: &Path) -> HelperResult<()> {
        let failure = self.state.lock().unwrap().install_failure;
        self.fail_with("install_wireguard", failure)
    }

    async fn start_wireguard_service(&self) -> HelperResult<()> {
        let failure = self.state.lock().unwrap().service_start_failure;
        self.fail_with("start_wireguard_service", failure)?;
        self.update(|s| s.wg_running = true);
        Ok(())
    }

    async fn is_wireguard_service_running(&self) -> bool {
        self.state.lock().unwrap().wg_running
    }

    async fn wireguard_status(&self) -> HelperResult<WireGuardStatus> {
        let state = self.state.lock().unwrap();
        if !state.wg_running {
            return Ok(WireGuardStatus::inactive());
        }
        Ok(WireGuardStatus {
            state: state.wg_state,
            last_handshake: state
                .handshake_age_secs
                .map(|age| Utc::now() - chrono::Duration::seconds(age)),
            bytes_received: state.wg_bytes.0,
            bytes_transmitted: state.wg_bytes.1,
        })
    }

    async fn stop_wireguard(&self) -> HelperResult<()> {
        self.record("stop_wireguard");
        self.update(|s| s.wg_running = false);
        Ok(())
    }

    async fn start_openvpn(
        &self,
        _executable: &str,
        _config_path: &Path,
        _management_port: u16,
    ) -> HelperResult<()> {
        let failure = self.state.lock().unwrap().openvpn_failure;
        self.fail_with("start_openvpn", failure)
    }

    async fn start_tunnel_wrapper(&self, _params: &TunnelWrapperParams) -> HelperResult<()> {
        let failure = self.state.lock().unwrap().wrapper_failure;
        self.fail_with("start_tunnel_wrapper", failure)
    }

    async fn start_ikev2(&self, _params: &Ikev2Params) -> HelperResult<()> {
        let failure = self.state.lock().unwrap().ikev2_failure;
        self.fail_with("start_ikev2", failure)
    }

    async fn ikev2_status(&self) -> HelperResult<Ikev2Status> {
        Ok(self.state.lock().unwrap().ikev2_status.clone())
    }

    async fn stop_ikev2(&self) -> HelperResult<()> {
        self.record("stop_ikev2");
        self.update(|s| s.ikev2_status = Ikev2Status::Disconnected);
        Ok(())
    }

    async fn enable_dns_leak_protection(&self) -> HelperResult<()> {
        self.record("enable_dns");
        Ok(())
    }

    async fn disable_dns_leak_protection(&self) -> HelperResult<()> {
        self.record("disable_dns");
        Ok(())
    }

    async fn remove_hosts(&self) -> HelperResult<()> {
        self.record("remove_hosts");
        Ok(())
    }

    async fn kill_process(&self, name: &str) -> HelperResult<()> {
        self.record(format!("kill_process:{}", name));
        Ok(())
    }

    async fn firewall_on(&self, ips: &[String], allow_lan: bool) -> HelperResult<()> {
        self.record(format!("firewall_on:{}:{}", ips.join(","), allow_lan));
        self.update(|s| s.firewall_on = true);
        Ok(())
    }

    async fn firewall_off(&self, restore_prior: bool) -> HelperResult<()> {
        self.record(format!("firewall_off:{}", restore_prior));
        self.update(|s| {
            if !(restore_prior && s.prior_firewall == Some(true)) {
                s.firewall_on = false;
            }
        });
        Ok(())
    }

    async fn firewall_actual_state(&self) -> bool {
        self.state.lock().unwrap().firewall_on
    }

    async fn set_prior_firewall_state(&self, enabled: bool) -> HelperResult<()> {
        self.update(|s| s.prior_firewall = Some(enabled));
        Ok(())
    }

    async fn prior_firewall_state(&self) -> Option<bool> {
        self.state.lock().unwrap().prior_firewall
    }
}
