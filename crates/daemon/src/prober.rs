// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Tunnel health prober
//!
//! Once a protocol reports the tunnel up, the prober checks that traffic
//! actually flows by asking the probe service for our public IP. The
//! default schedule is three probes with timeouts growing 2s, 4s, 8s; the
//! `tunnel_test` config section can replace it with a fixed schedule.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vpn_engine_common::Protocol;

use crate::config::TunnelTestConfig;
use crate::probe::{ProbeAnswer, ProbeCode, ProbeService};

pub const PROBE_TIMEOUT_BASE: Duration = Duration::from_secs(2);
pub const PROBE_TIMEOUT_MAX: Duration = Duration::from_secs(8);
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Extra wait past a probe's own timeout before giving up on its answer
const ANSWER_GRACE: Duration = Duration::from_secs(1);

/// Result of one test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Run this outcome belongs to (see `TunnelProber::start`)
    pub generation: u64,
    pub success: bool,
    pub ip: String,
}

/// Resolved probe schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSchedule {
    pub start_delay: Option<Duration>,
    pub timeouts: Vec<Duration>,
    /// Fixed delay between failures; None waits out the attempt budget
    pub retry_delay: Option<Duration>,
}

impl ProbeSchedule {
    pub fn from_config(config: &TunnelTestConfig) -> Self {
        let start_delay = config.start_delay_ms.map(Duration::from_millis);

        if !config.is_overridden() {
            let mut timeouts = Vec::with_capacity(DEFAULT_PROBE_ATTEMPTS as usize);
            let mut timeout = PROBE_TIMEOUT_BASE;
            for _ in 0..DEFAULT_PROBE_ATTEMPTS {
                timeouts.push(timeout);
                if timeout < PROBE_TIMEOUT_MAX {
                    timeout = (timeout * 2).min(PROBE_TIMEOUT_MAX);
                }
            }
            return Self {
                start_delay,
                timeouts,
                retry_delay: None,
            };
        }

        let attempts = config.attempts.unwrap_or(DEFAULT_PROBE_ATTEMPTS);
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(PROBE_TIMEOUT_BASE);

        Self {
            start_delay,
            timeouts: vec![timeout; attempts as usize],
            retry_delay: Some(Duration::from_millis(config.retry_delay_ms.unwrap_or(0))),
        }
    }
}

pub struct TunnelProber {
    service: Arc<dyn ProbeService>,
    schedule: ProbeSchedule,
    outcome_tx: mpsc::UnboundedSender<ProbeOutcome>,
    generation: u64,
    next_cmd_id: Arc<AtomicU64>,
    /// Command id of the probe in flight (0 when none)
    current_cmd: Arc<AtomicU64>,
    worker: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TunnelProber {
    pub fn new(
        service: Arc<dyn ProbeService>,
        schedule: ProbeSchedule,
        outcome_tx: mpsc::UnboundedSender<ProbeOutcome>,
    ) -> Self {
        Self {
            service,
            schedule,
            outcome_tx,
            generation: 0,
            next_cmd_id: Arc::new(AtomicU64::new(0)),
            current_cmd: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Start a test run, stopping any previous one
    ///
    /// Returns the generation stamped on this run's outcome. The outcome is
    /// never delivered before this returns.
    pub fn start(&mut self, protocol: Protocol) -> u64 {
        self.stop();
        self.generation += 1;

        debug!("Starting tunnel test #{} for {}", self.generation, protocol);

        let token = CancellationToken::new();
        let run = ProbeRun {
            service: self.service.clone(),
            schedule: self.schedule.clone(),
            outcome_tx: self.outcome_tx.clone(),
            generation: self.generation,
            next_cmd_id: self.next_cmd_id.clone(),
            current_cmd: self.current_cmd.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(run.run());
        self.worker = Some((token, handle));
        self.generation
    }

    /// Cancel the outstanding probe; safe when idle
    pub fn stop(&mut self) {
        if let Some((token, _handle)) = self.worker.take() {
            token.cancel();
            let cmd_id = self.current_cmd.swap(0, Ordering::SeqCst);
            if cmd_id != 0 {
                self.service.cancel(cmd_id);
                debug!("Tunnel test stopped (probe {} cancelled)", cmd_id);
            }
        }
    }
}

impl Drop for TunnelProber {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ProbeRun {
    service: Arc<dyn ProbeService>,
    schedule: ProbeSchedule,
    outcome_tx: mpsc::UnboundedSender<ProbeOutcome>,
    generation: u64,
    next_cmd_id: Arc<AtomicU64>,
    current_cmd: Arc<AtomicU64>,
    token: CancellationToken,
}

enum AttemptResult {
    Ip(String),
    Failed,
    Cancelled,
}

impl ProbeRun {
    async fn run(self) {
        if let Some(delay) = self.schedule.start_delay {
            debug!("Delaying tunnel test start for {:?}", delay);
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.schedule.timeouts.is_empty() {
            info!("Tunnel tests disabled");
            self.finish(true, String::new());
            return;
        }

        let started = Instant::now();
        let attempts = self.schedule.timeouts.len();

        for (index, timeout) in self.schedule.timeouts.iter().copied().enumerate() {
            let attempt_started = Instant::now();

            match self.attempt(timeout).await {
                AttemptResult::Ip(ip) => {
                    info!(
                        "Tunnel test {} succeeded with IP {} ({:?} total)",
                        index + 1,
                        ip,
                        started.elapsed()
                    );
                    self.finish(true, ip);
                    return;
                }
                AttemptResult::Cancelled => return,
                AttemptResult::Failed => {
                    debug!("Tunnel test {} failed", index + 1);
                }
            }

            if index + 1 < attempts {
                let wait = match self.schedule.retry_delay {
                    Some(delay) => delay,
                    None => timeout.saturating_sub(attempt_started.elapsed()),
                };
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        info!("Tunnel test failed after {} attempts", attempts);
        self.finish(false, String::new());
    }

    async fn attempt(&self, timeout: Duration) -> AttemptResult {
        let cmd_id = self.next_cmd_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ProbeAnswer>();

        self.current_cmd.store(cmd_id, Ordering::SeqCst);
        self.service.probe(cmd_id, timeout, reply_tx);

        let deadline = tokio::time::sleep(timeout + ANSWER_GRACE);
        tokio::pin!(deadline);

        let answer = loop {
            tokio::select! {
                _ = self.token.cancelled() => return AttemptResult::Cancelled,
                _ = &mut deadline => {
                    self.service.cancel(cmd_id);
                    break None;
                }
                answer = reply_rx.recv() => match answer {
                    Some(a) if a.cmd_id == cmd_id => break Some(a),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };
        let _ = self
            .current_cmd
            .compare_exchange(cmd_id, 0, Ordering::SeqCst, Ordering::SeqCst);

        match answer {
            Some(answer) if answer.code == ProbeCode::Success => {
                let trimmed = answer.data.trim();
                if trimmed.parse::<IpAddr>().is_ok() {
                    AttemptResult::Ip(trimmed.to_string())
                } else {
                    debug!("Probe answer is not an IP address: {:?}", trimmed);
                    AttemptResult::Failed
                }
            }
            _ => AttemptResult::Failed,
        }
    }

    fn finish(&self, success: bool, ip: String) {
        let _ = self.outcome_tx.send(ProbeOutcome {
            generation: self.generation,
            success,
            ip,
        });
    }
}
