// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Probe service: asks an external endpoint for our public IP
//!
//! Requests are keyed by a caller-supplied command id. Each request gets
//! exactly one answer on the reply channel, unless it is cancelled first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCode {
    Success,
    NetworkError,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAnswer {
    pub cmd_id: u64,
    pub code: ProbeCode,
    pub data: String,
}

pub trait ProbeService: Send + Sync {
    fn probe(&self, cmd_id: u64, timeout: Duration, reply: mpsc::UnboundedSender<ProbeAnswer>);
    fn cancel(&self, cmd_id: u64);
}

/// `GET <url>` through whatever route the OS picks (the tunnel, once up)
pub struct HttpProbeService {
    client: reqwest::Client,
    url: String,
    in_flight: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl HttpProbeService {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build probe client: {}", e))?;

        Ok(Self {
            client,
            url: url.into(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl ProbeService for HttpProbeService {
    fn probe(&self, cmd_id: u64, timeout: Duration, reply: mpsc::UnboundedSender<ProbeAnswer>) {
        let request = self.client.get(&self.url).timeout(timeout);
        let in_flight = self.in_flight.clone();

        // Held until the handle is registered; the task's removal waits on it
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            let answer = match request.send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(body) => ProbeAnswer {
                        cmd_id,
                        code: ProbeCode::Success,
                        data: body,
                    },
                    Err(e) => failure(cmd_id, &e),
                },
                Ok(resp) => ProbeAnswer {
                    cmd_id,
                    code: ProbeCode::NetworkError,
                    data: format!("HTTP {}", resp.status()),
                },
                Err(e) => failure(cmd_id, &e),
            };

            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&cmd_id);
            let _ = reply.send(answer);
        });
        map.insert(cmd_id, handle.abort_handle());
    }

    fn cancel(&self, cmd_id: u64) {
        let handle = self.in_flight.lock().ok().and_then(|mut m| m.remove(&cmd_id));
        if let Some(handle) = handle {
            debug!("Cancelling probe {}", cmd_id);
            handle.abort();
        }
    }
}

fn failure(cmd_id: u64, e: &reqwest::Error) -> ProbeAnswer {
    ProbeAnswer {
        cmd_id,
        code: if e.is_timeout() {
            ProbeCode::Timeout
        } else {
            ProbeCode::NetworkError
        },
        data: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_answers_once() {
        // Port 9 on loopback is closed on any sane test host
        let service = HttpProbeService::new("http://127.0.0.1:9/").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        service.probe(7, Duration::from_secs(2), tx);
        let answer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe answer timed out")
            .expect("reply channel closed");

        assert_eq!(answer.cmd_id, 7);
        assert_ne!(answer.code, ProbeCode::Success);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_answered_requests_leave_nothing_in_flight() {
        let service = HttpProbeService::new("http://127.0.0.1:9/").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for cmd_id in 0..20 {
            service.probe(cmd_id, Duration::from_secs(2), tx.clone());
        }
        drop(tx);

        let mut answered = 0;
        while let Some(_answer) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("probe answer timed out")
        {
            answered += 1;
        }
        assert_eq!(answered, 20);
        assert!(service.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let service = HttpProbeService::new("http://127.0.0.1:9/").unwrap();
        service.cancel(42);
    }
}
