// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Server-Sent Events listener for engine events
//!
//! Framework-agnostic SSE client that works with any async runtime (tokio).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::client::{create_event_client, DaemonClientConfig};
use crate::types::EngineEvent;

/// Parse one SSE line
///
/// Returns `None` for comments, blank lines and non-data fields.
pub fn parse_sse_line(line: &str) -> Option<Result<EngineEvent>> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str::<EngineEvent>(data)
            .with_context(|| format!("Failed to parse event JSON (line: {data})")),
    )
}

/// Event listener for the daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events
    ///
    /// Reconnects with exponential backoff if the stream drops; stops once
    /// the receiver is dropped.
    pub async fn listen(&self) -> Result<mpsc::Receiver<EngineEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::stream_events(&config, tx.clone()).await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => tracing::warn!("Event stream error: {}", e),
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }

    async fn stream_events(config: &DaemonClientConfig, tx: mpsc::Sender<EngineEvent>) -> Result<()> {
        let url = format!("{}/api/events", config.daemon_base_url());
        let client = create_event_client(config)?;

        let response = client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    break;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Process complete SSE messages
            while let Some(pos) = buffer.find("\n\n") {
                let message: String = buffer.drain(..pos + 2).collect();

                for event in parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

fn parse_sse_message(message: &str) -> Vec<EngineEvent> {
    message
        .lines()
        .filter_map(parse_sse_line)
        .filter_map(|parsed| match parsed {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("{:#}", e);
                None
            }
        })
        .collect()
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TunnelState;

    #[test]
    fn test_parse_data_line() {
        let line = r#"data: {"type":"state_changed","state":"testing","timestamp":"2025-01-01T00:00:00Z"}"#;
        match parse_sse_line(line) {
            Some(Ok(EngineEvent::StateChanged { state, .. })) => {
                assert_eq!(state, TunnelState::Testing)
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_ignores_comments_and_fields() {
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("event: message").is_none());
        assert!(parse_sse_line("").is_none());
        assert!(matches!(parse_sse_line("data: {oops"), Some(Err(_))));
    }

    #[test]
    fn test_parse_message_skips_bad_lines() {
        let message = "data: {bad}\n\ndata: {\"type\":\"heartbeat\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n";
        let events = parse_sse_message(message);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EngineEvent::Heartbeat { .. }));
    }
}
