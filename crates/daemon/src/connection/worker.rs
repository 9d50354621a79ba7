// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Background run owned by a protocol connection

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConnectionEvent, ConnectionKind, ConnectionMessage, RunId};

/// Handle passed into a run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run: RunId,
    pub token: CancellationToken,
    events: mpsc::UnboundedSender<ConnectionMessage>,
}

impl RunContext {
    pub fn emit(&self, event: ConnectionEvent) {
        if self
            .events
            .send(ConnectionMessage {
                run: self.run,
                event,
            })
            .is_err()
        {
            debug!("Event receiver gone, dropping event from {:?}", self.run);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub struct Worker {
    kind: ConnectionKind,
    generation: u64,
    events: mpsc::UnboundedSender<ConnectionMessage>,
    current: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Worker {
    pub fn new(kind: ConnectionKind, events: mpsc::UnboundedSender<ConnectionMessage>) -> Self {
        Self {
            kind,
            generation: 0,
            events,
            current: None,
        }
    }

    /// Id of the latest run (generation 0 before the first start)
    pub fn run_id(&self) -> RunId {
        RunId {
            kind: self.kind,
            generation: self.generation,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the previous run, wait for its teardown, then spawn `body`
    pub async fn restart<F, Fut>(&mut self, body: F) -> RunId
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some((token, handle)) = self.current.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("{:?} run ended abnormally: {}", self.kind, e);
            }
        }

        self.generation += 1;
        let ctx = RunContext {
            run: self.run_id(),
            token: CancellationToken::new(),
            events: self.events.clone(),
        };
        let token = ctx.token.clone();
        let handle = tokio::spawn(body(ctx));
        self.current = Some((token, handle));
        self.run_id()
    }

    /// Ask the current run to tear down
    ///
    /// Returns false when nothing was running.
    pub fn cancel(&mut self) -> bool {
        match &self.current {
            Some((token, handle)) if !handle.is_finished() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Report `Disconnected` for the latest run without a live task
    pub fn emit_disconnected(&self) {
        let _ = self.events.send(ConnectionMessage {
            run: self.run_id(),
            event: ConnectionEvent::Disconnected,
        });
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some((token, _)) = self.current.take() {
            token.cancel();
        }
    }
}
