// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Timers owned by a connection worker loop
//!
//! Each task is `(kind, period, repeating)`. The loop awaits `tick()` and
//! handles the kinds that came due, in registration order. Dropping the
//! schedule drops every timer with it.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Task<K> {
    kind: K,
    period: Duration,
    repeating: bool,
    next: Instant,
}

#[derive(Debug)]
pub struct Schedule<K> {
    tasks: Vec<Task<K>>,
}

impl<K: Copy + PartialEq> Default for Schedule<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + PartialEq> Schedule<K> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Fire `kind` every `period`, first after one period
    pub fn every(&mut self, kind: K, period: Duration) {
        self.push(kind, period, true);
    }

    /// Fire `kind` once after `delay`
    pub fn once(&mut self, kind: K, delay: Duration) {
        self.push(kind, delay, false);
    }

    fn push(&mut self, kind: K, period: Duration, repeating: bool) {
        self.cancel(kind);
        self.tasks.push(Task {
            kind,
            period,
            repeating,
            next: Instant::now() + period,
        });
    }

    pub fn cancel(&mut self, kind: K) {
        self.tasks.retain(|t| t.kind != kind);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.iter().map(|t| t.next).min()
    }

    /// Kinds due at `now`; repeating tasks are re-armed, one-shots removed
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        for task in &mut self.tasks {
            if task.next <= now {
                fired.push(task.kind);
                if task.repeating {
                    task.next += task.period;
                    if task.next <= now {
                        // Missed ticks are skipped, not replayed
                        task.next = now + task.period;
                    }
                }
            }
        }
        self.tasks.retain(|t| t.repeating || t.next > now);
        fired
    }

    /// Wait for the next deadline; pending forever when empty
    pub async fn tick(&mut self) -> Vec<K> {
        match self.next_deadline() {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.due(Instant::now())
            }
            None => std::future::pending().await,
        }
    }
}
