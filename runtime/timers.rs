/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Timer bookkeeping shared by the registry and the tokio-backed timer port.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prerender_runtime::{TimerKey, TimerPort, TimerTicket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::PrerenderIntent;
use crate::runtime::control_panel::{IntentSource, QueuedIntent};

/// Which keys are armed, and under which generation.
///
/// A firing is accepted only if its ticket carries the generation currently
/// armed for its key; anything else was cancelled or replaced while in
/// flight and is dropped.
#[derive(Debug, Default)]
pub struct TimerBook {
    next_generation: u64,
    armed: HashMap<TimerKey, u64>,
}

impl TimerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<P: TimerPort + ?Sized>(&mut self, key: TimerKey, delay: Duration, port: &mut P) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(key, generation);
        port.schedule(TimerTicket { key, generation }, delay);
    }

    /// Arms `key` unless it is already armed. Returns whether a new schedule
    /// was issued.
    pub fn ensure_armed<P: TimerPort + ?Sized>(
        &mut self,
        key: TimerKey,
        delay: Duration,
        port: &mut P,
    ) -> bool {
        if self.armed.contains_key(&key) {
            return false;
        }
        self.arm(key, delay, port);
        true
    }

    pub fn disarm<P: TimerPort + ?Sized>(&mut self, key: TimerKey, port: &mut P) {
        if self.armed.remove(&key).is_some() {
            port.cancel(key);
        }
    }

    /// Consumes a firing. `true` means the ticket is live and the key is now
    /// disarmed; the port is told to release whatever it still holds for it.
    pub fn accept<P: TimerPort + ?Sized>(&mut self, ticket: TimerTicket, port: &mut P) -> bool {
        match self.armed.get(&ticket.key) {
            Some(generation) if *generation == ticket.generation => {
                self.armed.remove(&ticket.key);
                port.cancel(ticket.key);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }
}

/// Production [`TimerPort`]: one tokio task per armed key, each sleeping and
/// then queueing a [`PrerenderIntent::TimerFired`] onto the control panel.
pub struct TokioTimers {
    handle: Handle,
    intent_tx: mpsc::Sender<QueuedIntent>,
    parent: CancellationToken,
    tasks: HashMap<TimerKey, CancellationToken>,
}

impl TokioTimers {
    pub(crate) fn new(
        handle: Handle,
        intent_tx: mpsc::Sender<QueuedIntent>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            handle,
            intent_tx,
            parent,
            tasks: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl TimerPort for TokioTimers {
    fn schedule(&mut self, ticket: TimerTicket, delay: Duration) {
        self.cancel(ticket.key);
        let token = self.parent.child_token();
        self.tasks.insert(ticket.key, token.clone());
        let tx = self.intent_tx.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let queued = QueuedIntent {
                        intent: PrerenderIntent::TimerFired(ticket),
                        queued_at: Instant::now(),
                        source: IntentSource::Timer,
                    };
                    // A firing must not be lost to a momentarily full queue.
                    if let Err(e) = tx.send(queued).await {
                        log::debug!("timers: dropped firing for {:?} ({e})", ticket.key);
                    }
                }
            }
        });
    }

    fn cancel(&mut self, key: TimerKey) {
        if let Some(token) = self.tasks.remove(&key) {
            token.cancel();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, token) in self.tasks.drain() {
            token.cancel();
        }
    }
}
