/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Control Panel: async adapter between concurrent producers and the
//! synchronous registry.
//!
//! The registry stays synchronous. Background workers, timer tasks and host
//! bridges only ever push [`QueuedIntent`]s into a bounded channel; the owner
//! of the registry drains it with [`ControlPanel::drain_pending`] and feeds
//! the result to `PrerenderRegistry::apply_intents`, so every mutation still
//! happens on one control sequence.

use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::registry::PrerenderIntent;
use crate::runtime::memory::{MemoryPressureLevel, sample_memory};
use crate::runtime::timers::TokioTimers;

/// Capacity of the intent channel. Limits flooding from async producers.
const INTENT_CHANNEL_CAPACITY: usize = 256;

/// How often the memory monitor samples system memory.
const MEMORY_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Intent with source tracking for the async intent queue.
#[derive(Debug, Clone)]
pub struct QueuedIntent {
    pub intent: PrerenderIntent,
    pub queued_at: Instant,
    pub source: IntentSource,
}

impl QueuedIntent {
    pub fn new(intent: PrerenderIntent, source: IntentSource) -> Self {
        Self {
            intent,
            queued_at: Instant::now(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntentSource {
    /// Lifecycle signals bridged from the document host.
    Host,
    /// Speculation rules, embedder calls, link interaction.
    TriggerSource,
    MemoryMonitor,
    Timer,
}

/// Owns:
/// - an intent `mpsc` channel (capacity [`INTENT_CHANNEL_CAPACITY`])
/// - a shared [`CancellationToken`] for graceful worker shutdown
/// - a [`JoinSet`] supervising background workers
pub struct ControlPanel {
    intent_tx: mpsc::Sender<QueuedIntent>,
    intent_rx: mpsc::Receiver<QueuedIntent>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl ControlPanel {
    pub fn new() -> Self {
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        Self {
            intent_tx,
            intent_rx,
            cancel: CancellationToken::new(),
            workers: JoinSet::new(),
        }
    }

    /// Cloned to producers that live outside the panel (host bridges,
    /// trigger sources).
    pub fn sender(&self) -> mpsc::Sender<QueuedIntent> {
        self.intent_tx.clone()
    }

    /// Non-blocking. Returns every intent currently buffered, in arrival
    /// order.
    pub fn drain_pending(&mut self) -> Vec<PrerenderIntent> {
        let mut intents = Vec::new();
        while let Ok(queued) = self.intent_rx.try_recv() {
            intents.push(queued.intent);
        }
        intents
    }

    /// Waits for the next intent, or `None` once the panel is shutting down.
    pub async fn next_intent(&mut self) -> Option<PrerenderIntent> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            queued = self.intent_rx.recv() => queued.map(|q| q.intent),
        }
    }

    /// Production timer port. Its tasks are children of the panel's token and
    /// stop on [`Self::shutdown`].
    pub fn timer_port(&self, handle: Handle) -> TokioTimers {
        TokioTimers::new(handle, self.intent_tx.clone(), self.cancel.clone())
    }

    /// Samples system memory every [`MEMORY_MONITOR_INTERVAL`] and queues
    /// `MemoryPressureChanged` whenever the observed level changes.
    pub fn spawn_memory_monitor(&mut self) {
        let cancel = self.cancel.clone();
        let tx = self.intent_tx.clone();
        self.workers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("control_panel: memory monitor cancelled");
                }
                _ = memory_monitor_worker(tx) => {}
            }
        });
        log::debug!("control_panel: memory monitor spawned");
    }

    /// Cancel all supervised workers and timer tasks, then await the workers.
    pub async fn shutdown(&mut self) {
        log::debug!(
            "control_panel: shutdown requested, cancelling {} workers",
            self.workers.len()
        );
        self.cancel.cancel();
        while self.workers.join_next().await.is_some() {}
        log::debug!("control_panel: all workers joined");
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-critical samples are dropped when the channel is full.
async fn memory_monitor_worker(tx: mpsc::Sender<QueuedIntent>) {
    let mut last_level = MemoryPressureLevel::Unknown;

    loop {
        tokio::time::sleep(MEMORY_MONITOR_INTERVAL).await;

        let (level, available_mib, total_mib) = sample_memory();
        if level == last_level {
            continue;
        }
        last_level = level;
        log::debug!(
            "control_panel: memory pressure changed to {level:?} ({available_mib} MiB free of {total_mib} MiB)"
        );

        let queued = QueuedIntent::new(
            PrerenderIntent::MemoryPressureChanged {
                level,
                available_mib,
                total_mib,
            },
            IntentSource::MemoryMonitor,
        );

        if level == MemoryPressureLevel::Critical {
            if let Err(e) = tx.send(queued).await {
                log::debug!("control_panel: critical memory intent dropped ({e})");
                return;
            }
        } else if let Err(e) = tx.try_send(queued) {
            log::debug!("control_panel: memory pressure intent dropped ({e})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prerender_core::TriggerClass;
    use prerender_runtime::{TimerKey, TimerPort, TimerTicket};

    #[tokio::test]
    async fn control_panel_new_creates_open_channel() {
        let panel = ControlPanel::new();
        assert!(!panel.sender().is_closed());
    }

    #[tokio::test]
    async fn drain_pending_returns_empty_when_no_intents() {
        let mut panel = ControlPanel::new();
        assert!(panel.drain_pending().is_empty());
    }

    #[tokio::test]
    async fn drain_pending_preserves_arrival_order() {
        let mut panel = ControlPanel::new();
        let tx = panel.sender();
        tx.try_send(QueuedIntent::new(
            PrerenderIntent::VisibilityChanged(false),
            IntentSource::Host,
        ))
        .expect("channel should accept intent");
        tx.try_send(QueuedIntent::new(
            PrerenderIntent::NavigatingAway,
            IntentSource::TriggerSource,
        ))
        .expect("channel should accept intent");

        assert_eq!(
            panel.drain_pending(),
            vec![
                PrerenderIntent::VisibilityChanged(false),
                PrerenderIntent::NavigatingAway
            ]
        );
        assert!(panel.drain_pending().is_empty());
    }

    #[tokio::test]
    async fn shutdown_completes_with_no_workers() {
        let mut panel = ControlPanel::new();
        panel.shutdown().await;
        assert_eq!(panel.worker_count(), 0);
    }

    #[tokio::test]
    async fn spawn_memory_monitor_increments_worker_count() {
        let mut panel = ControlPanel::new();
        assert_eq!(panel.worker_count(), 0);
        panel.spawn_memory_monitor();
        tokio::task::yield_now().await;
        assert_eq!(panel.worker_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_joins_all_workers() {
        let mut panel = ControlPanel::new();
        panel.spawn_memory_monitor();
        panel.shutdown().await;
        assert_eq!(panel.worker_count(), 0);
        assert_eq!(panel.next_intent().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_port_firings_arrive_through_the_panel() {
        let mut panel = ControlPanel::new();
        let mut timers = panel.timer_port(Handle::current());
        let ticket = TimerTicket {
            key: TimerKey::Background(TriggerClass::Embedder),
            generation: 3,
        };
        timers.schedule(ticket, Duration::from_secs(19));

        assert_eq!(panel.next_intent().await, Some(PrerenderIntent::TimerFired(ticket)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_pending_timer_tasks() {
        let mut panel = ControlPanel::new();
        let mut timers = panel.timer_port(Handle::current());
        timers.schedule(
            TimerTicket {
                key: TimerKey::Background(TriggerClass::SpeculationRule),
                generation: 1,
            },
            Duration::from_secs(1),
        );
        panel.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(panel.drain_pending().is_empty());
    }
}
