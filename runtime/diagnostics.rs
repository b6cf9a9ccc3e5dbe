/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Diagnostic events emitted by the registry and their aggregation.
//!
//! Events flow over a `crossbeam-channel` sender handed to the registry at
//! construction. The terminal `(trigger_class, final_status)` pair of each
//! attempt is the one event external metrics collectors rely on; channel
//! messages and spans are best-effort.

use std::collections::{BTreeMap, HashMap};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use prerender_core::{AttemptId, FinalStatus, TriggerClass};
use serde_json::{Value, json};

pub const CHANNEL_ADMISSION_STARTED: &str = "prerender.admission.started";
pub const CHANNEL_ADMISSION_QUEUED: &str = "prerender.admission.queued";
pub const CHANNEL_ADMISSION_STANDBY: &str = "prerender.admission.standby";
pub const CHANNEL_ADMISSION_DUPLICATE: &str = "prerender.admission.duplicate";
pub const CHANNEL_ADMISSION_PROMOTED: &str = "prerender.admission.promoted";
pub const CHANNEL_ADMISSION_EVICTED: &str = "prerender.admission.evicted";
pub const CHANNEL_MATCH_EXACT: &str = "prerender.match.exact";
pub const CHANNEL_MATCH_NO_VARY_SEARCH: &str = "prerender.match.no_vary_search";
pub const CHANNEL_MATCH_WAITING_FOR_HEADERS: &str = "prerender.match.waiting_for_headers";
pub const CHANNEL_MATCH_NONE: &str = "prerender.match.none";
pub const CHANNEL_ACTIVATION_DEFERRED: &str = "prerender.activation.deferred";
pub const CHANNEL_ACTIVATION_COMMITTED: &str = "prerender.activation.committed";
pub const CHANNEL_ACTIVATION_FALLBACK: &str = "prerender.activation.fallback";
pub const CHANNEL_CAPABILITY_DEFERRED: &str = "prerender.capability.deferred";
pub const CHANNEL_TIMER_STALE: &str = "prerender.timer.stale";

pub const SPAN_REGISTRY_SUBMIT: &str = "prerender.registry.submit";
pub const SPAN_REGISTRY_NAVIGATION_STARTING: &str = "prerender.registry.navigation_starting";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticEvent {
    AttemptFinished {
        attempt: AttemptId,
        trigger_class: TriggerClass,
        final_status: FinalStatus,
    },
    AdmissionRejected {
        trigger_class: TriggerClass,
        final_status: FinalStatus,
    },
    MessageSent {
        channel_id: &'static str,
        byte_len: usize,
    },
    Span {
        name: &'static str,
        duration_us: u64,
    },
}

/// Registry-side handle. A registry built without a sender emits nothing.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticsSink {
    tx: Option<Sender<DiagnosticEvent>>,
}

impl DiagnosticsSink {
    pub fn new(tx: Sender<DiagnosticEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    pub fn message(&self, channel_id: &'static str, payload: &str) {
        self.emit(DiagnosticEvent::MessageSent {
            channel_id,
            byte_len: payload.len(),
        });
    }

    #[cfg(feature = "diagnostics")]
    pub fn span_duration(&self, name: &'static str, duration_us: u64) {
        self.emit(DiagnosticEvent::Span { name, duration_us });
    }

    #[cfg(not(feature = "diagnostics"))]
    pub fn span_duration(&self, _name: &'static str, _duration_us: u64) {}
}

/// Aggregated view over a diagnostics receiver.
#[derive(Debug)]
pub struct DiagnosticsState {
    rx: Receiver<DiagnosticEvent>,
    message_counts: HashMap<&'static str, u64>,
    final_statuses: BTreeMap<(TriggerClass, FinalStatus), u64>,
    rejections: BTreeMap<(TriggerClass, FinalStatus), u64>,
    finished_attempts: BTreeMap<AttemptId, FinalStatus>,
    last_span_duration_us: HashMap<&'static str, u64>,
}

impl DiagnosticsState {
    /// Creates the state together with the sink the registry should emit to.
    pub fn new() -> (Self, DiagnosticsSink) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                rx,
                message_counts: HashMap::new(),
                final_statuses: BTreeMap::new(),
                rejections: BTreeMap::new(),
                finished_attempts: BTreeMap::new(),
                last_span_duration_us: HashMap::new(),
            },
            DiagnosticsSink::new(tx),
        )
    }

    /// Folds every buffered event into the aggregates. Returns how many were
    /// consumed.
    pub fn drain(&mut self) -> usize {
        let mut consumed = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    consumed += 1;
                    self.record(event);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        consumed
    }

    fn record(&mut self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::AttemptFinished {
                attempt,
                trigger_class,
                final_status,
            } => {
                if let Some(previous) = self.finished_attempts.insert(attempt, final_status) {
                    log::warn!(
                        "diagnostics: {attempt} finished twice ({previous} then {final_status})"
                    );
                }
                *self
                    .final_statuses
                    .entry((trigger_class, final_status))
                    .or_insert(0) += 1;
            }
            DiagnosticEvent::AdmissionRejected {
                trigger_class,
                final_status,
            } => {
                *self
                    .rejections
                    .entry((trigger_class, final_status))
                    .or_insert(0) += 1;
            }
            DiagnosticEvent::MessageSent { channel_id, .. } => {
                *self.message_counts.entry(channel_id).or_insert(0) += 1;
            }
            DiagnosticEvent::Span { name, duration_us } => {
                self.last_span_duration_us.insert(name, duration_us);
            }
        }
    }

    pub fn message_count(&self, channel_id: &str) -> u64 {
        self.message_counts.get(channel_id).copied().unwrap_or(0)
    }

    pub fn final_status_count(&self, class: TriggerClass, status: FinalStatus) -> u64 {
        self.final_statuses
            .get(&(class, status))
            .copied()
            .unwrap_or(0)
    }

    pub fn rejection_count(&self, class: TriggerClass, status: FinalStatus) -> u64 {
        self.rejections.get(&(class, status)).copied().unwrap_or(0)
    }

    pub fn final_status_of(&self, attempt: AttemptId) -> Option<FinalStatus> {
        self.finished_attempts.get(&attempt).copied()
    }

    pub fn snapshot_json(&self) -> Value {
        let pairs = |map: &BTreeMap<(TriggerClass, FinalStatus), u64>| {
            map.iter()
                .map(|((class, status), count)| {
                    json!({
                        "trigger_class": class.as_str(),
                        "final_status": status.as_str(),
                        "count": count,
                    })
                })
                .collect::<Vec<_>>()
        };
        let mut channels: Vec<_> = self.message_counts.iter().collect();
        channels.sort();
        let channels: Vec<Value> = channels
            .into_iter()
            .map(|(id, count)| json!({ "channel_id": id, "count": count }))
            .collect();
        json!({
            "final_statuses": pairs(&self.final_statuses),
            "rejections": pairs(&self.rejections),
            "channels": channels,
            "spans_us": self.last_span_duration_us,
        })
    }
}
