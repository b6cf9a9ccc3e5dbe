/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-memory ports: a document host that only records what it was asked to
//! do, and a timer port whose firings are triggered by hand.

use std::collections::BTreeMap;
use std::time::Duration;

use prerender_core::{AttemptId, Candidate, FinalStatus, NavigationId};
use prerender_runtime::{DocumentHostPort, TimerKey, TimerPort, TimerTicket};
use serde::Serialize;
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostEvent {
    Started { attempt: AttemptId, url: Url },
    Released { attempt: AttemptId, reason: FinalStatus },
    Activated { attempt: AttemptId, navigation: NavigationId },
}

#[derive(Debug, Default)]
pub struct RecordingHost {
    events: Vec<HostEvent>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    pub fn started(&self) -> Vec<AttemptId> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HostEvent::Started { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<(AttemptId, FinalStatus)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HostEvent::Released { attempt, reason } => Some((*attempt, *reason)),
                _ => None,
            })
            .collect()
    }

    pub fn activated(&self) -> Vec<AttemptId> {
        self.events
            .iter()
            .filter_map(|event| match event {
                HostEvent::Activated { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    /// How many speculative navigations were started for `url`.
    pub fn navigations_to(&self, url: &Url) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, HostEvent::Started { url: started, .. } if started == url))
            .count()
    }

    pub fn last_started(&self) -> Option<AttemptId> {
        self.started().last().copied()
    }
}

impl DocumentHostPort for RecordingHost {
    fn start_navigation(&mut self, attempt: AttemptId, candidate: &Candidate) {
        self.events.push(HostEvent::Started {
            attempt,
            url: candidate.url.clone(),
        });
    }

    fn release(&mut self, attempt: AttemptId, reason: FinalStatus) {
        self.events.push(HostEvent::Released { attempt, reason });
    }

    fn activate(&mut self, attempt: AttemptId, navigation: NavigationId) {
        self.events.push(HostEvent::Activated { attempt, navigation });
    }
}

/// Timer port that never sleeps. Armed tickets wait until a caller takes
/// them and hands them back to the registry.
#[derive(Debug, Default)]
pub struct ManualTimers {
    armed: BTreeMap<TimerKey, (TimerTicket, Duration)>,
    schedule_count: usize,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn delay(&self, key: TimerKey) -> Option<Duration> {
        self.armed.get(&key).map(|(_, delay)| *delay)
    }

    pub fn ticket(&self, key: TimerKey) -> Option<TimerTicket> {
        self.armed.get(&key).map(|(ticket, _)| *ticket)
    }

    /// Disarms `key` and returns the ticket that would have fired.
    pub fn take(&mut self, key: TimerKey) -> Option<TimerTicket> {
        self.armed.remove(&key).map(|(ticket, _)| ticket)
    }

    pub fn armed_keys(&self) -> Vec<TimerKey> {
        self.armed.keys().copied().collect()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedule_count
    }
}

impl TimerPort for ManualTimers {
    fn schedule(&mut self, ticket: TimerTicket, delay: Duration) {
        self.schedule_count += 1;
        self.armed.insert(ticket.key, (ticket, delay));
    }

    fn cancel(&mut self, key: TimerKey) {
        self.armed.remove(&key);
    }
}
