/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Host boundary traits for prerender registries.
//!
//! The registry never fetches, renders or sleeps by itself. It drives an
//! external document host through [`DocumentHostPort`] and asks a
//! [`TimerPort`] for cancellable delayed wake-ups. Firings come back to the
//! registry as [`TimerTicket`]s on the same control sequence as every other
//! mutation.

use std::time::Duration;

use prerender_core::{AttemptId, Candidate, FinalStatus, NavigationId, TriggerClass};

/// Identity of one cancellable delayed task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Background time-to-live for every attempt of one trigger class.
    Background(TriggerClass),
    /// Bounded wait for response headers that confirm a url-match hint.
    HeaderWait(AttemptId),
    /// Upper bound on how long a real navigation's commit may be deferred.
    CommitDeferral(NavigationId),
}

/// A scheduled firing. The generation distinguishes a live schedule from an
/// earlier one for the same key that was cancelled or replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerTicket {
    pub key: TimerKey,
    pub generation: u64,
}

pub trait TimerPort {
    /// Arms `ticket` to fire after `delay`, replacing any earlier schedule
    /// for the same key.
    fn schedule(&mut self, ticket: TimerTicket, delay: Duration);

    fn cancel(&mut self, key: TimerKey);
}

/// The external host that actually loads speculative documents.
///
/// Calls are notifications; outcomes flow back as lifecycle signals on the
/// registry (`on_headers_received`, `on_load_finished`, ...).
pub trait DocumentHostPort {
    /// Begin the initial navigation for a newly running attempt.
    fn start_navigation(&mut self, attempt: AttemptId, candidate: &Candidate);

    /// Tear down whatever the host holds for a destroyed attempt. May finish
    /// asynchronously; the registry has already forgotten the attempt.
    fn release(&mut self, attempt: AttemptId, reason: FinalStatus);

    /// Swap the attempt's document in as the primary document.
    fn activate(&mut self, attempt: AttemptId, navigation: NavigationId);
}

impl<T: TimerPort + ?Sized> TimerPort for Box<T> {
    fn schedule(&mut self, ticket: TimerTicket, delay: Duration) {
        (**self).schedule(ticket, delay)
    }

    fn cancel(&mut self, key: TimerKey) {
        (**self).cancel(key)
    }
}

impl<T: DocumentHostPort + ?Sized> DocumentHostPort for Box<T> {
    fn start_navigation(&mut self, attempt: AttemptId, candidate: &Candidate) {
        (**self).start_navigation(attempt, candidate)
    }

    fn release(&mut self, attempt: AttemptId, reason: FinalStatus) {
        (**self).release(attempt, reason)
    }

    fn activate(&mut self, attempt: AttemptId, navigation: NavigationId) {
        (**self).activate(attempt, navigation)
    }
}
