/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Commit deferral for navigations that adopted a speculative attempt.
//!
//! Each deferral holds a list of independent conditions that must all hold
//! before the real navigation may commit. The registry re-evaluates them on
//! every control turn; the result is delivered once over a oneshot channel.
//! A deferral that cannot complete always resolves to
//! [`CommitResolution::Fallback`], so the real navigation is never left
//! waiting.

use std::collections::BTreeMap;
use std::time::Instant;

use prerender_core::{AttemptId, FinalStatus, NavigationId};
use tokio::sync::oneshot;

use crate::lifecycle::{Attempt, AttemptState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommitCondition {
    /// Document finished loading.
    AttemptReady,
    /// Any pending `No-Vary-Search` match was confirmed by headers.
    HeadersConfirmed,
    /// No navigation is in flight inside the speculative document.
    InnerNavigationSettled,
}

impl CommitCondition {
    pub const ALL: [CommitCondition; 3] = [
        CommitCondition::AttemptReady,
        CommitCondition::HeadersConfirmed,
        CommitCondition::InnerNavigationSettled,
    ];

    pub fn holds(self, attempt: &Attempt) -> bool {
        match self {
            CommitCondition::AttemptReady => {
                matches!(attempt.state(), AttemptState::Ready | AttemptState::Activating)
            }
            CommitCondition::HeadersConfirmed => attempt.state() != AttemptState::WaitingForHeaders,
            CommitCondition::InnerNavigationSettled => attempt.inner_navigation().is_none(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionState {
    Pending,
    Satisfied,
    Failed(FinalStatus),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitResolution {
    ReadyToCommit { attempt: AttemptId },
    Fallback { reason: FinalStatus },
}

/// Handed to the navigation pipeline when its commit is deferred.
#[derive(Debug)]
pub struct ActivationTicket {
    pub navigation_id: NavigationId,
    pub attempt: AttemptId,
    pub resolution: oneshot::Receiver<CommitResolution>,
}

#[derive(Debug)]
struct CommitDeferral {
    attempt: AttemptId,
    conditions: Vec<CommitCondition>,
    started_at: Instant,
    resolution_tx: Option<oneshot::Sender<CommitResolution>>,
    ready_to_commit: bool,
}

impl CommitDeferral {
    fn send(&mut self, resolution: CommitResolution) {
        if let Some(tx) = self.resolution_tx.take() {
            // The pipeline may have stopped listening; the outcome still
            // stands on the registry side.
            let _ = tx.send(resolution);
        }
    }
}

#[derive(Debug, Default)]
pub struct ActivationCoordinator {
    deferrals: BTreeMap<NavigationId, CommitDeferral>,
}

impl ActivationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(
        &mut self,
        navigation_id: NavigationId,
        attempt: AttemptId,
        conditions: Vec<CommitCondition>,
        now: Instant,
    ) -> ActivationTicket {
        let (tx, rx) = oneshot::channel();
        let replaced = self.deferrals.insert(
            navigation_id,
            CommitDeferral {
                attempt,
                conditions,
                started_at: now,
                resolution_tx: Some(tx),
                ready_to_commit: false,
            },
        );
        if let Some(mut previous) = replaced {
            previous.send(CommitResolution::Fallback {
                reason: FinalStatus::OtherAttemptActivated,
            });
        }
        ActivationTicket {
            navigation_id,
            attempt,
            resolution: rx,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deferrals.is_empty()
    }

    pub fn navigations(&self) -> Vec<NavigationId> {
        self.deferrals.keys().copied().collect()
    }

    pub fn attempt_for(&self, navigation_id: NavigationId) -> Option<AttemptId> {
        self.deferrals.get(&navigation_id).map(|d| d.attempt)
    }

    pub fn deferral_for_attempt(&self, attempt: AttemptId) -> Option<NavigationId> {
        self.deferrals
            .iter()
            .find(|(_, d)| d.attempt == attempt)
            .map(|(nav, _)| *nav)
    }

    pub fn is_ready_to_commit(&self, navigation_id: NavigationId) -> bool {
        self.deferrals
            .get(&navigation_id)
            .is_some_and(|d| d.ready_to_commit)
    }

    pub fn waited_since(&self, navigation_id: NavigationId) -> Option<Instant> {
        self.deferrals.get(&navigation_id).map(|d| d.started_at)
    }

    /// `attempt` is the live attempt bound to the deferral, or `None` once it
    /// has left the registry.
    pub fn evaluate(&self, navigation_id: NavigationId, attempt: Option<&Attempt>) -> ConditionState {
        let Some(deferral) = self.deferrals.get(&navigation_id) else {
            return ConditionState::Failed(FinalStatus::ActivationNavigationFailed);
        };
        let Some(attempt) = attempt else {
            return ConditionState::Failed(FinalStatus::OtherAttemptActivated);
        };
        if let Some(status) = attempt.final_status() {
            return ConditionState::Failed(status);
        }
        if deferral.conditions.iter().all(|c| c.holds(attempt)) {
            ConditionState::Satisfied
        } else {
            ConditionState::Pending
        }
    }

    /// Tells the pipeline it may commit. Returns `false` if already told.
    pub fn mark_ready(&mut self, navigation_id: NavigationId) -> bool {
        let Some(deferral) = self.deferrals.get_mut(&navigation_id) else {
            return false;
        };
        if deferral.ready_to_commit {
            return false;
        }
        deferral.ready_to_commit = true;
        let attempt = deferral.attempt;
        deferral.send(CommitResolution::ReadyToCommit { attempt });
        true
    }

    /// Withdraws a commit permission whose conditions stopped holding. The
    /// resolution was already delivered, so the pipeline learns of this from
    /// `StillDeferred` and asks again. Returns whether anything changed.
    pub fn reopen(&mut self, navigation_id: NavigationId) -> bool {
        match self.deferrals.get_mut(&navigation_id) {
            Some(deferral) if deferral.ready_to_commit => {
                deferral.ready_to_commit = false;
                true
            }
            _ => false,
        }
    }

    /// Resolves and forgets the deferral with a fallback.
    pub fn fall_back(&mut self, navigation_id: NavigationId, reason: FinalStatus) -> Option<AttemptId> {
        let mut deferral = self.deferrals.remove(&navigation_id)?;
        deferral.send(CommitResolution::Fallback { reason });
        Some(deferral.attempt)
    }

    /// Removes a deferral that is ready to commit.
    pub fn take_ready(&mut self, navigation_id: NavigationId) -> Option<AttemptId> {
        if !self.is_ready_to_commit(navigation_id) {
            return None;
        }
        self.deferrals.remove(&navigation_id).map(|d| d.attempt)
    }
}
