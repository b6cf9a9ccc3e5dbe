/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-attempt state machine.
//!
//! ```text
//! Pending -> Running -> (WaitingForHeaders ->) Ready -> Activating -> Activated
//!    \          \                 \              \          \
//!     `----------`-----------------`--------------`----------`--> Destroyed
//! ```
//!
//! An [`Attempt`] only validates and records its own transitions. Registry
//! bookkeeping (slots, queue, timers, host calls) happens in the registry,
//! which is the sole caller of the mutating methods here.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use prerender_core::{AttemptId, Candidate, FinalStatus};
use serde::Serialize;
use url::Url;

use crate::lifecycle::response::ResponseHeaders;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Running,
    WaitingForHeaders,
    Ready,
    Activating,
    Activated,
    Destroyed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Activated | AttemptState::Destroyed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionError {
    Illegal {
        attempt: AttemptId,
        from: AttemptState,
        to: AttemptState,
    },
    AlreadyFinal {
        attempt: AttemptId,
        status: FinalStatus,
    },
    /// Activation hand-off has begun and `reason` may not interrupt it.
    Irrevocable {
        attempt: AttemptId,
        reason: FinalStatus,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Illegal { attempt, from, to } => {
                write!(f, "{attempt}: illegal transition {from:?} -> {to:?}")
            }
            Self::AlreadyFinal { attempt, status } => {
                write!(f, "{attempt}: already finished with {status}")
            }
            Self::Irrevocable { attempt, reason } => {
                write!(f, "{attempt}: activation in progress, ignoring {reason}")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

#[derive(Debug)]
pub struct Attempt {
    id: AttemptId,
    candidate: Arc<Candidate>,
    /// Url the same-site/same-origin checks are made against: the owning
    /// document for rule-triggered attempts, the candidate itself otherwise.
    initiator: Url,
    state: AttemptState,
    created_at: Instant,
    ready_at: Option<Instant>,
    final_status: Option<FinalStatus>,
    headers: Option<ResponseHeaders>,
    redirect_chain: Vec<Url>,
    requires_opt_in: bool,
    load_finished: bool,
    /// Navigation url that put this attempt into `WaitingForHeaders`.
    awaiting_headers_for: Option<Url>,
    inner_navigation: Option<Url>,
    deferred_capabilities: Vec<String>,
}

impl Attempt {
    pub(crate) fn new(
        id: AttemptId,
        candidate: Arc<Candidate>,
        initiator: Url,
        requires_opt_in: bool,
        now: Instant,
    ) -> Self {
        let redirect_chain = vec![candidate.url.clone()];
        Self {
            id,
            candidate,
            initiator,
            state: AttemptState::Pending,
            created_at: now,
            ready_at: None,
            final_status: None,
            headers: None,
            redirect_chain,
            requires_opt_in,
            load_finished: false,
            awaiting_headers_for: None,
            inner_navigation: None,
            deferred_capabilities: Vec::new(),
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Registry key. Always the original candidate url, never a redirect hop.
    pub fn url(&self) -> &Url {
        &self.candidate.url
    }

    pub fn initiator(&self) -> &Url {
        &self.initiator
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ready_at(&self) -> Option<Instant> {
        self.ready_at
    }

    pub fn final_status(&self) -> Option<FinalStatus> {
        self.final_status
    }

    pub fn headers_received(&self) -> bool {
        self.headers.is_some()
    }

    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.headers.as_ref()
    }

    pub fn redirect_chain(&self) -> &[Url] {
        &self.redirect_chain
    }

    /// Url the speculative document ends up at after redirects.
    pub fn document_url(&self) -> &Url {
        self.redirect_chain.last().unwrap_or(&self.candidate.url)
    }

    pub fn requires_opt_in(&self) -> bool {
        self.requires_opt_in
    }

    pub fn load_finished(&self) -> bool {
        self.load_finished
    }

    pub fn awaiting_headers_for(&self) -> Option<&Url> {
        self.awaiting_headers_for.as_ref()
    }

    pub fn inner_navigation(&self) -> Option<&Url> {
        self.inner_navigation.as_ref()
    }

    pub fn deferred_capabilities(&self) -> &[String] {
        &self.deferred_capabilities
    }

    /// Initial navigation still in flight (no document yet).
    pub fn is_loading(&self) -> bool {
        matches!(
            self.state,
            AttemptState::Running | AttemptState::WaitingForHeaders
        )
    }

    fn transition(&mut self, expected: &[AttemptState], to: AttemptState) -> Result<(), TransitionError> {
        if let Some(status) = self.final_status {
            return Err(TransitionError::AlreadyFinal {
                attempt: self.id,
                status,
            });
        }
        if !expected.contains(&self.state) {
            return Err(TransitionError::Illegal {
                attempt: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AttemptState::Pending], AttemptState::Running)
    }

    pub(crate) fn record_redirect(&mut self, to: Url) -> Result<(), TransitionError> {
        if !self.is_loading() || self.headers.is_some() {
            return Err(TransitionError::Illegal {
                attempt: self.id,
                from: self.state,
                to: self.state,
            });
        }
        self.redirect_chain.push(to);
        Ok(())
    }

    pub(crate) fn require_opt_in(&mut self) {
        self.requires_opt_in = true;
    }

    pub(crate) fn record_headers(&mut self, headers: ResponseHeaders) -> Result<(), TransitionError> {
        if !self.is_loading() {
            return Err(TransitionError::Illegal {
                attempt: self.id,
                from: self.state,
                to: self.state,
            });
        }
        self.headers = Some(headers);
        Ok(())
    }

    pub(crate) fn wait_for_headers(&mut self, navigation_url: Url) -> Result<(), TransitionError> {
        if self.headers.is_some() || self.candidate.url_match_hint.is_none() {
            return Err(TransitionError::Illegal {
                attempt: self.id,
                from: self.state,
                to: AttemptState::WaitingForHeaders,
            });
        }
        self.transition(
            &[AttemptState::Running, AttemptState::WaitingForHeaders],
            AttemptState::WaitingForHeaders,
        )?;
        self.awaiting_headers_for = Some(navigation_url);
        Ok(())
    }

    /// Headers confirmed the hint; resume toward `Ready`.
    pub(crate) fn headers_confirmed(&mut self, now: Instant) -> Result<(), TransitionError> {
        self.transition(&[AttemptState::WaitingForHeaders], AttemptState::Running)?;
        self.awaiting_headers_for = None;
        if self.load_finished {
            self.mark_ready(now)?;
        }
        Ok(())
    }

    pub(crate) fn mark_ready(&mut self, now: Instant) -> Result<(), TransitionError> {
        if self.state == AttemptState::WaitingForHeaders && self.final_status.is_none() {
            // Becomes ready once headers settle the pending match.
            self.load_finished = true;
            return Ok(());
        }
        self.transition(&[AttemptState::Running], AttemptState::Ready)?;
        self.load_finished = true;
        self.ready_at = Some(now);
        Ok(())
    }

    pub(crate) fn begin_activation(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AttemptState::Ready], AttemptState::Activating)
    }

    pub(crate) fn complete_activation(&mut self) -> Result<(), TransitionError> {
        self.transition(&[AttemptState::Activating], AttemptState::Activated)?;
        self.final_status = Some(FinalStatus::Activated);
        Ok(())
    }

    pub(crate) fn start_inner_navigation(&mut self, url: Url) -> Result<(), TransitionError> {
        if !matches!(self.state, AttemptState::Ready | AttemptState::Activating) {
            return Err(TransitionError::Illegal {
                attempt: self.id,
                from: self.state,
                to: self.state,
            });
        }
        self.inner_navigation = Some(url);
        Ok(())
    }

    pub(crate) fn finish_inner_navigation(&mut self) {
        self.inner_navigation = None;
    }

    pub(crate) fn defer_capability(&mut self, capability: &str) {
        self.deferred_capabilities.push(capability.to_string());
    }

    pub(crate) fn take_deferred_capabilities(&mut self) -> Vec<String> {
        std::mem::take(&mut self.deferred_capabilities)
    }

    /// Moves to `Destroyed`, recording `reason` as the one and only final
    /// status.
    pub(crate) fn destroy(&mut self, reason: FinalStatus) -> Result<(), TransitionError> {
        if let Some(status) = self.final_status {
            return Err(TransitionError::AlreadyFinal {
                attempt: self.id,
                status,
            });
        }
        if self.state == AttemptState::Activating && !reason.overrides_activation() {
            return Err(TransitionError::Irrevocable {
                attempt: self.id,
                reason,
            });
        }
        self.state = AttemptState::Destroyed;
        self.final_status = Some(reason);
        self.awaiting_headers_for = None;
        Ok(())
    }
}
