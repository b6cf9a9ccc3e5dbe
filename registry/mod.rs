/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The per-context prerender registry.
//!
//! Every mutation (admission, cancellation, host signals, timer firings,
//! matching and activation) goes through `&mut PrerenderRegistry`, so all of
//! them are serialized on whatever control sequence owns the registry.
//! Asynchronous producers queue [`PrerenderIntent`]s instead and the owner
//! applies them with [`PrerenderRegistry::apply_intents`].

pub mod admission;
pub mod capability;
pub mod intents;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use log::{debug, info, warn};
use prerender_core::{
    AttemptId, AttemptIdAllocator, Candidate, CandidateKey, FinalStatus, InteractionSignal,
    NavigationId, TargetSemantics, TriggerClass, is_navigable_scheme, same_origin, same_site,
};
use prerender_runtime::{DocumentHostPort, TimerKey, TimerPort, TimerTicket};
use serde::Serialize;
use url::Url;

use crate::activation::{
    ActivationCoordinator, ActivationTicket, CommitCondition, ConditionState, MatchKind,
    find_best_attempt,
};
use crate::lifecycle::{Attempt, AttemptState, BackgroundTimeoutMonitor, ResponseHeaders};
use crate::runtime::config::PrerenderConfig;
use crate::runtime::diagnostics::{
    self, DiagnosticEvent, DiagnosticsSink, SPAN_REGISTRY_NAVIGATION_STARTING,
    SPAN_REGISTRY_SUBMIT,
};
use crate::runtime::memory::MemoryPressureLevel;
use crate::runtime::timers::TimerBook;

pub use admission::{Eligibility, ResourceSignals, SlotBucket, SlotDecision};
pub use capability::{CapabilityPolicy, CapabilityTable};
pub use intents::{HostSignal, LoadOutcome, PrerenderIntent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started(AttemptId),
    Queued(AttemptId),
    Standby(CandidateKey),
    AlreadyPresent(AttemptId),
    /// No attempt was created.
    Rejected(FinalStatus),
}

impl SubmitOutcome {
    pub fn attempt(&self) -> Option<AttemptId> {
        match self {
            SubmitOutcome::Started(id)
            | SubmitOutcome::Queued(id)
            | SubmitOutcome::AlreadyPresent(id) => Some(*id),
            SubmitOutcome::Standby(_) | SubmitOutcome::Rejected(_) => None,
        }
    }
}

/// A real navigation asking whether it can adopt a speculative document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationRequest {
    pub navigation_id: NavigationId,
    pub target_url: Url,
    pub disposition: TargetSemantics,
}

impl ActivationRequest {
    pub fn same_tab(navigation_id: NavigationId, target_url: Url) -> Self {
        Self {
            navigation_id,
            target_url,
            disposition: TargetSemantics::SameTab,
        }
    }
}

#[derive(Debug)]
pub enum NavigationStartDecision {
    ProceedNormally,
    DeferCommit(ActivationTicket),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivatedPage {
    pub attempt: AttemptId,
    pub navigation_id: NavigationId,
    /// Where the speculative document ended up after redirects.
    pub url: Url,
    pub candidate: Candidate,
    /// Capabilities held back while speculative, in request order.
    pub deferred_capabilities: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Activated(ActivatedPage),
    NotActivated,
    StillDeferred,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RetiredAttempt {
    pub id: AttemptId,
    pub url: Url,
    pub trigger_class: TriggerClass,
    pub final_status: FinalStatus,
}

#[derive(Debug)]
struct ContextState {
    primary_url: Url,
    session_history: Vec<Url>,
}

pub struct PrerenderRegistry<H: DocumentHostPort, T: TimerPort> {
    config: PrerenderConfig,
    host: H,
    timers: T,
    timer_book: TimerBook,
    ids: AttemptIdAllocator,
    attempts: BTreeMap<AttemptId, Attempt>,
    keys: HashMap<CandidateKey, AttemptId>,
    running: HashMap<TriggerClass, BTreeSet<AttemptId>>,
    non_immediate: HashMap<TriggerClass, VecDeque<AttemptId>>,
    pending_queue: VecDeque<AttemptId>,
    standby: Vec<Candidate>,
    retired: VecDeque<RetiredAttempt>,
    capabilities: CapabilityTable,
    context: ContextState,
    resources: ResourceSignals,
    background: BackgroundTimeoutMonitor,
    coordinator: ActivationCoordinator,
    diagnostics: DiagnosticsSink,
}

impl<H: DocumentHostPort, T: TimerPort> PrerenderRegistry<H, T> {
    pub fn new(config: PrerenderConfig, primary_url: Url, host: H, timers: T) -> Self {
        let background = BackgroundTimeoutMonitor::new(
            config.background_timeout_speculation_rules(),
            config.background_timeout_embedder(),
        );
        let capabilities = config.capability_table();
        Self {
            host,
            timers,
            timer_book: TimerBook::new(),
            ids: AttemptIdAllocator,
            attempts: BTreeMap::new(),
            keys: HashMap::new(),
            running: HashMap::new(),
            non_immediate: HashMap::new(),
            pending_queue: VecDeque::new(),
            standby: Vec::new(),
            retired: VecDeque::new(),
            capabilities,
            context: ContextState {
                session_history: vec![primary_url.clone()],
                primary_url,
            },
            resources: ResourceSignals::default(),
            background,
            coordinator: ActivationCoordinator::new(),
            diagnostics: DiagnosticsSink::disabled(),
            config,
        }
    }

    pub fn with_diagnostics(mut self, sink: DiagnosticsSink) -> Self {
        self.diagnostics = sink;
        self
    }

    // ---- queries ---------------------------------------------------------

    pub fn config(&self) -> &PrerenderConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    pub fn primary_url(&self) -> &Url {
        &self.context.primary_url
    }

    pub fn session_history(&self) -> &[Url] {
        &self.context.session_history
    }

    pub fn is_visible(&self) -> bool {
        self.background.is_visible()
    }

    pub fn attempt(&self, id: AttemptId) -> Option<&Attempt> {
        self.attempts.get(&id)
    }

    pub fn live_attempts(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.values()
    }

    pub fn state(&self, id: AttemptId) -> Option<AttemptState> {
        match self.attempts.get(&id) {
            Some(attempt) => Some(attempt.state()),
            None => self.retired_entry(id).map(|retired| {
                if retired.final_status.is_success() {
                    AttemptState::Activated
                } else {
                    AttemptState::Destroyed
                }
            }),
        }
    }

    /// Final status of a live or retired attempt.
    pub fn final_status(&self, id: AttemptId) -> Option<FinalStatus> {
        self.attempts
            .get(&id)
            .and_then(Attempt::final_status)
            .or_else(|| self.retired_entry(id).map(|r| r.final_status))
    }

    fn retired_entry(&self, id: AttemptId) -> Option<&RetiredAttempt> {
        self.retired.iter().rev().find(|r| r.id == id)
    }

    pub fn retired(&self) -> impl Iterator<Item = &RetiredAttempt> {
        self.retired.iter()
    }

    pub fn running_count(&self, class: TriggerClass) -> usize {
        self.running.get(&class).map_or(0, BTreeSet::len)
    }

    pub fn non_immediate_count(&self, class: TriggerClass) -> usize {
        self.non_immediate.get(&class).map_or(0, VecDeque::len)
    }

    pub fn queued(&self) -> Vec<AttemptId> {
        self.pending_queue.iter().copied().collect()
    }

    pub fn standby(&self) -> &[Candidate] {
        &self.standby
    }

    /// Side-effect-free lookup of the attempt a same-tab navigation to `url`
    /// would adopt.
    pub fn find_best_attempt(&self, url: &Url) -> Option<AttemptId> {
        find_best_attempt(self.attempts.values(), url, TargetSemantics::SameTab)
            .winner
            .map(|m| m.attempt)
    }

    // ---- trigger sources -------------------------------------------------

    pub fn submit(&mut self, candidate: Candidate) -> SubmitOutcome {
        let started = Instant::now();
        let outcome = self.admit(candidate, false);
        self.settle();
        self.diagnostics
            .span_duration(SPAN_REGISTRY_SUBMIT, started.elapsed().as_micros() as u64);
        outcome
    }

    pub fn submit_many(&mut self, candidates: impl IntoIterator<Item = Candidate>) -> Vec<SubmitOutcome> {
        let outcomes = candidates
            .into_iter()
            .map(|candidate| self.admit(candidate, false))
            .collect();
        self.settle();
        outcomes
    }

    /// The trigger source withdrew `key`. Returns whether anything was
    /// removed.
    pub fn remove(&mut self, key: &CandidateKey) -> bool {
        let before = self.standby.len();
        self.standby.retain(|candidate| candidate.key() != *key);
        let mut removed = self.standby.len() != before;
        if let Some(id) = self.keys.get(key).copied() {
            removed |= self.destroy_attempt(id, FinalStatus::TriggerRemoved);
        }
        self.settle();
        removed
    }

    // ---- owning context --------------------------------------------------

    /// Destroys the attempt synchronously. Returns `false` if it was unknown,
    /// already finished, or mid-activation and `reason` cannot interrupt it.
    pub fn cancel_host(&mut self, id: AttemptId, reason: FinalStatus) -> bool {
        let destroyed = self.destroy_attempt(id, reason);
        self.settle();
        destroyed
    }

    pub fn notify_visibility_changed(&mut self, visible: bool) {
        self.background
            .set_visible(visible, &mut self.timer_book, &mut self.timers);
    }

    pub fn notify_navigating_away(&mut self) {
        self.standby.clear();
        self.destroy_all(|_| true, FinalStatus::TriggerDestroyed);
        self.settle();
    }

    /// User interaction on a link to `url`. Promotes matching standby
    /// candidates whose eagerness accepts `signal`.
    pub fn notify_interaction(&mut self, url: &Url, signal: InteractionSignal) -> Vec<SubmitOutcome> {
        let (promoted, kept): (Vec<Candidate>, Vec<Candidate>) =
            std::mem::take(&mut self.standby)
                .into_iter()
                .partition(|c| c.url == *url && c.eagerness.promoted_by(signal));
        self.standby = kept;
        let outcomes = promoted
            .into_iter()
            .map(|candidate| {
                self.diagnostics
                    .message(diagnostics::CHANNEL_ADMISSION_PROMOTED, candidate.url.as_str());
                self.admit(candidate, true)
            })
            .collect();
        self.settle();
        outcomes
    }

    // ---- resource signals ------------------------------------------------

    /// Only a critical level cancels anything.
    pub fn on_memory_pressure(&mut self, level: MemoryPressureLevel) {
        self.resources.memory_pressure = level;
        if level == MemoryPressureLevel::Critical {
            warn!("registry: critical memory pressure, cancelling speculative attempts");
            self.destroy_all(|_| true, FinalStatus::MemoryPressureCritical);
        }
        self.settle();
    }

    pub fn on_memory_footprint(&mut self, used_mib: u64) {
        self.resources.memory_footprint_mib = Some(used_mib);
    }

    pub fn on_network_rtt(&mut self, rtt: Duration) {
        self.resources.network_rtt = Some(rtt);
    }

    // ---- document host signals -------------------------------------------

    pub fn on_redirect(&mut self, id: AttemptId, to: Url) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            debug!("registry: redirect for unknown {id}");
            return;
        };
        let verdict = if !is_navigable_scheme(&to) {
            Err(FinalStatus::InvalidSchemeNavigation)
        } else if !same_site(attempt.initiator(), &to) {
            Err(FinalStatus::CrossSiteRedirect)
        } else {
            let cross_origin = !same_origin(attempt.initiator(), &to);
            match attempt.record_redirect(to) {
                Ok(()) => {
                    if cross_origin {
                        attempt.require_opt_in();
                    }
                    Ok(())
                }
                Err(error) => {
                    warn!("registry: {error}");
                    Ok(())
                }
            }
        };
        if let Err(reason) = verdict {
            self.destroy_attempt(id, reason);
        }
        self.settle();
    }

    pub fn on_headers_received(&mut self, id: AttemptId, headers: ResponseHeaders) {
        self.apply_headers(id, headers);
        self.settle();
    }

    pub fn on_load_finished(&mut self, id: AttemptId, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Failure(reason) => {
                self.destroy_attempt(id, reason);
            }
            LoadOutcome::Success { status } => self.finish_load(id, status),
        }
        self.settle();
    }

    pub fn on_capability_requested(&mut self, id: AttemptId, capability: &str) -> CapabilityPolicy {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            // Activated documents are ordinary pages now.
            return match self.retired_entry(id) {
                Some(retired) if retired.final_status.is_success() => CapabilityPolicy::Grant,
                _ => CapabilityPolicy::Cancel,
            };
        };
        let decision = self.capabilities.evaluate(capability);
        match decision.policy {
            CapabilityPolicy::Grant => {}
            CapabilityPolicy::Defer => {
                attempt.defer_capability(capability);
                self.diagnostics
                    .message(diagnostics::CHANNEL_CAPABILITY_DEFERRED, capability);
            }
            CapabilityPolicy::Cancel => {
                debug!(
                    "registry: {id} requested '{capability}' ({}), cancelling",
                    decision.matched_by
                );
                self.destroy_attempt(id, FinalStatus::PolicyViolation);
                self.settle();
            }
        }
        decision.policy
    }

    pub fn on_crashed(&mut self, id: AttemptId) {
        self.cancel_host(id, FinalStatus::RendererCrashed);
    }

    pub fn on_killed(&mut self, id: AttemptId) {
        self.cancel_host(id, FinalStatus::RendererKilled);
    }

    /// Host-detected failure of the initial navigation (network error, mixed
    /// content, ...).
    pub fn on_navigation_error(&mut self, id: AttemptId, reason: FinalStatus) {
        let reason = if reason.category() == prerender_core::StatusCategory::NavigationFailure {
            reason
        } else {
            warn!("registry: {reason} is not a navigation failure, recording network error");
            FinalStatus::NavigationNetworkError
        };
        self.cancel_host(id, reason);
    }

    /// The speculative document started navigating its own main frame.
    pub fn on_inner_navigation_started(&mut self, id: AttemptId, url: Url) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return;
        };
        if !is_navigable_scheme(&url) || !same_site(attempt.initiator(), &url) {
            self.destroy_attempt(id, FinalStatus::CrossSiteNavigationAfterReady);
        } else if let Err(error) = attempt.start_inner_navigation(url) {
            warn!("registry: {error}");
        }
        self.settle();
    }

    pub fn on_inner_navigation_finished(&mut self, id: AttemptId) {
        if let Some(attempt) = self.attempts.get_mut(&id) {
            attempt.finish_inner_navigation();
        }
        self.settle();
    }

    pub fn on_host_signal(&mut self, id: AttemptId, signal: HostSignal) {
        match signal {
            HostSignal::Redirected(to) => self.on_redirect(id, to),
            HostSignal::HeadersReceived(headers) => self.on_headers_received(id, headers),
            HostSignal::LoadFinished(outcome) => self.on_load_finished(id, outcome),
            HostSignal::CapabilityRequested(capability) => {
                self.on_capability_requested(id, &capability);
            }
            HostSignal::NavigationError(reason) => self.on_navigation_error(id, reason),
            HostSignal::InnerNavigationStarted(url) => self.on_inner_navigation_started(id, url),
            HostSignal::InnerNavigationFinished => self.on_inner_navigation_finished(id),
            HostSignal::Crashed => self.on_crashed(id),
            HostSignal::Killed => self.on_killed(id),
        }
    }

    // ---- real navigation -------------------------------------------------

    pub fn on_navigation_starting(&mut self, request: ActivationRequest) -> NavigationStartDecision {
        let started = Instant::now();
        let decision = self.start_matching(&request, started);
        self.settle();
        self.diagnostics.span_duration(
            SPAN_REGISTRY_NAVIGATION_STARTING,
            started.elapsed().as_micros() as u64,
        );
        decision
    }

    fn start_matching(&mut self, request: &ActivationRequest, now: Instant) -> NavigationStartDecision {
        let outcome = find_best_attempt(
            self.attempts.values(),
            &request.target_url,
            request.disposition,
        );

        for id in outcome.activated_before_started {
            self.destroy_attempt(id, FinalStatus::ActivatedBeforeStarted);
        }

        let Some(winner) = outcome.winner else {
            self.diagnostics
                .message(diagnostics::CHANNEL_MATCH_NONE, request.target_url.as_str());
            return NavigationStartDecision::ProceedNormally;
        };

        // A newer navigation supersedes any commit still deferred.
        for navigation in self.coordinator.navigations() {
            if let Some(previous) = self
                .coordinator
                .fall_back(navigation, FinalStatus::OtherAttemptActivated)
            {
                self.diagnostics
                    .message(diagnostics::CHANNEL_ACTIVATION_FALLBACK, "superseded");
                self.timer_book
                    .disarm(TimerKey::CommitDeferral(navigation), &mut self.timers);
                if previous != winner.attempt {
                    self.destroy_attempt(previous, FinalStatus::ActivationNavigationFailed);
                }
            }
        }

        let losers: Vec<AttemptId> = self
            .attempts
            .keys()
            .copied()
            .filter(|id| *id != winner.attempt)
            .collect();
        for id in losers {
            self.destroy_attempt(id, FinalStatus::OtherAttemptActivated);
        }

        let channel = match winner.kind {
            MatchKind::Exact => diagnostics::CHANNEL_MATCH_EXACT,
            MatchKind::NoVarySearchConfirmed => diagnostics::CHANNEL_MATCH_NO_VARY_SEARCH,
            MatchKind::NoVarySearchPending => diagnostics::CHANNEL_MATCH_WAITING_FOR_HEADERS,
        };
        self.diagnostics.message(channel, request.target_url.as_str());

        if winner.kind == MatchKind::NoVarySearchPending {
            let waiting = self
                .attempts
                .get_mut(&winner.attempt)
                .map(|attempt| attempt.wait_for_headers(request.target_url.clone()));
            match waiting {
                Some(Ok(())) => self.timer_book.arm(
                    TimerKey::HeaderWait(winner.attempt),
                    self.config.header_wait_timeout(),
                    &mut self.timers,
                ),
                Some(Err(error)) => {
                    warn!("registry: {error}");
                    return NavigationStartDecision::ProceedNormally;
                }
                None => return NavigationStartDecision::ProceedNormally,
            }
        }

        debug!(
            "registry: {} adopts {} ({:?})",
            request.navigation_id.0, winner.attempt, winner.kind
        );
        let ticket = self.coordinator.begin(
            request.navigation_id,
            winner.attempt,
            CommitCondition::ALL.to_vec(),
            now,
        );
        self.timer_book.arm(
            TimerKey::CommitDeferral(request.navigation_id),
            self.config.activation_deferral_timeout(),
            &mut self.timers,
        );
        self.diagnostics
            .message(diagnostics::CHANNEL_ACTIVATION_DEFERRED, request.target_url.as_str());
        NavigationStartDecision::DeferCommit(ticket)
    }

    /// The navigation pipeline reached its commit point. `StillDeferred`
    /// means the attempt is not settled yet; ask again once it is.
    pub fn on_commit_ready(&mut self, navigation_id: NavigationId) -> CommitOutcome {
        self.settle();
        if self.coordinator.attempt_for(navigation_id).is_none() {
            return CommitOutcome::NotActivated;
        }
        let Some(id) = self.coordinator.take_ready(navigation_id) else {
            return CommitOutcome::StillDeferred;
        };
        let outcome = self.complete_activation(id, navigation_id);
        self.settle();
        outcome
    }

    /// The real navigation failed while its commit was deferred.
    pub fn on_navigation_failed(&mut self, navigation_id: NavigationId) {
        if let Some(id) = self.coordinator.attempt_for(navigation_id)
            && !self.destroy_attempt(id, FinalStatus::ActivationNavigationFailed)
        {
            self.coordinator
                .fall_back(navigation_id, FinalStatus::ActivationNavigationFailed);
        }
        self.timer_book
            .disarm(TimerKey::CommitDeferral(navigation_id), &mut self.timers);
        self.settle();
    }

    pub fn on_timer_fired(&mut self, ticket: TimerTicket) {
        if !self.timer_book.accept(ticket, &mut self.timers) {
            self.diagnostics
                .message(diagnostics::CHANNEL_TIMER_STALE, "stale");
            return;
        }
        match ticket.key {
            TimerKey::Background(class) => {
                debug!("registry: background timeout for {class}");
                self.destroy_all(
                    |attempt| attempt.candidate().trigger_class == class,
                    FinalStatus::TimeoutBackgrounded,
                );
            }
            TimerKey::HeaderWait(id) => {
                if self
                    .attempts
                    .get(&id)
                    .is_some_and(|a| a.state() == AttemptState::WaitingForHeaders)
                {
                    self.destroy_attempt(id, FinalStatus::TimeoutWaitingForHeaders);
                }
            }
            TimerKey::CommitDeferral(navigation_id) => {
                if !self.coordinator.is_ready_to_commit(navigation_id)
                    && let Some(id) = self.coordinator.attempt_for(navigation_id)
                    && !self.destroy_attempt(id, FinalStatus::ActivationDeferralTimeout)
                {
                    self.coordinator
                        .fall_back(navigation_id, FinalStatus::ActivationDeferralTimeout);
                }
            }
        }
        self.settle();
    }

    pub fn apply_intents(&mut self, intents: impl IntoIterator<Item = PrerenderIntent>) {
        for intent in intents {
            match intent {
                PrerenderIntent::Submit(candidate) => {
                    self.submit(candidate);
                }
                PrerenderIntent::SubmitMany(candidates) => {
                    self.submit_many(candidates);
                }
                PrerenderIntent::Remove(key) => {
                    self.remove(&key);
                }
                PrerenderIntent::CancelHost { attempt, reason } => {
                    self.cancel_host(attempt, reason);
                }
                PrerenderIntent::VisibilityChanged(visible) => {
                    self.notify_visibility_changed(visible)
                }
                PrerenderIntent::NavigatingAway => self.notify_navigating_away(),
                PrerenderIntent::Interaction { url, signal } => {
                    self.notify_interaction(&url, signal);
                }
                PrerenderIntent::MemoryPressureChanged {
                    level,
                    available_mib,
                    total_mib,
                } => {
                    debug!("registry: memory {level:?} ({available_mib} of {total_mib} MiB free)");
                    self.on_memory_pressure(level);
                }
                PrerenderIntent::MemoryFootprint { used_mib } => self.on_memory_footprint(used_mib),
                PrerenderIntent::NetworkRtt(rtt) => self.on_network_rtt(rtt),
                PrerenderIntent::Host { attempt, signal } => self.on_host_signal(attempt, signal),
                PrerenderIntent::TimerFired(ticket) => self.on_timer_fired(ticket),
            }
        }
    }

    // ---- internals -------------------------------------------------------

    fn reject(&self, class: TriggerClass, reason: FinalStatus) -> SubmitOutcome {
        debug!("registry: rejected {class} candidate: {reason}");
        self.diagnostics.emit(DiagnosticEvent::AdmissionRejected {
            trigger_class: class,
            final_status: reason,
        });
        SubmitOutcome::Rejected(reason)
    }

    fn admit(&mut self, candidate: Candidate, promoted: bool) -> SubmitOutcome {
        let key = candidate.key();
        if let Some(id) = self.keys.get(&key) {
            self.diagnostics
                .message(diagnostics::CHANNEL_ADMISSION_DUPLICATE, candidate.url.as_str());
            return SubmitOutcome::AlreadyPresent(*id);
        }

        let class = candidate.trigger_class;
        let requires_opt_in = match admission::check_eligibility(
            &candidate,
            &self.context.primary_url,
            &self.resources,
            &self.config,
        ) {
            Eligibility::Eligible { requires_opt_in } => requires_opt_in,
            Eligibility::Ineligible(reason) => return self.reject(class, reason),
        };

        if class.is_speculation_rule() && !promoted && !candidate.eagerness.starts_on_submit() {
            if !self.standby.iter().any(|c| c.key() == key) {
                self.diagnostics
                    .message(diagnostics::CHANNEL_ADMISSION_STANDBY, candidate.url.as_str());
                self.standby.push(candidate);
            }
            return SubmitOutcome::Standby(key);
        }

        let bucket = admission::bucket_for(&candidate);
        let (in_use, oldest) = match bucket {
            SlotBucket::Immediate => (self.running_count(class), None),
            SlotBucket::NonImmediate => (
                self.non_immediate_count(class),
                self.non_immediate
                    .get(&class)
                    .and_then(|queue| queue.front().copied()),
            ),
        };

        match admission::decide_slot(class, bucket, in_use, &self.config, oldest) {
            SlotDecision::Reject(reason) => self.reject(class, reason),
            SlotDecision::Queue => {
                let id = self.create_attempt(candidate, requires_opt_in);
                self.pending_queue.push_back(id);
                self.diagnostics
                    .message(diagnostics::CHANNEL_ADMISSION_QUEUED, key.url.as_str());
                SubmitOutcome::Queued(id)
            }
            SlotDecision::Start => {
                let id = self.create_attempt(candidate, requires_opt_in);
                self.start_attempt(id, bucket);
                SubmitOutcome::Started(id)
            }
            SlotDecision::StartEvicting(oldest) => {
                self.diagnostics
                    .message(diagnostics::CHANNEL_ADMISSION_EVICTED, key.url.as_str());
                self.destroy_attempt(oldest, FinalStatus::NonImmediateLimitExceeded);
                let id = self.create_attempt(candidate, requires_opt_in);
                self.start_attempt(id, bucket);
                SubmitOutcome::Started(id)
            }
        }
    }

    fn create_attempt(&mut self, candidate: Candidate, requires_opt_in: bool) -> AttemptId {
        let id = self.ids.next();
        let initiator = admission::initiator_for(&candidate, &self.context.primary_url);
        self.keys.insert(candidate.key(), id);
        let attempt = Attempt::new(id, Arc::new(candidate), initiator, requires_opt_in, Instant::now());
        self.attempts.insert(id, attempt);
        id
    }

    fn start_attempt(&mut self, id: AttemptId, bucket: SlotBucket) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return;
        };
        if let Err(error) = attempt.start() {
            warn!("registry: {error}");
            return;
        }
        let class = attempt.candidate().trigger_class;
        match bucket {
            SlotBucket::Immediate => {
                self.running.entry(class).or_default().insert(id);
            }
            SlotBucket::NonImmediate => {
                self.non_immediate.entry(class).or_default().push_back(id);
            }
        }
        debug!("registry: {id} running {}", attempt.url());
        self.diagnostics
            .message(diagnostics::CHANNEL_ADMISSION_STARTED, attempt.url().as_str());
        self.host.start_navigation(id, attempt.candidate());
        self.background
            .attempt_started(class, &mut self.timer_book, &mut self.timers);
    }

    fn apply_headers(&mut self, id: AttemptId, headers: ResponseHeaders) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            debug!("registry: headers for unknown {id}");
            return;
        };
        if !attempt.is_loading() {
            warn!("registry: unexpected headers for {id} in {:?}", attempt.state());
            return;
        }
        if let Err(reason) = headers.classify() {
            self.destroy_attempt(id, reason);
            return;
        }
        if attempt.requires_opt_in() && !headers.opts_into_cross_origin_prerender() {
            self.destroy_attempt(id, FinalStatus::SameSiteCrossOriginNoOptIn);
            return;
        }

        let waiting_for = attempt.awaiting_headers_for().cloned();
        let confirmed = waiting_for.as_ref().map(|target| {
            headers
                .no_vary_search()
                .is_some_and(|nvs| nvs.equivalent(attempt.url(), target))
        });
        if let Err(error) = attempt.record_headers(headers) {
            warn!("registry: {error}");
            return;
        }

        match confirmed {
            None => {}
            Some(true) => {
                self.timer_book
                    .disarm(TimerKey::HeaderWait(id), &mut self.timers);
                if let Err(error) = attempt.headers_confirmed(Instant::now()) {
                    warn!("registry: {error}");
                }
            }
            Some(false) => {
                self.destroy_attempt(id, FinalStatus::HeaderMismatch);
            }
        }
    }

    fn finish_load(&mut self, id: AttemptId, status: u16) {
        let Some(attempt) = self.attempts.get(&id) else {
            return;
        };
        if !attempt.is_loading() {
            warn!("registry: unexpected load completion for {id} in {:?}", attempt.state());
            return;
        }
        if !attempt.headers_received() {
            match StatusCode::from_u16(status) {
                Ok(code) => self.apply_headers(id, ResponseHeaders::new(code)),
                Err(_) => {
                    self.destroy_attempt(id, FinalStatus::BadHttpStatus);
                    return;
                }
            }
        }
        if let Some(attempt) = self.attempts.get_mut(&id)
            && attempt.final_status().is_none()
            && let Err(error) = attempt.mark_ready(Instant::now())
        {
            warn!("registry: {error}");
        }
    }

    fn release_slot(&mut self, id: AttemptId, class: TriggerClass) {
        if let Some(set) = self.running.get_mut(&class) {
            set.remove(&id);
        }
        if let Some(queue) = self.non_immediate.get_mut(&class) {
            queue.retain(|other| *other != id);
        }
        self.pending_queue.retain(|other| *other != id);
    }

    fn retire(&mut self, attempt: Attempt, final_status: FinalStatus) {
        let class = attempt.candidate().trigger_class;
        self.keys.remove(&attempt.candidate().key());
        self.diagnostics.emit(DiagnosticEvent::AttemptFinished {
            attempt: attempt.id(),
            trigger_class: class,
            final_status,
        });
        self.retired.push_back(RetiredAttempt {
            id: attempt.id(),
            url: attempt.url().clone(),
            trigger_class: class,
            final_status,
        });
        while self.retired.len() > self.config.retired_history_limit {
            self.retired.pop_front();
        }
    }

    /// Destroys and forgets one attempt. Does not refill slots; callers go
    /// through `settle` once their whole mutation is done.
    fn destroy_attempt(&mut self, id: AttemptId, reason: FinalStatus) -> bool {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return false;
        };
        let was_started = attempt.state() != AttemptState::Pending;
        if let Err(error) = attempt.destroy(reason) {
            debug!("registry: {error}");
            return false;
        }
        let Some(attempt) = self.attempts.remove(&id) else {
            return false;
        };
        let class = attempt.candidate().trigger_class;
        debug!("registry: {id} destroyed: {reason}");

        self.release_slot(id, class);
        self.timer_book
            .disarm(TimerKey::HeaderWait(id), &mut self.timers);
        if let Some(navigation) = self.coordinator.deferral_for_attempt(id) {
            self.coordinator.fall_back(navigation, reason);
            self.timer_book
                .disarm(TimerKey::CommitDeferral(navigation), &mut self.timers);
            self.diagnostics
                .message(diagnostics::CHANNEL_ACTIVATION_FALLBACK, reason.as_str());
        }
        if was_started {
            self.host.release(id, reason);
        }
        self.retire(attempt, reason);
        true
    }

    fn destroy_all(&mut self, filter: impl Fn(&Attempt) -> bool, reason: FinalStatus) {
        let doomed: Vec<AttemptId> = self
            .attempts
            .values()
            .filter(|attempt| filter(*attempt))
            .map(Attempt::id)
            .collect();
        for id in doomed {
            self.destroy_attempt(id, reason);
        }
    }

    fn complete_activation(&mut self, id: AttemptId, navigation_id: NavigationId) -> CommitOutcome {
        self.timer_book
            .disarm(TimerKey::CommitDeferral(navigation_id), &mut self.timers);
        let Some(mut attempt) = self.attempts.remove(&id) else {
            return CommitOutcome::NotActivated;
        };
        if let Err(error) = attempt.complete_activation() {
            warn!("registry: {error}");
            self.attempts.insert(id, attempt);
            self.destroy_attempt(id, FinalStatus::ActivationNavigationFailed);
            return CommitOutcome::NotActivated;
        }
        let class = attempt.candidate().trigger_class;
        self.release_slot(id, class);
        self.host.activate(id, navigation_id);

        let url = attempt.document_url().clone();
        let page = ActivatedPage {
            attempt: id,
            navigation_id,
            url: url.clone(),
            candidate: attempt.candidate().clone(),
            deferred_capabilities: attempt.take_deferred_capabilities(),
        };
        info!("registry: activated {id} for {url}");
        self.diagnostics
            .message(diagnostics::CHANNEL_ACTIVATION_COMMITTED, url.as_str());
        self.retire(attempt, FinalStatus::Activated);

        self.context.session_history.push(url.clone());
        self.context.primary_url = url;

        // The old document is gone; nothing speculated from it survives.
        self.standby.clear();
        self.destroy_all(|_| true, FinalStatus::TriggerDestroyed);

        CommitOutcome::Activated(page)
    }

    /// Re-evaluates deferred commits and refills free slots from the queue.
    fn settle(&mut self) {
        for navigation in self.coordinator.navigations() {
            let Some(id) = self.coordinator.attempt_for(navigation) else {
                continue;
            };
            let conditions = self.coordinator.evaluate(navigation, self.attempts.get(&id));
            if self.coordinator.is_ready_to_commit(navigation) {
                // An inner navigation started after the commit was allowed.
                if conditions == ConditionState::Pending && self.coordinator.reopen(navigation) {
                    debug!("registry: commit for {id} waits again");
                    self.timer_book.arm(
                        TimerKey::CommitDeferral(navigation),
                        self.config.activation_deferral_timeout(),
                        &mut self.timers,
                    );
                }
                continue;
            }
            match conditions {
                ConditionState::Pending => {}
                ConditionState::Satisfied => {
                    if let Some(attempt) = self.attempts.get_mut(&id)
                        && attempt.state() == AttemptState::Ready
                        && let Err(error) = attempt.begin_activation()
                    {
                        warn!("registry: {error}");
                        continue;
                    }
                    self.timer_book
                        .disarm(TimerKey::CommitDeferral(navigation), &mut self.timers);
                    self.coordinator.mark_ready(navigation);
                }
                ConditionState::Failed(reason) => {
                    self.coordinator.fall_back(navigation, reason);
                    self.timer_book
                        .disarm(TimerKey::CommitDeferral(navigation), &mut self.timers);
                }
            }
        }
        self.fill_free_slots();
    }

    fn fill_free_slots(&mut self) {
        let mut index = 0;
        while index < self.pending_queue.len() {
            let id = self.pending_queue[index];
            let Some(class) = self
                .attempts
                .get(&id)
                .filter(|a| a.state() == AttemptState::Pending)
                .map(|a| a.candidate().trigger_class)
            else {
                self.pending_queue.remove(index);
                continue;
            };
            let limit = if class == TriggerClass::Embedder {
                self.config.embedder_limit
            } else {
                self.config.speculation_rule_limit
            };
            if self.running_count(class) < limit {
                self.pending_queue.remove(index);
                self.start_attempt(id, SlotBucket::Immediate);
            } else {
                index += 1;
            }
        }
    }
}

impl<H: DocumentHostPort, T: TimerPort> std::fmt::Debug for PrerenderRegistry<H, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrerenderRegistry")
            .field("primary_url", &self.context.primary_url.as_str())
            .field("attempts", &self.attempts.len())
            .field("queued", &self.pending_queue.len())
            .field("standby", &self.standby.len())
            .field("visible", &self.background.is_visible())
            .finish()
    }
}
