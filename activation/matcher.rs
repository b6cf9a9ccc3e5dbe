/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Picks which live attempt, if any, a real navigation adopts.
//!
//! Exact url matches always beat `No-Vary-Search` matches. Within a tier the
//! first attempt to become ready wins; attempts that are not ready yet rank
//! after every ready one, and remaining ties go to the lower (earlier
//! created) attempt id.

use std::cmp::Ordering;

use prerender_core::{AttemptId, TargetSemantics};
use serde::Serialize;
use url::Url;

use crate::lifecycle::{Attempt, AttemptState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    /// Response headers already confirmed the hint.
    NoVarySearchConfirmed,
    /// Hint matches but headers have not arrived yet.
    NoVarySearchPending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptMatch {
    pub attempt: AttemptId,
    pub kind: MatchKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub winner: Option<AttemptMatch>,
    /// Exact matches that never got a slot. They can only be destroyed.
    pub activated_before_started: Vec<AttemptId>,
}

fn adoptable(state: AttemptState) -> bool {
    matches!(
        state,
        AttemptState::Running | AttemptState::WaitingForHeaders | AttemptState::Ready
    )
}

fn rank(a: &Attempt, b: &Attempt) -> Ordering {
    match (a.ready_at(), b.ready_at()) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id().cmp(&b.id()))
}

fn hint_match(attempt: &Attempt, target: &Url) -> Option<MatchKind> {
    let hint = attempt.candidate().url_match_hint.as_ref()?;
    if !hint.equivalent(attempt.url(), target) {
        return None;
    }
    match attempt.headers() {
        None => Some(MatchKind::NoVarySearchPending),
        Some(headers) => headers
            .no_vary_search()
            .filter(|authoritative| authoritative.equivalent(attempt.url(), target))
            .map(|_| MatchKind::NoVarySearchConfirmed),
    }
}

pub fn find_best_attempt<'a>(
    attempts: impl IntoIterator<Item = &'a Attempt>,
    target: &Url,
    disposition: TargetSemantics,
) -> MatchOutcome {
    let mut exact: Vec<&Attempt> = Vec::new();
    let mut approximate: Vec<(&Attempt, MatchKind)> = Vec::new();
    let mut activated_before_started = Vec::new();

    for attempt in attempts {
        if attempt.candidate().target_semantics != disposition {
            continue;
        }
        let state = attempt.state();
        if attempt.url() == target {
            if state == AttemptState::Pending {
                activated_before_started.push(attempt.id());
            } else if adoptable(state) {
                exact.push(attempt);
            }
        } else if adoptable(state)
            && let Some(kind) = hint_match(attempt, target)
        {
            approximate.push((attempt, kind));
        }
    }

    let winner = if let Some(best) = exact.into_iter().min_by(|a, b| rank(a, b)) {
        Some(AttemptMatch {
            attempt: best.id(),
            kind: MatchKind::Exact,
        })
    } else {
        approximate
            .into_iter()
            .min_by(|(a, a_kind), (b, b_kind)| {
                let confirmed = |kind: &MatchKind| *kind != MatchKind::NoVarySearchConfirmed;
                confirmed(a_kind)
                    .cmp(&confirmed(b_kind))
                    .then_with(|| rank(a, b))
            })
            .map(|(attempt, kind)| AttemptMatch {
                attempt: attempt.id(),
                kind,
            })
    };

    MatchOutcome {
        winner,
        activated_before_started,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use prerender_core::{Candidate, NoVarySearch, TriggerClass};

    use crate::lifecycle::ResponseHeaders;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn attempt(raw: u64, candidate: Candidate) -> Attempt {
        let initiator = candidate.url.clone();
        Attempt::new(
            AttemptId::from_raw(raw),
            Arc::new(candidate),
            initiator,
            false,
            Instant::now(),
        )
    }

    fn ready(mut attempt: Attempt, at: Instant) -> Attempt {
        attempt.start().unwrap();
        attempt.record_headers(ResponseHeaders::ok()).unwrap();
        attempt.mark_ready(at).unwrap();
        attempt
    }

    fn rule(s: &str) -> Candidate {
        Candidate::new(url(s), TriggerClass::SpeculationRule)
    }

    #[test]
    fn first_ready_exact_match_wins() {
        let base = Instant::now();
        let late = ready(attempt(1, rule("https://a.test/x")), base + Duration::from_millis(5));
        let early = ready(attempt(2, rule("https://a.test/x")), base);
        let outcome = find_best_attempt([&late, &early], &url("https://a.test/x"), TargetSemantics::SameTab);
        assert_eq!(
            outcome.winner,
            Some(AttemptMatch {
                attempt: AttemptId::from_raw(2),
                kind: MatchKind::Exact
            })
        );
    }

    #[test]
    fn simultaneous_readiness_falls_back_to_creation_order() {
        let at = Instant::now();
        let second = ready(attempt(8, rule("https://a.test/x")), at);
        let first = ready(attempt(3, rule("https://a.test/x")), at);
        let outcome = find_best_attempt([&second, &first], &url("https://a.test/x"), TargetSemantics::SameTab);
        assert_eq!(outcome.winner.map(|m| m.attempt), Some(AttemptId::from_raw(3)));
    }

    #[test]
    fn ready_beats_running_for_exact_match() {
        let mut running = attempt(1, rule("https://a.test/x"));
        running.start().unwrap();
        let done = ready(attempt(2, rule("https://a.test/x")), Instant::now());
        let outcome = find_best_attempt([&running, &done], &url("https://a.test/x"), TargetSemantics::SameTab);
        assert_eq!(outcome.winner.map(|m| m.attempt), Some(AttemptId::from_raw(2)));
    }

    #[test]
    fn exact_beats_hint_match() {
        let hinted = ready(
            attempt(
                1,
                rule("https://a.test/s?q=1&utm=a").with_hint(NoVarySearch::parse(r#"params=("utm")"#).unwrap()),
            ),
            Instant::now(),
        );
        let exact = ready(attempt(2, rule("https://a.test/s?q=1")), Instant::now());
        let outcome = find_best_attempt([&hinted, &exact], &url("https://a.test/s?q=1"), TargetSemantics::SameTab);
        assert_eq!(outcome.winner.map(|m| m.kind), Some(MatchKind::Exact));
    }

    #[test]
    fn hint_without_headers_is_pending() {
        let mut hinted = attempt(
            1,
            rule("https://a.test/s?q=1&utm=a").with_hint(NoVarySearch::parse(r#"params=("utm")"#).unwrap()),
        );
        hinted.start().unwrap();
        let outcome = find_best_attempt([&hinted], &url("https://a.test/s?q=1&utm=b"), TargetSemantics::SameTab);
        assert_eq!(outcome.winner.map(|m| m.kind), Some(MatchKind::NoVarySearchPending));
    }

    #[test]
    fn hint_needs_authoritative_header_once_headers_arrived() {
        let mut unconfirmed = attempt(
            1,
            rule("https://a.test/s?q=1&utm=a").with_hint(NoVarySearch::parse(r#"params=("utm")"#).unwrap()),
        );
        unconfirmed.start().unwrap();
        unconfirmed.record_headers(ResponseHeaders::ok()).unwrap();
        let target = url("https://a.test/s?q=1&utm=b");
        assert_eq!(
            find_best_attempt([&unconfirmed], &target, TargetSemantics::SameTab).winner,
            None
        );

        let mut confirmed = attempt(
            2,
            rule("https://a.test/s?q=1&utm=a").with_hint(NoVarySearch::parse(r#"params=("utm")"#).unwrap()),
        );
        confirmed.start().unwrap();
        confirmed
            .record_headers(
                ResponseHeaders::from_pairs(200, [("no-vary-search", r#"params=("utm")"#)]).unwrap(),
            )
            .unwrap();
        assert_eq!(
            find_best_attempt([&confirmed], &target, TargetSemantics::SameTab)
                .winner
                .map(|m| m.kind),
            Some(MatchKind::NoVarySearchConfirmed)
        );
    }

    #[test]
    fn pending_exact_match_is_reported_not_adopted() {
        let queued = attempt(4, rule("https://a.test/x"));
        let outcome = find_best_attempt([&queued], &url("https://a.test/x"), TargetSemantics::SameTab);
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.activated_before_started, vec![AttemptId::from_raw(4)]);
    }

    #[test]
    fn disposition_must_match_target_semantics() {
        let new_tab = ready(
            attempt(1, rule("https://a.test/x").with_target(TargetSemantics::NewTab)),
            Instant::now(),
        );
        assert_eq!(
            find_best_attempt([&new_tab], &url("https://a.test/x"), TargetSemantics::SameTab).winner,
            None
        );
        assert!(
            find_best_attempt([&new_tab], &url("https://a.test/x"), TargetSemantics::NewTab)
                .winner
                .is_some()
        );
    }

    #[test]
    fn redirect_target_never_matches() {
        let mut redirected = attempt(1, rule("https://a.test/go?to=/final"));
        redirected.start().unwrap();
        redirected.record_redirect(url("https://a.test/final")).unwrap();
        assert_eq!(
            find_best_attempt([&redirected], &url("https://a.test/final"), TargetSemantics::SameTab).winner,
            None
        );
        assert!(
            find_best_attempt([&redirected], &url("https://a.test/go?to=/final"), TargetSemantics::SameTab)
                .winner
                .is_some()
        );
    }
}
