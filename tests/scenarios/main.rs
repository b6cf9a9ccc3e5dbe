/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::time::Duration;

use prerender::replay::{self, Scenario};
use prerender::test_utils::{TestHarness, url};
use prerender::{
    ActivationRequest, AttemptState, Candidate, CommitOutcome, ControlPanel, Eagerness,
    FinalStatus, LoadOutcome, NavigationId, NavigationStartDecision, NoVarySearch,
    PrerenderConfig, PrerenderRegistry, ResponseHeaders, SubmitOutcome, TimerKey, TriggerClass,
    VERSION,
};
use prerender::replay::RecordingHost;

const PRIMARY: &str = "https://www.shop.test/";

fn rule(raw: &str) -> Candidate {
    Candidate::new(url(raw), TriggerClass::SpeculationRule)
}

fn load_ok(harness: &mut TestHarness, id: prerender::AttemptId) {
    harness.registry.on_headers_received(id, ResponseHeaders::ok());
    harness
        .registry
        .on_load_finished(id, LoadOutcome::Success { status: 200 });
}

fn navigate(harness: &mut TestHarness, nav: u64, target: &str) -> NavigationStartDecision {
    harness
        .registry
        .on_navigation_starting(ActivationRequest::same_tab(NavigationId(nav), url(target)))
}

#[test]
fn scenarios_binary_smoke_runs() {
    assert!(!VERSION.is_empty());
}

#[test]
fn admission_cap_queues_and_promotes_within_the_same_turn() {
    let limit = 3;
    let mut harness = TestHarness::with_config(
        PRIMARY,
        PrerenderConfig {
            speculation_rule_limit: limit,
            ..PrerenderConfig::default()
        },
    );
    let outcomes: Vec<SubmitOutcome> = (0..=limit)
        .map(|n| harness.registry.submit(rule(&format!("https://www.shop.test/{n}"))))
        .collect();

    let running: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            SubmitOutcome::Started(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(running.len(), limit);
    let SubmitOutcome::Queued(queued) = outcomes[limit] else {
        panic!("the candidate past the cap should queue");
    };

    assert!(harness.registry.cancel_host(running[1], FinalStatus::TriggerRemoved));
    assert_eq!(harness.registry.state(queued), Some(AttemptState::Running));
    assert_eq!(harness.registry.state(running[1]), Some(AttemptState::Destroyed));
    assert!(harness.registry.queued().is_empty());
}

#[test]
fn cancelled_queued_candidate_is_skipped_without_reordering() {
    let mut harness = TestHarness::with_config(
        PRIMARY,
        PrerenderConfig {
            speculation_rule_limit: 1,
            ..PrerenderConfig::default()
        },
    );
    let first = harness.registry.submit(rule("https://www.shop.test/1")).attempt().unwrap();
    let ids: Vec<_> = (2..=4)
        .map(|n| {
            harness
                .registry
                .submit(rule(&format!("https://www.shop.test/{n}")))
                .attempt()
                .unwrap()
        })
        .collect();

    harness.registry.cancel_host(ids[0], FinalStatus::TriggerRemoved);
    assert_eq!(harness.registry.queued(), vec![ids[1], ids[2]]);

    harness.registry.cancel_host(first, FinalStatus::TriggerRemoved);
    assert_eq!(harness.registry.state(ids[1]), Some(AttemptState::Running));
    assert_eq!(harness.registry.queued(), vec![ids[2]]);
}

#[test]
fn exactly_one_attempt_activates_per_navigation() {
    let mut harness = TestHarness::new(PRIMARY);
    let target = "https://www.shop.test/deal";
    let from_rules = harness.registry.submit(rule(target)).attempt().unwrap();
    let from_embedder = harness
        .registry
        .submit(Candidate::new(url(target), TriggerClass::Embedder))
        .attempt()
        .unwrap();
    load_ok(&mut harness, from_rules);
    load_ok(&mut harness, from_embedder);

    let NavigationStartDecision::DeferCommit(ticket) = navigate(&mut harness, 1, target) else {
        panic!("a ready attempt should be adopted");
    };
    // First to become ready wins.
    assert_eq!(ticket.attempt, from_rules);
    assert!(matches!(
        harness.registry.on_commit_ready(NavigationId(1)),
        CommitOutcome::Activated(_)
    ));

    assert_eq!(harness.registry.final_status(from_rules), Some(FinalStatus::Activated));
    assert_eq!(
        harness.registry.final_status(from_embedder),
        Some(FinalStatus::OtherAttemptActivated)
    );
    let diagnostics = harness.diagnostics();
    assert_eq!(
        diagnostics.final_status_count(TriggerClass::SpeculationRule, FinalStatus::Activated),
        1
    );
    assert_eq!(
        diagnostics.final_status_count(TriggerClass::Embedder, FinalStatus::OtherAttemptActivated),
        1
    );
}

#[test]
fn exact_match_activation_issues_no_new_request() {
    let mut harness = TestHarness::new(PRIMARY);
    let target = "https://www.shop.test/cart";
    let id = harness.registry.submit(rule(target)).attempt().unwrap();
    load_ok(&mut harness, id);

    assert!(matches!(
        navigate(&mut harness, 1, target),
        NavigationStartDecision::DeferCommit(_)
    ));
    harness.registry.on_commit_ready(NavigationId(1));

    let host: &RecordingHost = harness.registry.host();
    assert_eq!(host.navigations_to(&url(target)), 1);
    assert_eq!(host.activated(), vec![id]);
}

#[test]
fn redirected_attempt_stays_keyed_by_its_original_url() {
    let mut harness = TestHarness::new(PRIMARY);
    let id = harness
        .registry
        .submit(rule("https://www.shop.test/go?to=/final"))
        .attempt()
        .unwrap();
    harness.registry.on_redirect(id, url("https://www.shop.test/final"));

    assert_eq!(
        harness.registry.find_best_attempt(&url("https://www.shop.test/go?to=/final")),
        Some(id)
    );
    assert_eq!(harness.registry.find_best_attempt(&url("https://www.shop.test/final")), None);
}

#[test]
fn header_hint_timeout_lets_the_navigation_proceed() {
    let mut harness = TestHarness::new(PRIMARY);
    let hint = NoVarySearch::parse(r#"params=("ref")"#).unwrap();
    let id = harness
        .registry
        .submit(rule("https://www.shop.test/item?sku=9").with_hint(hint))
        .attempt()
        .unwrap();

    let NavigationStartDecision::DeferCommit(mut ticket) =
        navigate(&mut harness, 1, "https://www.shop.test/item?sku=9&ref=ad")
    else {
        panic!("hint match should defer the commit");
    };
    assert_eq!(harness.registry.state(id), Some(AttemptState::WaitingForHeaders));
    assert!(harness.fire(TimerKey::HeaderWait(id)));

    assert_eq!(
        harness.registry.final_status(id),
        Some(FinalStatus::TimeoutWaitingForHeaders)
    );
    assert!(matches!(
        ticket.resolution.try_recv(),
        Ok(prerender::CommitResolution::Fallback { .. })
    ));
    assert_eq!(
        harness.registry.on_commit_ready(NavigationId(1)),
        CommitOutcome::NotActivated
    );
}

#[test]
fn hiding_twice_starts_each_background_timer_once() {
    let mut harness = TestHarness::new(PRIMARY);
    harness.registry.submit(rule("https://www.shop.test/a"));

    harness.registry.notify_visibility_changed(false);
    let scheduled = harness.registry.timers().schedule_count();
    harness.registry.notify_visibility_changed(false);
    assert_eq!(harness.registry.timers().schedule_count(), scheduled);
    assert_eq!(scheduled, TriggerClass::ALL.len());

    harness.registry.notify_visibility_changed(true);
    assert!(harness.registry.timers().armed_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn short_backgrounding_never_cancels() {
    let mut panel = ControlPanel::new();
    let timers = panel.timer_port(tokio::runtime::Handle::current());
    let mut registry = PrerenderRegistry::new(
        PrerenderConfig::default(),
        url(PRIMARY),
        RecordingHost::new(),
        timers,
    );
    let id = registry
        .submit(Candidate::new(url("https://news.test/"), TriggerClass::Embedder))
        .attempt()
        .unwrap();

    registry.notify_visibility_changed(false);
    tokio::time::advance(Duration::from_secs(10)).await;
    registry.notify_visibility_changed(true);
    registry.notify_visibility_changed(false);
    tokio::time::advance(Duration::from_secs(15)).await;
    tokio::task::yield_now().await;
    registry.apply_intents(panel.drain_pending());
    assert_eq!(registry.state(id), Some(AttemptState::Running));

    registry.notify_visibility_changed(true);
    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    registry.apply_intents(panel.drain_pending());
    assert_eq!(registry.state(id), Some(AttemptState::Running));

    registry.notify_visibility_changed(false);
    let fired = panel.next_intent().await.expect("embedder timer should fire");
    registry.apply_intents([fired]);
    assert_eq!(registry.final_status(id), Some(FinalStatus::TimeoutBackgrounded));

    panel.shutdown().await;
}

#[test]
fn cap_of_one_scenario() {
    let mut harness = TestHarness::with_config(
        PRIMARY,
        PrerenderConfig {
            speculation_rule_limit: 1,
            ..PrerenderConfig::default()
        },
    );
    let first = harness.registry.submit(rule("https://www.shop.test/1"));
    let second = harness.registry.submit(rule("https://www.shop.test/2"));
    let (SubmitOutcome::Started(first), SubmitOutcome::Queued(second)) = (first, second) else {
        panic!("expected one running and one queued attempt");
    };

    harness.registry.cancel_host(first, FinalStatus::TriggerRemoved);
    assert_eq!(harness.registry.state(second), Some(AttemptState::Running));
    load_ok(&mut harness, second);
    navigate(&mut harness, 1, "https://www.shop.test/2");
    assert!(matches!(
        harness.registry.on_commit_ready(NavigationId(1)),
        CommitOutcome::Activated(_)
    ));

    assert_eq!(harness.registry.final_status(first), Some(FinalStatus::TriggerRemoved));
    assert_eq!(harness.registry.final_status(second), Some(FinalStatus::Activated));
    let diagnostics = harness.diagnostics();
    assert_eq!(
        diagnostics.rejection_count(TriggerClass::SpeculationRule, FinalStatus::ConcurrencyLimitExceeded),
        0
    );
}

#[test]
fn unsupported_scheme_never_creates_an_attempt() {
    let mut harness = TestHarness::new(PRIMARY);
    assert_eq!(
        harness.registry.submit(Candidate::new(url("ftp://www.shop.test/file"), TriggerClass::Embedder)),
        SubmitOutcome::Rejected(FinalStatus::UnsupportedScheme)
    );
    assert_eq!(harness.registry.live_attempts().count(), 0);
    assert!(harness.registry.host().events().is_empty());
    assert_eq!(
        harness
            .diagnostics()
            .rejection_count(TriggerClass::Embedder, FinalStatus::UnsupportedScheme),
        1
    );
}

#[test]
fn cross_site_redirect_forces_a_fresh_request() {
    let mut harness = TestHarness::new("https://a.test/");
    let id = harness
        .registry
        .submit(Candidate::new(url("https://a.test/start"), TriggerClass::Embedder))
        .attempt()
        .unwrap();
    harness.registry.on_redirect(id, url("https://b.test/x"));
    assert_eq!(harness.registry.final_status(id), Some(FinalStatus::CrossSiteRedirect));

    assert!(matches!(
        navigate(&mut harness, 1, "https://a.test/start"),
        NavigationStartDecision::ProceedNormally
    ));
}

#[test]
fn final_status_is_recorded_exactly_once() {
    let mut harness = TestHarness::new(PRIMARY);
    let id = harness.registry.submit(rule("https://www.shop.test/a")).attempt().unwrap();
    assert!(harness.registry.cancel_host(id, FinalStatus::TriggerRemoved));
    assert!(!harness.registry.cancel_host(id, FinalStatus::RendererCrashed));
    harness.registry.on_memory_pressure(prerender::MemoryPressureLevel::Critical);

    assert_eq!(harness.registry.final_status(id), Some(FinalStatus::TriggerRemoved));
    let diagnostics = harness.diagnostics();
    assert_eq!(diagnostics.final_status_of(id), Some(FinalStatus::TriggerRemoved));
    assert_eq!(
        diagnostics.final_status_count(TriggerClass::SpeculationRule, FinalStatus::TriggerRemoved),
        1
    );
    assert_eq!(
        diagnostics.final_status_count(TriggerClass::SpeculationRule, FinalStatus::RendererCrashed),
        0
    );
}

#[test]
fn conservative_candidate_starts_on_pointer_down() {
    let mut harness = TestHarness::new(PRIMARY);
    let candidate = rule("https://www.shop.test/a").with_eagerness(Eagerness::Conservative);
    assert!(matches!(harness.registry.submit(candidate), SubmitOutcome::Standby(_)));

    let outcomes = harness
        .registry
        .notify_interaction(&url("https://www.shop.test/a"), prerender::InteractionSignal::PointerDown);
    assert!(matches!(outcomes.as_slice(), [SubmitOutcome::Started(_)]));
}

#[test]
fn bundled_demo_scenario_replays() {
    let scenario = Scenario::from_toml_str(include_str!("../../demos/checkout.toml")).unwrap();
    let report = replay::run(&scenario, PrerenderConfig::default()).unwrap();

    assert_eq!(
        report.attempt("checkout").and_then(|a| a.final_status),
        Some(FinalStatus::Activated)
    );
    assert_eq!(
        report.attempt("tracker").and_then(|a| a.final_status),
        Some(FinalStatus::CrossSiteRedirect)
    );
    assert_eq!(report.primary_url.as_str(), "https://www.shop.test/checkout?step=1");
}
