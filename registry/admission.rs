/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Admission gates, evaluated in order and short-circuiting:
//! scheme, origin, resources, then the per-class concurrency slot.

use std::time::Duration;

use prerender_core::{
    AttemptId, Candidate, FinalStatus, TriggerClass, is_navigable_scheme, same_origin, same_site,
};
use url::Url;

use crate::runtime::config::PrerenderConfig;
use crate::runtime::memory::MemoryPressureLevel;

/// Latest resource observations fed into the resource gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceSignals {
    pub memory_pressure: MemoryPressureLevel,
    pub memory_footprint_mib: Option<u64>,
    pub network_rtt: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    /// `requires_opt_in`: same-site cross-origin; the response must opt in.
    Eligible { requires_opt_in: bool },
    Ineligible(FinalStatus),
}

/// Which concurrency budget an attempt draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotBucket {
    Immediate,
    NonImmediate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotDecision {
    Start,
    Queue,
    /// Start after destroying the oldest attempt of the same bucket.
    StartEvicting(AttemptId),
    Reject(FinalStatus),
}

/// Url the origin gate and later redirect checks compare against.
pub fn initiator_for(candidate: &Candidate, primary_url: &Url) -> Url {
    if candidate.trigger_class.is_speculation_rule() {
        primary_url.clone()
    } else {
        candidate.url.clone()
    }
}

pub fn bucket_for(candidate: &Candidate) -> SlotBucket {
    if candidate.trigger_class == TriggerClass::Embedder || candidate.eagerness.is_immediate() {
        SlotBucket::Immediate
    } else {
        SlotBucket::NonImmediate
    }
}

pub fn check_resources(resources: &ResourceSignals, config: &PrerenderConfig) -> Result<(), FinalStatus> {
    if resources.memory_pressure == MemoryPressureLevel::Critical {
        return Err(FinalStatus::MemoryPressureCritical);
    }
    if let (Some(budget), Some(used)) = (config.memory_budget_mib, resources.memory_footprint_mib)
        && used >= budget
    {
        return Err(FinalStatus::LowMemory);
    }
    if let (Some(threshold_ms), Some(rtt)) = (config.slow_network_rtt_ms, resources.network_rtt)
        && rtt > Duration::from_millis(threshold_ms)
    {
        return Err(FinalStatus::SlowNetwork);
    }
    Ok(())
}

pub fn check_eligibility(
    candidate: &Candidate,
    primary_url: &Url,
    resources: &ResourceSignals,
    config: &PrerenderConfig,
) -> Eligibility {
    if !is_navigable_scheme(&candidate.url) {
        return Eligibility::Ineligible(FinalStatus::UnsupportedScheme);
    }

    let mut requires_opt_in = false;
    if candidate.trigger_class.is_speculation_rule() {
        if !same_site(primary_url, &candidate.url) {
            return Eligibility::Ineligible(FinalStatus::CrossSiteInitialNavigation);
        }
        requires_opt_in = !same_origin(primary_url, &candidate.url);
    }

    if let Err(reason) = check_resources(resources, config) {
        return Eligibility::Ineligible(reason);
    }

    Eligibility::Eligible { requires_opt_in }
}

pub fn decide_slot(
    class: TriggerClass,
    bucket: SlotBucket,
    in_use: usize,
    config: &PrerenderConfig,
    oldest_in_bucket: Option<AttemptId>,
) -> SlotDecision {
    let limit = match (class, bucket) {
        (TriggerClass::Embedder, _) => config.embedder_limit,
        (_, SlotBucket::Immediate) => config.speculation_rule_limit,
        (_, SlotBucket::NonImmediate) => config.non_immediate_limit,
    };
    if in_use < limit {
        return SlotDecision::Start;
    }
    match (class, bucket) {
        (TriggerClass::Embedder, _) => SlotDecision::Reject(FinalStatus::ConcurrencyLimitExceeded),
        (_, SlotBucket::Immediate) => SlotDecision::Queue,
        (_, SlotBucket::NonImmediate) => match oldest_in_bucket {
            Some(oldest) => SlotDecision::StartEvicting(oldest),
            None => SlotDecision::Reject(FinalStatus::NonImmediateLimitExceeded),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prerender_core::Eagerness;
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    const PRIMARY: &str = "https://www.shop.test/home";

    #[rstest]
    #[case("ftp://www.shop.test/file", TriggerClass::SpeculationRule, Eligibility::Ineligible(FinalStatus::UnsupportedScheme))]
    #[case("ftp://www.shop.test/file", TriggerClass::Embedder, Eligibility::Ineligible(FinalStatus::UnsupportedScheme))]
    #[case("https://other.test/", TriggerClass::SpeculationRule, Eligibility::Ineligible(FinalStatus::CrossSiteInitialNavigation))]
    #[case("https://other.test/", TriggerClass::Embedder, Eligibility::Eligible { requires_opt_in: false })]
    #[case("https://www.shop.test/p", TriggerClass::SpeculationRule, Eligibility::Eligible { requires_opt_in: false })]
    #[case("https://cdn.shop.test/p", TriggerClass::SpeculationRuleAuto, Eligibility::Eligible { requires_opt_in: true })]
    #[case("http://www.shop.test/p", TriggerClass::SpeculationRule, Eligibility::Ineligible(FinalStatus::CrossSiteInitialNavigation))]
    fn scheme_and_origin_gates(
        #[case] target: &str,
        #[case] class: TriggerClass,
        #[case] expected: Eligibility,
    ) {
        let candidate = Candidate::new(url(target), class);
        assert_eq!(
            check_eligibility(&candidate, &url(PRIMARY), &ResourceSignals::default(), &PrerenderConfig::default()),
            expected
        );
    }

    #[test]
    fn scheme_gate_runs_before_resource_gate() {
        let resources = ResourceSignals {
            memory_pressure: MemoryPressureLevel::Critical,
            ..ResourceSignals::default()
        };
        let candidate = Candidate::new(url("ftp://www.shop.test/"), TriggerClass::SpeculationRule);
        assert_eq!(
            check_eligibility(&candidate, &url(PRIMARY), &resources, &PrerenderConfig::default()),
            Eligibility::Ineligible(FinalStatus::UnsupportedScheme)
        );
    }

    #[rstest]
    #[case(MemoryPressureLevel::Warning, None, None, Ok(()))]
    #[case(MemoryPressureLevel::Critical, None, None, Err(FinalStatus::MemoryPressureCritical))]
    #[case(MemoryPressureLevel::Normal, Some(4096), None, Err(FinalStatus::LowMemory))]
    #[case(MemoryPressureLevel::Normal, Some(100), Some(900), Err(FinalStatus::SlowNetwork))]
    #[case(MemoryPressureLevel::Normal, Some(100), Some(500), Ok(()))]
    fn resource_gate_table(
        #[case] pressure: MemoryPressureLevel,
        #[case] footprint: Option<u64>,
        #[case] rtt_ms: Option<u64>,
        #[case] expected: Result<(), FinalStatus>,
    ) {
        let config = PrerenderConfig {
            memory_budget_mib: Some(2048),
            slow_network_rtt_ms: Some(600),
            ..PrerenderConfig::default()
        };
        let resources = ResourceSignals {
            memory_pressure: pressure,
            memory_footprint_mib: footprint,
            network_rtt: rtt_ms.map(Duration::from_millis),
        };
        assert_eq!(check_resources(&resources, &config), expected);
    }

    #[test]
    fn unconfigured_thresholds_never_reject() {
        let resources = ResourceSignals {
            memory_pressure: MemoryPressureLevel::Normal,
            memory_footprint_mib: Some(u64::MAX),
            network_rtt: Some(Duration::from_secs(30)),
        };
        assert_eq!(check_resources(&resources, &PrerenderConfig::default()), Ok(()));
    }

    #[rstest]
    #[case(TriggerClass::SpeculationRule, SlotBucket::Immediate, 0, SlotDecision::Start)]
    #[case(TriggerClass::SpeculationRule, SlotBucket::Immediate, 1, SlotDecision::Queue)]
    #[case(TriggerClass::Embedder, SlotBucket::Immediate, 1, SlotDecision::Reject(FinalStatus::ConcurrencyLimitExceeded))]
    #[case(TriggerClass::SpeculationRuleAuto, SlotBucket::NonImmediate, 1, SlotDecision::StartEvicting(AttemptId::from_raw(5)))]
    fn slot_table(
        #[case] class: TriggerClass,
        #[case] bucket: SlotBucket,
        #[case] in_use: usize,
        #[case] expected: SlotDecision,
    ) {
        let config = PrerenderConfig {
            speculation_rule_limit: 1,
            non_immediate_limit: 1,
            embedder_limit: 1,
            ..PrerenderConfig::default()
        };
        assert_eq!(
            decide_slot(class, bucket, in_use, &config, Some(AttemptId::from_raw(5))),
            expected
        );
    }

    #[test]
    fn eagerness_selects_bucket() {
        let rule = Candidate::new(url("https://www.shop.test/"), TriggerClass::SpeculationRule);
        assert_eq!(bucket_for(&rule), SlotBucket::Immediate);
        assert_eq!(bucket_for(&rule.clone().with_eagerness(Eagerness::Eager)), SlotBucket::NonImmediate);
        let embedder = Candidate::new(url("https://www.shop.test/"), TriggerClass::Embedder)
            .with_eagerness(Eagerness::Conservative);
        assert_eq!(bucket_for(&embedder), SlotBucket::Immediate);
    }
}
