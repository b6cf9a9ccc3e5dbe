/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Scripted replay of a prerender session.
//!
//! A scenario is a TOML document with a primary url, an optional `[config]`
//! table and an ordered list of `[[step]]`s. Steps refer to attempts by the
//! name given at submission (the url when no name is given):
//!
//! ```toml
//! primary_url = "https://www.shop.test/"
//!
//! [[step]]
//! action = "submit"
//! name = "a"
//! url = "https://www.shop.test/a"
//!
//! [[step]]
//! action = "load"
//! attempt = "a"
//!
//! [[step]]
//! action = "navigate"
//! navigation = 1
//! url = "https://www.shop.test/a"
//!
//! [[step]]
//! action = "commit"
//! navigation = 1
//! ```
//!
//! Everything runs synchronously against [`RecordingHost`] and
//! [`ManualTimers`]; timers only fire when a `fire_timer` step says so.

pub mod host;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use log::debug;
use prerender_core::{
    AttemptId, Candidate, CandidateKey, Eagerness, FinalStatus, InteractionSignal, NavigationId,
    NoVarySearch, NoVarySearchParseError, TargetSemantics, TriggerClass,
};
use prerender_runtime::TimerKey;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::activation::{ActivationTicket, CommitResolution};
use crate::lifecycle::{AttemptState, ResponseHeaders, ResponseHeadersError};
use crate::registry::{
    ActivationRequest, CapabilityPolicy, CommitOutcome, LoadOutcome, NavigationStartDecision,
    PrerenderRegistry, SubmitOutcome,
};
use crate::runtime::config::{ConfigError, PrerenderConfig};
use crate::runtime::diagnostics::DiagnosticsState;
use crate::runtime::memory::MemoryPressureLevel;

pub use host::{HostEvent, ManualTimers, RecordingHost};

pub type ReplayRegistry = PrerenderRegistry<RecordingHost, ManualTimers>;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub primary_url: Url,
    /// Replaces the configuration passed to [`run`] when present.
    #[serde(default)]
    pub config: Option<PrerenderConfig>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerName {
    Background,
    HeaderWait,
    CommitDeferral,
}

fn default_trigger() -> TriggerClass {
    TriggerClass::SpeculationRule
}

fn default_status() -> u16 {
    200
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Submit {
        name: Option<String>,
        url: Url,
        #[serde(default = "default_trigger")]
        trigger: TriggerClass,
        #[serde(default)]
        eagerness: Eagerness,
        #[serde(default)]
        target: TargetSemantics,
        hint: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
    Remove {
        attempt: String,
    },
    Cancel {
        attempt: String,
        reason: FinalStatus,
    },
    Redirect {
        attempt: String,
        to: Url,
    },
    Headers {
        attempt: String,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Load {
        attempt: String,
        #[serde(default = "default_status")]
        status: u16,
        failure: Option<FinalStatus>,
    },
    Capability {
        attempt: String,
        capability: String,
    },
    /// With a url the document starts navigating itself; without one the
    /// inner navigation finishes.
    InnerNavigation {
        attempt: String,
        url: Option<Url>,
    },
    Crash {
        attempt: String,
    },
    Visibility {
        visible: bool,
    },
    Interaction {
        url: Url,
        signal: InteractionSignal,
    },
    MemoryPressure {
        level: MemoryPressureLevel,
    },
    Navigate {
        navigation: u64,
        url: Url,
        #[serde(default)]
        disposition: TargetSemantics,
    },
    Commit {
        navigation: u64,
    },
    NavigationFailed {
        navigation: u64,
    },
    FireTimer {
        timer: TimerName,
        class: Option<TriggerClass>,
        attempt: Option<String>,
        navigation: Option<u64>,
    },
    NavigatingAway,
}

#[derive(Debug)]
pub enum ScenarioError {
    Io(String),
    Parse(String),
    Config(ConfigError),
    UnknownAttempt { step: usize, name: String },
    NotStarted { step: usize, name: String },
    InvalidHint { step: usize, error: NoVarySearchParseError },
    InvalidHeaders { step: usize, error: ResponseHeadersError },
    MissingField { step: usize, field: &'static str },
    TimerNotArmed { step: usize, timer: String },
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read scenario: {e}"),
            Self::Parse(e) => write!(f, "failed to parse scenario: {e}"),
            Self::Config(e) => write!(f, "scenario config: {e}"),
            Self::UnknownAttempt { step, name } => {
                write!(f, "step {step}: no candidate named '{name}' was submitted")
            }
            Self::NotStarted { step, name } => {
                write!(f, "step {step}: candidate '{name}' has no attempt")
            }
            Self::InvalidHint { step, error } => write!(f, "step {step}: invalid hint: {error}"),
            Self::InvalidHeaders { step, error } => write!(f, "step {step}: {error}"),
            Self::MissingField { step, field } => write!(f, "step {step}: missing '{field}'"),
            Self::TimerNotArmed { step, timer } => {
                write!(f, "step {step}: timer {timer} is not armed")
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<ConfigError> for ScenarioError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl Scenario {
    pub fn from_toml_str(raw: &str) -> Result<Self, ScenarioError> {
        toml::from_str(raw).map_err(|e| ScenarioError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScenarioError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AttemptReport {
    pub name: String,
    pub url: Url,
    pub trigger_class: TriggerClass,
    pub submitted: String,
    pub attempt: Option<AttemptId>,
    pub state: Option<AttemptState>,
    pub final_status: Option<FinalStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NavigationReport {
    pub navigation: NavigationId,
    pub url: Url,
    pub adopted: Option<AttemptId>,
    /// How the deferred commit was resolved, if it was.
    pub resolution: Option<String>,
    pub committed: Option<String>,
    pub deferred_capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub primary_url: Url,
    pub session_history: Vec<Url>,
    pub attempts: Vec<AttemptReport>,
    pub navigations: Vec<NavigationReport>,
    pub host_events: Vec<HostEvent>,
    pub diagnostics: serde_json::Value,
}

impl ReplayReport {
    pub fn attempt(&self, name: &str) -> Option<&AttemptReport> {
        self.attempts.iter().find(|a| a.name == name)
    }
}

struct Named {
    name: String,
    key: CandidateKey,
    submitted: SubmitOutcome,
    attempt: Option<AttemptId>,
}

struct PendingNavigation {
    report: NavigationReport,
    ticket: Option<ActivationTicket>,
}

/// Applies scenario steps one at a time against an in-memory registry.
pub struct Replayer {
    registry: ReplayRegistry,
    diagnostics: DiagnosticsState,
    named: Vec<Named>,
    navigations: BTreeMap<u64, PendingNavigation>,
}

impl Replayer {
    pub fn new(config: PrerenderConfig, primary_url: Url) -> Self {
        let (diagnostics, sink) = DiagnosticsState::new();
        let registry = PrerenderRegistry::new(
            config,
            primary_url,
            RecordingHost::new(),
            ManualTimers::new(),
        )
        .with_diagnostics(sink);
        Self {
            registry,
            diagnostics,
            named: Vec::new(),
            navigations: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &ReplayRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ReplayRegistry {
        &mut self.registry
    }

    pub fn diagnostics(&mut self) -> &DiagnosticsState {
        self.diagnostics.drain();
        &self.diagnostics
    }

    /// The attempt currently or last bound to `name`.
    pub fn attempt_id(&self, name: &str) -> Option<AttemptId> {
        let named = self.named.iter().rev().find(|n| n.name == name)?;
        named.attempt.or_else(|| self.live_attempt_for(&named.key))
    }

    fn live_attempt_for(&self, key: &CandidateKey) -> Option<AttemptId> {
        self.registry
            .live_attempts()
            .find(|attempt| attempt.candidate().key() == *key)
            .map(|attempt| attempt.id())
    }

    fn resolve(&mut self, step: usize, name: &str) -> Result<AttemptId, ScenarioError> {
        let Some(index) = self.named.iter().rposition(|n| n.name == name) else {
            return Err(ScenarioError::UnknownAttempt {
                step,
                name: name.to_string(),
            });
        };
        if self.named[index].attempt.is_none() {
            let live = self.live_attempt_for(&self.named[index].key);
            self.named[index].attempt = live;
        }
        self.named[index].attempt.ok_or_else(|| ScenarioError::NotStarted {
            step,
            name: name.to_string(),
        })
    }

    fn require<T>(step: usize, field: &'static str, value: Option<T>) -> Result<T, ScenarioError> {
        value.ok_or(ScenarioError::MissingField { step, field })
    }

    pub fn apply(&mut self, step: usize, action: &Step) -> Result<(), ScenarioError> {
        debug!("replay: step {step}: {action:?}");
        match action {
            Step::Submit {
                name,
                url,
                trigger,
                eagerness,
                target,
                hint,
                tags,
            } => {
                let mut candidate = Candidate::new(url.clone(), *trigger)
                    .with_eagerness(*eagerness)
                    .with_target(*target);
                if let Some(hint) = hint {
                    let hint = NoVarySearch::parse(hint)
                        .map_err(|error| ScenarioError::InvalidHint { step, error })?;
                    candidate = candidate.with_hint(hint);
                }
                for tag in tags {
                    candidate = candidate.with_tag(tag.clone());
                }
                let key = candidate.key();
                let submitted = self.registry.submit(candidate);
                self.named.push(Named {
                    name: name.clone().unwrap_or_else(|| url.to_string()),
                    key,
                    attempt: submitted.attempt(),
                    submitted,
                });
            }
            Step::Remove { attempt } => {
                let Some(named) = self.named.iter().rev().find(|n| n.name == *attempt) else {
                    return Err(ScenarioError::UnknownAttempt {
                        step,
                        name: attempt.clone(),
                    });
                };
                let key = named.key.clone();
                self.registry.remove(&key);
            }
            Step::Cancel { attempt, reason } => {
                let id = self.resolve(step, attempt)?;
                self.registry.cancel_host(id, *reason);
            }
            Step::Redirect { attempt, to } => {
                let id = self.resolve(step, attempt)?;
                self.registry.on_redirect(id, to.clone());
            }
            Step::Headers {
                attempt,
                status,
                headers,
            } => {
                let id = self.resolve(step, attempt)?;
                let headers = ResponseHeaders::from_pairs(
                    *status,
                    headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                )
                .map_err(|error| ScenarioError::InvalidHeaders { step, error })?;
                self.registry.on_headers_received(id, headers);
            }
            Step::Load {
                attempt,
                status,
                failure,
            } => {
                let id = self.resolve(step, attempt)?;
                let outcome = match failure {
                    Some(reason) => LoadOutcome::Failure(*reason),
                    None => LoadOutcome::Success { status: *status },
                };
                self.registry.on_load_finished(id, outcome);
            }
            Step::Capability {
                attempt,
                capability,
            } => {
                let id = self.resolve(step, attempt)?;
                let policy = self.registry.on_capability_requested(id, capability);
                if policy != CapabilityPolicy::Grant {
                    debug!("replay: {capability} -> {policy:?}");
                }
            }
            Step::InnerNavigation { attempt, url } => {
                let id = self.resolve(step, attempt)?;
                match url {
                    Some(url) => self.registry.on_inner_navigation_started(id, url.clone()),
                    None => self.registry.on_inner_navigation_finished(id),
                }
            }
            Step::Crash { attempt } => {
                let id = self.resolve(step, attempt)?;
                self.registry.on_crashed(id);
            }
            Step::Visibility { visible } => self.registry.notify_visibility_changed(*visible),
            Step::Interaction { url, signal } => {
                self.registry.notify_interaction(url, *signal);
            }
            Step::MemoryPressure { level } => self.registry.on_memory_pressure(*level),
            Step::Navigate {
                navigation,
                url,
                disposition,
            } => {
                let decision = self.registry.on_navigation_starting(ActivationRequest {
                    navigation_id: NavigationId(*navigation),
                    target_url: url.clone(),
                    disposition: *disposition,
                });
                let ticket = match decision {
                    NavigationStartDecision::DeferCommit(ticket) => Some(ticket),
                    NavigationStartDecision::ProceedNormally => None,
                };
                self.navigations.insert(
                    *navigation,
                    PendingNavigation {
                        report: NavigationReport {
                            navigation: NavigationId(*navigation),
                            url: url.clone(),
                            adopted: ticket.as_ref().map(|t| t.attempt),
                            resolution: None,
                            committed: None,
                            deferred_capabilities: Vec::new(),
                        },
                        ticket,
                    },
                );
            }
            Step::Commit { navigation } => {
                let outcome = self.registry.on_commit_ready(NavigationId(*navigation));
                if let Some(pending) = self.navigations.get_mut(navigation) {
                    pending.report.committed = Some(match outcome {
                        CommitOutcome::Activated(page) => {
                            pending.report.deferred_capabilities = page.deferred_capabilities;
                            format!("activated {}", page.url)
                        }
                        CommitOutcome::NotActivated => "not_activated".to_string(),
                        CommitOutcome::StillDeferred => "still_deferred".to_string(),
                    });
                }
            }
            Step::NavigationFailed { navigation } => {
                self.registry.on_navigation_failed(NavigationId(*navigation));
            }
            Step::FireTimer {
                timer,
                class,
                attempt,
                navigation,
            } => {
                let key = match timer {
                    TimerName::Background => {
                        TimerKey::Background(Self::require(step, "class", *class)?)
                    }
                    TimerName::HeaderWait => {
                        let name = Self::require(step, "attempt", attempt.as_deref())?;
                        TimerKey::HeaderWait(self.resolve(step, name)?)
                    }
                    TimerName::CommitDeferral => TimerKey::CommitDeferral(NavigationId(
                        Self::require(step, "navigation", *navigation)?,
                    )),
                };
                let Some(ticket) = self.registry.timers_mut().take(key) else {
                    return Err(ScenarioError::TimerNotArmed {
                        step,
                        timer: format!("{key:?}"),
                    });
                };
                self.registry.on_timer_fired(ticket);
            }
            Step::NavigatingAway => self.registry.notify_navigating_away(),
        }
        self.poll_resolutions();
        Ok(())
    }

    fn poll_resolutions(&mut self) {
        for pending in self.navigations.values_mut() {
            let Some(ticket) = pending.ticket.as_mut() else {
                continue;
            };
            if let Ok(resolution) = ticket.resolution.try_recv() {
                pending.report.resolution = Some(match resolution {
                    CommitResolution::ReadyToCommit { attempt } => format!("ready_to_commit {attempt}"),
                    CommitResolution::Fallback { reason } => format!("fallback {reason}"),
                });
                pending.ticket = None;
            }
        }
    }

    pub fn report(mut self) -> ReplayReport {
        self.diagnostics.drain();
        let attempts = self
            .named
            .iter()
            .map(|named| {
                let attempt = named.attempt.or_else(|| self.live_attempt_for(&named.key));
                AttemptReport {
                    name: named.name.clone(),
                    url: named.key.url.clone(),
                    trigger_class: named.key.trigger_class,
                    submitted: format!("{:?}", named.submitted),
                    attempt,
                    state: attempt.and_then(|id| self.registry.state(id)),
                    final_status: attempt.and_then(|id| self.registry.final_status(id)),
                }
            })
            .collect();
        ReplayReport {
            primary_url: self.registry.primary_url().clone(),
            session_history: self.registry.session_history().to_vec(),
            attempts,
            navigations: self
                .navigations
                .into_values()
                .map(|pending| pending.report)
                .collect(),
            host_events: self.registry.host().events().to_vec(),
            diagnostics: self.diagnostics.snapshot_json(),
        }
    }
}

/// Replays every step of `scenario`. A `[config]` table in the scenario
/// takes precedence over `config`.
pub fn run(scenario: &Scenario, config: PrerenderConfig) -> Result<ReplayReport, ScenarioError> {
    let config = match &scenario.config {
        Some(own) => {
            own.validate()?;
            own.clone()
        }
        None => config,
    };
    let mut replayer = Replayer::new(config, scenario.primary_url.clone());
    for (index, step) in scenario.steps.iter().enumerate() {
        replayer.apply(index, step)?;
    }
    Ok(replayer.report())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_PATH: &str = r#"
primary_url = "https://www.shop.test/"

[[step]]
action = "submit"
name = "a"
url = "https://www.shop.test/a"

[[step]]
action = "submit"
name = "b"
url = "https://www.shop.test/b"

[[step]]
action = "capability"
attempt = "a"
capability = "geolocation"

[[step]]
action = "load"
attempt = "a"

[[step]]
action = "navigate"
navigation = 1
url = "https://www.shop.test/a"

[[step]]
action = "commit"
navigation = 1
"#;

    #[test]
    fn happy_path_scenario_activates() {
        let scenario = Scenario::from_toml_str(HAPPY_PATH).unwrap();
        let report = run(&scenario, PrerenderConfig::default()).unwrap();

        assert_eq!(report.attempt("a").and_then(|a| a.final_status), Some(FinalStatus::Activated));
        assert_eq!(
            report.attempt("b").and_then(|a| a.final_status),
            Some(FinalStatus::OtherAttemptActivated)
        );
        assert_eq!(report.primary_url.as_str(), "https://www.shop.test/a");
        let navigation = &report.navigations[0];
        assert_eq!(navigation.deferred_capabilities, vec!["geolocation".to_string()]);
        assert!(navigation.resolution.as_deref().is_some_and(|r| r.starts_with("ready_to_commit")));
    }

    #[test]
    fn scenario_config_overrides_the_given_one() {
        let raw = r#"
primary_url = "https://www.shop.test/"

[config]
embedder_limit = 1

[[step]]
action = "submit"
name = "one"
trigger = "embedder"
url = "https://news.test/"

[[step]]
action = "submit"
name = "two"
trigger = "embedder"
url = "https://weather.test/"
"#;
        let scenario = Scenario::from_toml_str(raw).unwrap();
        let report = run(&scenario, PrerenderConfig::default()).unwrap();
        assert!(report.attempt("two").is_some_and(|a| a.attempt.is_none()));
        assert!(report.attempt("two").is_some_and(|a| a.submitted.contains("ConcurrencyLimitExceeded")));
    }

    #[test]
    fn referring_to_an_unknown_attempt_is_an_error() {
        let raw = r#"
primary_url = "https://www.shop.test/"

[[step]]
action = "load"
attempt = "ghost"
"#;
        let scenario = Scenario::from_toml_str(raw).unwrap();
        assert!(matches!(
            run(&scenario, PrerenderConfig::default()),
            Err(ScenarioError::UnknownAttempt { step: 0, .. })
        ));
    }

    #[test]
    fn firing_an_unarmed_timer_is_an_error() {
        let raw = r#"
primary_url = "https://www.shop.test/"

[[step]]
action = "fire_timer"
timer = "background"
class = "embedder"
"#;
        let scenario = Scenario::from_toml_str(raw).unwrap();
        assert!(matches!(
            run(&scenario, PrerenderConfig::default()),
            Err(ScenarioError::TimerNotArmed { step: 0, .. })
        ));
    }

    #[test]
    fn unknown_actions_fail_to_parse() {
        let raw = r#"
primary_url = "https://www.shop.test/"

[[step]]
action = "teleport"
"#;
        assert!(matches!(Scenario::from_toml_str(raw), Err(ScenarioError::Parse(_))));
    }
}
