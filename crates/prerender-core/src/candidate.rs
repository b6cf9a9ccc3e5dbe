/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::no_vary_search::NoVarySearch;

/// Which kind of trigger source asked for the speculative navigation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerClass {
    SpeculationRule,
    SpeculationRuleIsolatedWorld,
    SpeculationRuleAuto,
    Embedder,
}

impl TriggerClass {
    pub const ALL: [TriggerClass; 4] = [
        TriggerClass::SpeculationRule,
        TriggerClass::SpeculationRuleIsolatedWorld,
        TriggerClass::SpeculationRuleAuto,
        TriggerClass::Embedder,
    ];

    pub fn is_speculation_rule(self) -> bool {
        !matches!(self, TriggerClass::Embedder)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerClass::SpeculationRule => "speculation_rule",
            TriggerClass::SpeculationRuleIsolatedWorld => "speculation_rule_isolated_world",
            TriggerClass::SpeculationRuleAuto => "speculation_rule_auto",
            TriggerClass::Embedder => "embedder",
        }
    }
}

impl fmt::Display for TriggerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How eagerly a candidate should start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eagerness {
    #[default]
    Immediate,
    Eager,
    Moderate,
    Conservative,
}

/// User interaction observed on a link pointing at a candidate url.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSignal {
    Hover,
    PointerDown,
}

impl Eagerness {
    /// Starts at submission instead of waiting on standby.
    pub fn starts_on_submit(self) -> bool {
        matches!(self, Eagerness::Immediate | Eagerness::Eager)
    }

    pub fn is_immediate(self) -> bool {
        self == Eagerness::Immediate
    }

    pub fn promoted_by(self, signal: InteractionSignal) -> bool {
        match self {
            Eagerness::Immediate | Eagerness::Eager => true,
            Eagerness::Moderate => matches!(
                signal,
                InteractionSignal::Hover | InteractionSignal::PointerDown
            ),
            Eagerness::Conservative => signal == InteractionSignal::PointerDown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSemantics {
    #[default]
    SameTab,
    NewTab,
}

/// Identity used for duplicate suppression and trigger-source removal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub trigger_class: TriggerClass,
    pub url: Url,
    pub target_semantics: TargetSemantics,
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.trigger_class, self.url)
    }
}

/// Immutable description of a requested speculative navigation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub url: Url,
    pub trigger_class: TriggerClass,
    #[serde(default)]
    pub eagerness: Eagerness,
    #[serde(default)]
    pub target_semantics: TargetSemantics,
    #[serde(default)]
    pub url_match_hint: Option<NoVarySearch>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Candidate {
    pub fn new(url: Url, trigger_class: TriggerClass) -> Self {
        Self {
            url,
            trigger_class,
            eagerness: Eagerness::default(),
            target_semantics: TargetSemantics::default(),
            url_match_hint: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_eagerness(mut self, eagerness: Eagerness) -> Self {
        self.eagerness = eagerness;
        self
    }

    pub fn with_target(mut self, target_semantics: TargetSemantics) -> Self {
        self.target_semantics = target_semantics;
        self
    }

    pub fn with_hint(mut self, hint: NoVarySearch) -> Self {
        self.url_match_hint = Some(hint);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            trigger_class: self.trigger_class,
            url: self.url.clone(),
            target_semantics: self.target_semantics,
        }
    }

    /// Value for the `Sec-Speculation-Tags` request header, or `None` when
    /// the candidate carries no tags.
    pub fn speculation_tags_header(&self) -> Option<String> {
        if self.tags.is_empty() {
            return None;
        }
        Some(
            self.tags
                .iter()
                .map(|tag| format!("\"{tag}\""))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}
