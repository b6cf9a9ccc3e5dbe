/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Registry limits and timeouts.
//!
//! Values come from an optional TOML file, then `PRERENDER_*` environment
//! overrides. Unparseable environment values are logged and ignored; values
//! that parse but violate a bound fail validation.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::registry::capability::{CapabilityPolicy, CapabilityTable};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrerenderConfig {
    /// Concurrent immediate attempts per speculation-rule class.
    pub speculation_rule_limit: usize,
    /// Concurrent promoted non-immediate attempts per speculation-rule class.
    pub non_immediate_limit: usize,
    pub embedder_limit: usize,
    pub background_timeout_speculation_rules_ms: u64,
    pub background_timeout_embedder_ms: u64,
    pub header_wait_timeout_ms: u64,
    pub activation_deferral_timeout_ms: u64,
    pub memory_budget_mib: Option<u64>,
    pub slow_network_rtt_ms: Option<u64>,
    pub unknown_capability_policy: CapabilityPolicy,
    pub capability_overrides: HashMap<String, CapabilityPolicy>,
    pub retired_history_limit: usize,
}

impl Default for PrerenderConfig {
    fn default() -> Self {
        Self {
            speculation_rule_limit: 10,
            non_immediate_limit: 2,
            embedder_limit: 2,
            background_timeout_speculation_rules_ms: 180_000,
            background_timeout_embedder_ms: 19_000,
            header_wait_timeout_ms: 1_000,
            activation_deferral_timeout_ms: 10_000,
            memory_budget_mib: None,
            slow_network_rtt_ms: None,
            unknown_capability_policy: CapabilityPolicy::Cancel,
            capability_overrides: HashMap::new(),
            retired_history_limit: 64,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "TOML error: {e}"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_env<T: FromStr>(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{key} invalid ('{raw}'); keeping configured value");
            None
        }
    }
}

impl PrerenderConfig {
    /// Reads `path` (if given), applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(
                &std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?,
            )?,
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_env("PRERENDER_SPECULATION_RULE_LIMIT", &lookup) {
            self.speculation_rule_limit = v;
        }
        if let Some(v) = parse_env("PRERENDER_NON_IMMEDIATE_LIMIT", &lookup) {
            self.non_immediate_limit = v;
        }
        if let Some(v) = parse_env("PRERENDER_EMBEDDER_LIMIT", &lookup) {
            self.embedder_limit = v;
        }
        if let Some(v) = parse_env("PRERENDER_HEADER_WAIT_TIMEOUT_MS", &lookup) {
            self.header_wait_timeout_ms = v;
        }
        if let Some(v) = parse_env("PRERENDER_MEMORY_BUDGET_MIB", &lookup) {
            self.memory_budget_mib = Some(v);
        }
        if let Some(v) = parse_env("PRERENDER_SLOW_NETWORK_RTT_MS", &lookup) {
            self.slow_network_rtt_ms = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("speculation_rule_limit", self.speculation_rule_limit),
            ("non_immediate_limit", self.non_immediate_limit),
            ("embedder_limit", self.embedder_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        for (field, value) in [
            (
                "background_timeout_speculation_rules_ms",
                self.background_timeout_speculation_rules_ms,
            ),
            ("background_timeout_embedder_ms", self.background_timeout_embedder_ms),
            ("header_wait_timeout_ms", self.header_wait_timeout_ms),
            ("activation_deferral_timeout_ms", self.activation_deferral_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn header_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.header_wait_timeout_ms)
    }

    pub fn activation_deferral_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_deferral_timeout_ms)
    }

    pub fn background_timeout_speculation_rules(&self) -> Duration {
        Duration::from_millis(self.background_timeout_speculation_rules_ms)
    }

    pub fn background_timeout_embedder(&self) -> Duration {
        Duration::from_millis(self.background_timeout_embedder_ms)
    }

    pub fn capability_table(&self) -> CapabilityTable {
        CapabilityTable::seeded(self.unknown_capability_policy)
            .with_overrides(&self.capability_overrides)
    }
}
