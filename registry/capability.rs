/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a speculative document gets when it asks for a capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityPolicy {
    Grant,
    /// Held until activation, then released in request order.
    Defer,
    /// Requesting it destroys the attempt with `policy_violation`.
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityDecision {
    pub policy: CapabilityPolicy,
    pub matched_by: &'static str,
}

#[derive(Clone, Debug)]
pub struct CapabilityTable {
    policies: HashMap<String, CapabilityPolicy>,
    unknown: CapabilityPolicy,
}

impl CapabilityTable {
    pub fn new(unknown: CapabilityPolicy) -> Self {
        Self {
            policies: HashMap::new(),
            unknown,
        }
    }

    pub fn register(&mut self, capability: &str, policy: CapabilityPolicy) {
        self.policies
            .insert(capability.to_ascii_lowercase(), policy);
    }

    pub fn with_overrides<'a>(
        mut self,
        overrides: impl IntoIterator<Item = (&'a String, &'a CapabilityPolicy)>,
    ) -> Self {
        for (capability, policy) in overrides {
            self.register(capability, *policy);
        }
        self
    }

    pub fn evaluate(&self, capability: &str) -> CapabilityDecision {
        match self.policies.get(&capability.to_ascii_lowercase()) {
            Some(policy) => CapabilityDecision {
                policy: *policy,
                matched_by: "table",
            },
            None => CapabilityDecision {
                policy: self.unknown,
                matched_by: "unknown",
            },
        }
    }

    pub fn seeded(unknown: CapabilityPolicy) -> Self {
        let mut table = Self::new(unknown);
        for capability in ["storage", "cookies", "broadcast_channel", "cache", "fonts"] {
            table.register(capability, CapabilityPolicy::Grant);
        }
        for capability in [
            "geolocation",
            "clipboard_read",
            "screen_wake_lock",
            "battery_status",
            "midi",
            "audio_output",
        ] {
            table.register(capability, CapabilityPolicy::Defer);
        }
        for capability in [
            "notifications",
            "payment_request",
            "web_usb",
            "web_bluetooth",
            "serial",
            "idle_detection",
            "file_picker",
            "popup",
        ] {
            table.register(capability, CapabilityPolicy::Cancel);
        }
        table
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::seeded(CapabilityPolicy::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("storage", CapabilityPolicy::Grant)]
    #[case("Geolocation", CapabilityPolicy::Defer)]
    #[case("notifications", CapabilityPolicy::Cancel)]
    #[case("something_new", CapabilityPolicy::Cancel)]
    fn default_seed_table(#[case] capability: &str, #[case] expected: CapabilityPolicy) {
        assert_eq!(CapabilityTable::default().evaluate(capability).policy, expected);
    }

    #[test]
    fn unknown_fallback_is_configurable() {
        let table = CapabilityTable::seeded(CapabilityPolicy::Defer);
        let decision = table.evaluate("something_new");
        assert_eq!(decision.policy, CapabilityPolicy::Defer);
        assert_eq!(decision.matched_by, "unknown");
    }

    #[test]
    fn overrides_replace_seeded_entries() {
        let overrides: HashMap<String, CapabilityPolicy> =
            [("notifications".to_string(), CapabilityPolicy::Defer)].into();
        let table = CapabilityTable::default().with_overrides(&overrides);
        assert_eq!(table.evaluate("notifications").policy, CapabilityPolicy::Defer);
        assert_eq!(table.evaluate("notifications").matched_by, "table");
    }
}
