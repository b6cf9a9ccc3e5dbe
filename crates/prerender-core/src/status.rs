/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;

use serde::{Deserialize, Serialize};

/// The single terminal reason recorded for every attempt (or for a rejected
/// submission, which never becomes an attempt).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    // Ineligible at admission.
    UnsupportedScheme,
    CrossSiteInitialNavigation,
    SameSiteCrossOriginNoOptIn,
    LowMemory,
    SlowNetwork,
    MemoryPressureCritical,
    ConcurrencyLimitExceeded,
    NonImmediateLimitExceeded,

    // Navigation failure.
    BadHttpStatus,
    CrossSiteRedirect,
    CrossSiteNavigationAfterReady,
    InvalidSchemeNavigation,
    NavigationNetworkError,
    AuthRequested,
    DownloadTriggered,
    MixedContent,

    // Policy violation.
    PolicyViolation,
    RendererCrashed,
    RendererKilled,

    // Timeout / lifecycle.
    TimeoutBackgrounded,
    TimeoutWaitingForHeaders,
    HeaderMismatch,
    ActivationDeferralTimeout,
    ActivationNavigationFailed,

    // Superseded.
    OtherAttemptActivated,
    TriggerRemoved,
    TriggerDestroyed,
    ActivatedBeforeStarted,

    Activated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Ineligible,
    NavigationFailure,
    PolicyViolation,
    Lifecycle,
    Superseded,
    Success,
}

impl FinalStatus {
    pub fn category(self) -> StatusCategory {
        use FinalStatus::*;
        match self {
            UnsupportedScheme
            | CrossSiteInitialNavigation
            | SameSiteCrossOriginNoOptIn
            | LowMemory
            | SlowNetwork
            | MemoryPressureCritical
            | ConcurrencyLimitExceeded
            | NonImmediateLimitExceeded => StatusCategory::Ineligible,
            BadHttpStatus
            | CrossSiteRedirect
            | CrossSiteNavigationAfterReady
            | InvalidSchemeNavigation
            | NavigationNetworkError
            | AuthRequested
            | DownloadTriggered
            | MixedContent => StatusCategory::NavigationFailure,
            PolicyViolation | RendererCrashed | RendererKilled => StatusCategory::PolicyViolation,
            TimeoutBackgrounded
            | TimeoutWaitingForHeaders
            | HeaderMismatch
            | ActivationDeferralTimeout
            | ActivationNavigationFailed => StatusCategory::Lifecycle,
            OtherAttemptActivated | TriggerRemoved | TriggerDestroyed | ActivatedBeforeStarted => {
                StatusCategory::Superseded
            }
            Activated => StatusCategory::Success,
        }
    }

    pub fn is_success(self) -> bool {
        self == FinalStatus::Activated
    }

    /// Reasons that may still tear down an attempt whose activation hand-off
    /// has begun. Everything else (timers, memory pressure, trigger removal)
    /// is ignored once activation is irrevocable.
    pub fn overrides_activation(self) -> bool {
        matches!(
            self,
            FinalStatus::PolicyViolation
                | FinalStatus::RendererCrashed
                | FinalStatus::RendererKilled
                | FinalStatus::CrossSiteRedirect
                | FinalStatus::CrossSiteNavigationAfterReady
                | FinalStatus::ActivationNavigationFailed
                | FinalStatus::ActivationDeferralTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        use FinalStatus::*;
        match self {
            UnsupportedScheme => "unsupported_scheme",
            CrossSiteInitialNavigation => "cross_site_initial_navigation",
            SameSiteCrossOriginNoOptIn => "same_site_cross_origin_no_opt_in",
            LowMemory => "low_memory",
            SlowNetwork => "slow_network",
            MemoryPressureCritical => "memory_pressure_critical",
            ConcurrencyLimitExceeded => "concurrency_limit_exceeded",
            NonImmediateLimitExceeded => "non_immediate_limit_exceeded",
            BadHttpStatus => "bad_http_status",
            CrossSiteRedirect => "cross_site_redirect",
            CrossSiteNavigationAfterReady => "cross_site_navigation_after_ready",
            InvalidSchemeNavigation => "invalid_scheme_navigation",
            NavigationNetworkError => "navigation_network_error",
            AuthRequested => "auth_requested",
            DownloadTriggered => "download_triggered",
            MixedContent => "mixed_content",
            PolicyViolation => "policy_violation",
            RendererCrashed => "renderer_crashed",
            RendererKilled => "renderer_killed",
            TimeoutBackgrounded => "timeout_backgrounded",
            TimeoutWaitingForHeaders => "timeout_waiting_for_headers",
            HeaderMismatch => "header_mismatch",
            ActivationDeferralTimeout => "activation_deferral_timeout",
            ActivationNavigationFailed => "activation_navigation_failed",
            OtherAttemptActivated => "other_attempt_activated",
            TriggerRemoved => "trigger_removed",
            TriggerDestroyed => "trigger_destroyed",
            ActivatedBeforeStarted => "activated_before_started",
            Activated => "activated",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
