/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Prerender scheduling for one browsing context.
//!
//! [`PrerenderRegistry`] admits speculative navigation candidates, drives
//! each attempt through its lifecycle against an external document host,
//! and decides whether a real navigation can adopt one of them.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod activation;
pub mod lifecycle;
pub mod registry;
pub mod replay;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use prerender_core::{
    AttemptId, Candidate, CandidateKey, Eagerness, FinalStatus, InteractionSignal, NavigationId,
    NoVarySearch, StatusCategory, TargetSemantics, TriggerClass,
};
pub use prerender_runtime::{DocumentHostPort, TimerKey, TimerPort, TimerTicket};

pub use activation::{ActivationTicket, CommitResolution};
pub use lifecycle::{Attempt, AttemptState, ResponseHeaders};
pub use registry::{
    ActivatedPage, ActivationRequest, CapabilityPolicy, CommitOutcome, HostSignal, LoadOutcome,
    NavigationStartDecision, PrerenderIntent, PrerenderRegistry, SubmitOutcome,
};
pub use runtime::{
    ConfigError, ControlPanel, DiagnosticEvent, DiagnosticsSink, DiagnosticsState,
    MemoryPressureLevel, PrerenderConfig,
};

/// Installs the global subscriber. The filter comes from `filter`, then
/// `PRERENDER_TRACING_FILTER`, then `RUST_LOG`, then `info`. `log` records
/// are captured too.
#[cfg(feature = "tracing")]
pub fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let directives = filter
        .map(str::to_string)
        .or_else(|| std::env::var("PRERENDER_TRACING_FILTER").ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("invalid tracing filter '{directives}' ({e}), using 'info'");
        EnvFilter::new("info")
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
    {
        eprintln!("tracing already initialized: {e}");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing(_filter: Option<&str>) {}
