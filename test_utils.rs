/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Helpers for integration tests: an in-memory registry wired to a recording
//! host, hand-fired timers and a diagnostics receiver.

use prerender_runtime::TimerKey;
use url::Url;

pub use crate::replay::{HostEvent, ManualTimers, RecordingHost, ReplayRegistry, Replayer};
use crate::registry::PrerenderRegistry;
use crate::runtime::config::PrerenderConfig;
use crate::runtime::diagnostics::DiagnosticsState;

pub struct TestHarness {
    pub registry: ReplayRegistry,
    pub diagnostics: DiagnosticsState,
}

impl TestHarness {
    pub fn new(primary_url: &str) -> Self {
        Self::with_config(primary_url, PrerenderConfig::default())
    }

    pub fn with_config(primary_url: &str, config: PrerenderConfig) -> Self {
        let primary_url = Url::parse(primary_url).expect("test primary url should parse");
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
        }
    }

    /// Fires `key` if it is armed. Returns whether it was.
    pub fn fire(&mut self, key: TimerKey) -> bool {
        match self.registry.timers_mut().take(key) {
            Some(ticket) => {
                self.registry.on_timer_fired(ticket);
                true
            }
            None => false,
        }
    }

    /// Drains buffered diagnostics and returns the aggregate view.
    pub fn diagnostics(&mut self) -> &DiagnosticsState {
        self.diagnostics.drain();
        &self.diagnostics
    }
}

pub fn url(raw: &str) -> Url {
    Url::parse(raw).expect("test url should parse")
}
