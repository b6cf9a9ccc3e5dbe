/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Ambient runtime: configuration, diagnostics, memory sampling, timers, and
//! the async control panel that feeds the registry.

pub mod config;
pub mod control_panel;
pub mod diagnostics;
pub mod memory;
pub mod timers;

pub use config::{ConfigError, PrerenderConfig};
pub use control_panel::{ControlPanel, IntentSource, QueuedIntent};
pub use diagnostics::{DiagnosticEvent, DiagnosticsSink, DiagnosticsState};
pub use memory::MemoryPressureLevel;
pub use timers::{TimerBook, TokioTimers};
