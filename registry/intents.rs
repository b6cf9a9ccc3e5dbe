/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::time::Duration;

use prerender_core::{AttemptId, Candidate, CandidateKey, FinalStatus, InteractionSignal};
use prerender_runtime::TimerTicket;
use url::Url;

use crate::lifecycle::ResponseHeaders;
use crate::runtime::memory::MemoryPressureLevel;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Success { status: u16 },
    Failure(FinalStatus),
}

/// Lifecycle signal observed from the document host for one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostSignal {
    Redirected(Url),
    HeadersReceived(ResponseHeaders),
    LoadFinished(LoadOutcome),
    CapabilityRequested(String),
    NavigationError(FinalStatus),
    InnerNavigationStarted(Url),
    InnerNavigationFinished,
    Crashed,
    Killed,
}

/// Registry mutation that can be queued from asynchronous producers and
/// applied later on the control sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrerenderIntent {
    Submit(Candidate),
    SubmitMany(Vec<Candidate>),
    Remove(CandidateKey),
    CancelHost {
        attempt: AttemptId,
        reason: FinalStatus,
    },
    VisibilityChanged(bool),
    NavigatingAway,
    Interaction {
        url: Url,
        signal: InteractionSignal,
    },
    MemoryPressureChanged {
        level: MemoryPressureLevel,
        available_mib: u64,
        total_mib: u64,
    },
    MemoryFootprint {
        used_mib: u64,
    },
    NetworkRtt(Duration),
    Host {
        attempt: AttemptId,
        signal: HostSignal,
    },
    TimerFired(TimerTicket),
}
