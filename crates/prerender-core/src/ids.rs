/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-unique identity of one speculative navigation attempt.
///
/// Ids are allocated monotonically, so comparing two ids also compares
/// creation order. The matcher relies on that for deterministic tie-breaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(u64);

impl AttemptId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt#{}", self.0)
    }
}

/// Identity of a real (non-speculative) navigation, assigned by the
/// navigation pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NavigationId(pub u64);

impl fmt::Display for NavigationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "navigation#{}", self.0)
    }
}

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out [`AttemptId`]s that never repeat within the process, even across
/// independent registries.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttemptIdAllocator;

impl AttemptIdAllocator {
    pub fn next(&self) -> AttemptId {
        AttemptId(NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed))
    }
}
