/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressureLevel {
    #[default]
    Unknown,
    Normal,
    Warning,
    Critical,
}

/// Free-memory thresholds. Either the absolute or the relative bound is
/// enough to reach a level.
pub fn classify(available_mib: u64, total_mib: u64) -> MemoryPressureLevel {
    if total_mib == 0 {
        return MemoryPressureLevel::Unknown;
    }
    let available_pct = available_mib as f64 / total_mib as f64;
    if available_mib <= 512 || available_pct <= 0.08 {
        MemoryPressureLevel::Critical
    } else if available_mib <= 1024 || available_pct <= 0.15 {
        MemoryPressureLevel::Warning
    } else {
        MemoryPressureLevel::Normal
    }
}

/// Sample current system memory. Returns `(level, available_mib, total_mib)`.
pub fn sample_memory() -> (MemoryPressureLevel, u64, u64) {
    let mut system = System::new();
    system.refresh_memory();

    let total_mib = system.total_memory() / (1024 * 1024);
    let available_mib = system.available_memory() / (1024 * 1024);
    (classify(available_mib, total_mib), available_mib, total_mib)
}
