/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod coordinator;
pub mod matcher;

pub use coordinator::{
    ActivationCoordinator, ActivationTicket, CommitCondition, CommitResolution, ConditionState,
};
pub use matcher::{AttemptMatch, MatchKind, MatchOutcome, find_best_attempt};
