/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod attempt;
pub mod background_timeout;
pub mod response;

pub use attempt::{Attempt, AttemptState, TransitionError};
pub use background_timeout::BackgroundTimeoutMonitor;
pub use response::{ResponseHeaders, ResponseHeadersError};
