/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Portable kernel for speculative navigation.
//!
//! Everything in here is plain data: the immutable [`Candidate`] a trigger
//! source submits, the [`FinalStatus`] taxonomy every attempt ends with, the
//! [`NoVarySearch`] url-equivalence relation, and the site/origin helpers the
//! admission gates are built on. No scheduling, no timers, no host state.

pub mod candidate;
pub mod ids;
pub mod no_vary_search;
pub mod site;
pub mod status;

pub use candidate::{
    Candidate, CandidateKey, Eagerness, InteractionSignal, TargetSemantics, TriggerClass,
};
pub use ids::{AttemptId, AttemptIdAllocator, NavigationId};
pub use no_vary_search::{NoVarySearch, NoVarySearchParseError, VaryParams};
pub use site::{is_navigable_scheme, same_origin, same_site};
pub use status::{FinalStatus, StatusCategory};
