//! Method resolution, inline caches and adaptive call sites.
//!
//! Data flow for one call: [`AdaptiveCallSite::call`] computes the receiver/argument
//! shape, probes its cache entries, and on a miss asks the [`MethodResolver`]
//! (which reads the [`crate::meta::MetaClassRegistry`]) for a handle. The
//! [`OptimizationPolicy`] then decides whether the site keeps caching, freezes or
//! gives up and goes megamorphic.

use std::fmt;

use serde::{Deserialize, Serialize};

mod call_site;
mod dispatcher;
mod entry;
mod handle;
mod policy;
mod resolver;
mod shape;
mod stats;

pub use call_site::{AdaptiveCallSite, SiteState};
pub use dispatcher::Dispatcher;
pub use entry::{InlineCacheEntry, VersionGuard};
pub use handle::{ForwardingHandle, PropertyHandle, ResolvedHandle};
pub use policy::{OptimizationPolicy, PolicyDecision, PolicyInput};
pub use resolver::{MethodResolver, Resolution};
pub use shape::{ArgShape, INLINE_ARGS, MethodKey, ReceiverKey, ShapeKey};
pub use stats::{CallSiteSnapshot, DispatchMetrics, EntrySnapshot, StateCounts};

/// Stable identity of one syntactic call location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(pub u64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site#{}", self.0)
    }
}

/// What a call site dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSiteKind {
    Method,
    GetProperty,
    SetProperty,
}

impl fmt::Display for CallSiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallSiteKind::Method => "method",
            CallSiteKind::GetProperty => "get",
            CallSiteKind::SetProperty => "set",
        })
    }
}

#[cfg(test)]
mod call_site_test;
#[cfg(test)]
mod concurrency_test;
