//! Adaptive call-site caching and dynamic method dispatch.
//!
//! The crate is organised leaf-first:
//! - [`val`]: runtime values and instances;
//! - [`meta`]: class hierarchy, per-class/per-instance meta-classes and the
//!   versioned registry that owns them;
//! - [`dispatch`]: method resolution, inline cache entries, adaptive call sites and
//!   the optimization policy that drives their state machine.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod meta;
pub mod util;
pub mod val;

// Shared workloads for benches and the CLI
pub mod perf;

pub use config::DispatchConfig;
pub use dispatch::{
    AdaptiveCallSite, CallSiteKind, Dispatcher, MethodResolver, OptimizationPolicy, PolicyDecision, ResolvedHandle,
    SiteId, SiteState,
};
pub use error::DispatchError;
pub use meta::{ClassDef, ClassId, MetaClass, MetaClassRegistry, MetaMutation, MethodDef, OverrideTarget, ParamType};
pub use val::{Instance, Val};
