//! Dispatch failures that are surfaced to callers.
//!
//! Cache staleness and eviction never show up here: they are handled inside the
//! call site and only change latency. Failures raised by method bodies or
//! missing-member hooks are plain `anyhow::Error`s and pass through untouched.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no signature of method {class}.{method}() is applicable for argument types ({args})")]
    UnresolvedMethod { class: String, method: String, args: String },

    #[error("ambiguous method overloading for {class}.{method}({args}); candidates: {candidates}")]
    AmbiguousOverload {
        class: String,
        method: String,
        args: String,
        candidates: String,
    },

    #[error("no such property: {property} for class {class}")]
    UnresolvedProperty { class: String, property: String },

    #[error("cannot read write-only property {property} of class {class}")]
    PropertyNotReadable { class: String, property: String },

    #[error("cannot set read-only property {property} of class {class}")]
    PropertyNotWritable { class: String, property: String },

    #[error("call site {site} is bound to {existing}, cannot reuse it for {requested}")]
    SiteIdConflict { site: u64, existing: String, requested: String },

    #[error("unknown class id {0}")]
    UnknownClass(u32),

    #[error("class {0} is already defined")]
    DuplicateClass(String),

    #[error("invalid class definition for {class}: {reason}")]
    InvalidClass { class: String, reason: String },

    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchError {
    /// True for failures that mean "there is nothing to call", as opposed to
    /// configuration or registration mistakes.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::UnresolvedMethod { .. }
                | DispatchError::AmbiguousOverload { .. }
                | DispatchError::UnresolvedProperty { .. }
                | DispatchError::PropertyNotReadable { .. }
                | DispatchError::PropertyNotWritable { .. }
        )
    }
}
