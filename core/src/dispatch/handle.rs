use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::meta::{ClassTable, GetterFn, MethodDef, MethodMissingFn, PropertyMissingFn, SetterFn};
use crate::val::Val;

/// Outcome of a successful resolution.
///
/// `Forwarding` covers the missing-member hooks: from the cache's point of view
/// the hook is a stable target like any other method.
#[derive(Clone)]
pub enum ResolvedHandle {
    Direct(Arc<MethodDef>),
    Forwarding(ForwardingHandle),
    Property(PropertyHandle),
}

#[derive(Clone)]
pub enum ForwardingHandle {
    MethodMissing { name: Arc<str>, hook: MethodMissingFn },
    PropertyMissing { name: Arc<str>, hook: PropertyMissingFn },
}

#[derive(Clone)]
pub enum PropertyHandle {
    Getter(GetterFn),
    Setter(SetterFn),
    ReadField(Arc<str>),
    WriteField(Arc<str>),
}

impl ResolvedHandle {
    /// Invoke with positional arguments. Property writes receive the value as
    /// the only argument and evaluate to it.
    #[inline]
    pub fn invoke(&self, receiver: &Val, args: &[Val]) -> Result<Val> {
        match self {
            ResolvedHandle::Direct(method) => method.invoke(receiver, args),
            ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing { name, hook }) => hook(receiver, name.as_ref(), args),
            ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing { name, hook }) => {
                hook(receiver, name.as_ref(), args.first())
            }
            ResolvedHandle::Property(PropertyHandle::Getter(getter)) => getter(receiver),
            ResolvedHandle::Property(PropertyHandle::Setter(setter)) => {
                let value = written_value(args)?;
                setter(receiver, value)?;
                Ok(value.clone())
            }
            ResolvedHandle::Property(PropertyHandle::ReadField(name)) => {
                let instance = receiver
                    .as_object()
                    .ok_or_else(|| anyhow!("cannot read field {name} of {}", receiver.type_name()))?;
                Ok(instance.field(name).unwrap_or_default())
            }
            ResolvedHandle::Property(PropertyHandle::WriteField(name)) => {
                let value = written_value(args)?;
                let instance = receiver
                    .as_object()
                    .ok_or_else(|| anyhow!("cannot write field {name} of {}", receiver.type_name()))?;
                instance.set_field(name, value.clone());
                Ok(value.clone())
            }
        }
    }

    pub fn is_forwarding(&self) -> bool {
        matches!(self, ResolvedHandle::Forwarding(_))
    }

    pub fn as_method(&self) -> Option<&Arc<MethodDef>> {
        match self {
            ResolvedHandle::Direct(method) => Some(method),
            _ => None,
        }
    }

    /// Same target, used to tell a rebind from a real change.
    pub fn same_target(&self, other: &ResolvedHandle) -> bool {
        match (self, other) {
            (ResolvedHandle::Direct(a), ResolvedHandle::Direct(b)) => Arc::ptr_eq(a, b),
            (
                ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing { hook: a, .. }),
                ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing { hook: b, .. }),
            ) => Arc::ptr_eq(a, b),
            (
                ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing { hook: a, .. }),
                ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing { hook: b, .. }),
            ) => Arc::ptr_eq(a, b),
            (ResolvedHandle::Property(PropertyHandle::Getter(a)), ResolvedHandle::Property(PropertyHandle::Getter(b))) => {
                Arc::ptr_eq(a, b)
            }
            (ResolvedHandle::Property(PropertyHandle::Setter(a)), ResolvedHandle::Property(PropertyHandle::Setter(b))) => {
                Arc::ptr_eq(a, b)
            }
            (
                ResolvedHandle::Property(PropertyHandle::ReadField(a)),
                ResolvedHandle::Property(PropertyHandle::ReadField(b)),
            )
            | (
                ResolvedHandle::Property(PropertyHandle::WriteField(a)),
                ResolvedHandle::Property(PropertyHandle::WriteField(b)),
            ) => a == b,
            _ => false,
        }
    }

    pub fn describe(&self, classes: &ClassTable) -> String {
        match self {
            ResolvedHandle::Direct(method) => method.describe(classes),
            ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing { name, .. }) => {
                format!("methodMissing({name})")
            }
            ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing { name, .. }) => {
                format!("propertyMissing({name})")
            }
            ResolvedHandle::Property(PropertyHandle::Getter(_)) => "getter".to_string(),
            ResolvedHandle::Property(PropertyHandle::Setter(_)) => "setter".to_string(),
            ResolvedHandle::Property(PropertyHandle::ReadField(name)) => format!("field {name}"),
            ResolvedHandle::Property(PropertyHandle::WriteField(name)) => format!("field {name}="),
        }
    }
}

impl std::fmt::Debug for ResolvedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedHandle::Direct(method) => f.debug_tuple("Direct").field(method).finish(),
            ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing { name, .. }) => {
                write!(f, "Forwarding(methodMissing {name})")
            }
            ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing { name, .. }) => {
                write!(f, "Forwarding(propertyMissing {name})")
            }
            ResolvedHandle::Property(PropertyHandle::Getter(_)) => write!(f, "Property(getter)"),
            ResolvedHandle::Property(PropertyHandle::Setter(_)) => write!(f, "Property(setter)"),
            ResolvedHandle::Property(PropertyHandle::ReadField(name)) => write!(f, "Property(read {name})"),
            ResolvedHandle::Property(PropertyHandle::WriteField(name)) => write!(f, "Property(write {name})"),
        }
    }
}

fn written_value(args: &[Val]) -> Result<&Val> {
    match args {
        [value] => Ok(value),
        _ => Err(anyhow!("property write expects exactly 1 value, got {}", args.len())),
    }
}
