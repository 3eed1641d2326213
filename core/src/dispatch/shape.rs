use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::meta::ClassId;
use crate::val::Val;

/// Argument fingerprints up to this many arguments are kept inline.
pub const INLINE_ARGS: usize = 6;

/// Runtime classes of the arguments of one call, computed once per call and used
/// both as part of the cache key and as the resolver input.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ArgShape {
    // Unused tail tags are always `ClassId::OBJECT` so derived equality holds.
    Inline { len: u8, tags: [ClassId; INLINE_ARGS] },
    Spilled(Arc<[ClassId]>),
}

impl ArgShape {
    pub const EMPTY: ArgShape = ArgShape::Inline {
        len: 0,
        tags: [ClassId::OBJECT; INLINE_ARGS],
    };

    #[inline]
    pub fn of(args: &[Val]) -> Self {
        if args.len() <= INLINE_ARGS {
            let mut tags = [ClassId::OBJECT; INLINE_ARGS];
            for (tag, arg) in tags.iter_mut().zip(args) {
                *tag = arg.class_id();
            }
            ArgShape::Inline {
                len: args.len() as u8,
                tags,
            }
        } else {
            ArgShape::Spilled(args.iter().map(Val::class_id).collect())
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[ClassId] {
        match self {
            ArgShape::Inline { len, tags } => &tags[..*len as usize],
            ArgShape::Spilled(tags) => tags,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ArgShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice().iter().map(|c| c.0)).finish()
    }
}

/// Receiver part of a shape. Receivers carrying an expando meta-class get their
/// own key because their dispatch table differs from their class's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ReceiverKey {
    Class(ClassId),
    Expando { class: ClassId, instance: u64 },
}

impl ReceiverKey {
    #[inline]
    pub fn of(receiver: &Val) -> Self {
        match receiver {
            Val::Object(instance) if instance.has_expando() => ReceiverKey::Expando {
                class: instance.class(),
                instance: instance.id(),
            },
            other => ReceiverKey::Class(other.class_id()),
        }
    }

    #[inline]
    pub fn class(self) -> ClassId {
        match self {
            ReceiverKey::Class(class) | ReceiverKey::Expando { class, .. } => class,
        }
    }
}

/// Inline cache key: receiver plus argument fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    pub receiver: ReceiverKey,
    pub args: ArgShape,
}

impl ShapeKey {
    #[inline]
    pub fn of(receiver: &Val, args: &[Val]) -> Self {
        Self {
            receiver: ReceiverKey::of(receiver),
            args: ArgShape::of(args),
        }
    }
}

/// Memo key for resolutions: a method named `method_name`, invocable with
/// `parameter_shape` on `declaring_type`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub declaring_type: ClassId,
    pub method_name: Arc<str>,
    pub parameter_shape: ArgShape,
    pub arity: usize,
}

impl MethodKey {
    pub fn new(declaring_type: ClassId, method_name: &str, parameter_shape: ArgShape) -> Self {
        let arity = parameter_shape.len();
        Self {
            declaring_type,
            method_name: Arc::from(method_name),
            parameter_shape,
            arity,
        }
    }
}
