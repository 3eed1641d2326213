use std::{fmt, sync::Arc};

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::meta::{ClassId, ClassTable};
use crate::val::Val;

/// Native method body. Receives the receiver and the positional arguments.
pub type NativeFn = Arc<dyn Fn(&Val, &[Val]) -> Result<Val> + Send + Sync>;

/// `methodMissing(name, args)` hook.
pub type MethodMissingFn = Arc<dyn Fn(&Val, &str, &[Val]) -> Result<Val> + Send + Sync>;

/// `propertyMissing(name[, value])` hook; `None` means a read.
pub type PropertyMissingFn = Arc<dyn Fn(&Val, &str, Option<&Val>) -> Result<Val> + Send + Sync>;

pub type GetterFn = Arc<dyn Fn(&Val) -> Result<Val> + Send + Sync>;

pub type SetterFn = Arc<dyn Fn(&Val, &Val) -> Result<()> + Send + Sync>;

/// Declared parameter kind. `Any` is the erased (`def`) parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ParamType {
    Any,
    Class(ClassId),
}

impl ParamType {
    /// Argument of runtime class `arg` matches this parameter without any conversion.
    #[inline]
    pub fn is_exact(self, arg: ClassId) -> bool {
        matches!(self, ParamType::Class(c) if c == arg)
    }

    /// Argument of runtime class `arg` can be passed here, possibly through subtyping,
    /// `Int` -> `Float` widening, boxing into `Any`, or `Nil` into a reference type.
    pub fn accepts(self, arg: ClassId, classes: &ClassTable) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::Class(target) => {
                if arg == target || classes.is_assignable(arg, target) {
                    return true;
                }
                if arg == ClassId::INT && target == ClassId::FLOAT {
                    return true;
                }
                arg == ClassId::NULL && !target.is_primitive()
            }
        }
    }

    /// The converted value a coerced match passes in; only `Int` -> `Float`
    /// widening changes the value.
    #[inline]
    pub fn widen(self, value: &Val) -> Option<Val> {
        match (self, value) {
            (ParamType::Class(ClassId::FLOAT), Val::Int(i)) => Some(Val::Float(*i as f64)),
            _ => None,
        }
    }

    /// `self` is at least as specific as `other`.
    pub fn narrower_or_equal(self, other: ParamType, classes: &ClassTable) -> bool {
        match (self, other) {
            (_, ParamType::Any) => true,
            (ParamType::Any, ParamType::Class(_)) => false,
            (ParamType::Class(a), ParamType::Class(b)) => {
                a == b || classes.is_assignable(a, b) || (a == ClassId::INT && b == ClassId::FLOAT)
            }
        }
    }

    pub fn describe(self, classes: &ClassTable) -> String {
        match self {
            ParamType::Any => "Object".to_string(),
            ParamType::Class(id) => classes.name_of(id).to_string(),
        }
    }
}

impl From<ClassId> for ParamType {
    fn from(value: ClassId) -> Self {
        ParamType::Class(value)
    }
}

/// Where a method came from; native methods win ties against category methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MethodOrigin {
    /// Declared on the class definition.
    Declared,
    /// Added at runtime through a meta-class override.
    Injected,
    /// Added through category/extension injection.
    Category,
}

impl MethodOrigin {
    #[inline]
    pub fn is_native(self) -> bool {
        !matches!(self, MethodOrigin::Category)
    }
}

/// A callable method: name, parameter list and body.
#[derive(Clone)]
pub struct MethodDef {
    name: Arc<str>,
    params: Arc<[ParamType]>,
    varargs: bool,
    origin: MethodOrigin,
    body: NativeFn,
}

impl MethodDef {
    pub fn new<F>(name: &str, params: impl IntoIterator<Item = ParamType>, body: F) -> Self
    where
        F: Fn(&Val, &[Val]) -> Result<Val> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            params: params.into_iter().collect::<Vec<_>>().into(),
            varargs: false,
            origin: MethodOrigin::Declared,
            body: Arc::new(body),
        }
    }

    /// Variadic method: the last parameter is the element type of the trailing
    /// arguments, which are packed into a `List` when the method is invoked.
    pub fn variadic<F>(name: &str, params: impl IntoIterator<Item = ParamType>, body: F) -> Self
    where
        F: Fn(&Val, &[Val]) -> Result<Val> + Send + Sync + 'static,
    {
        let mut def = Self::new(name, params, body);
        debug_assert!(!def.params.is_empty(), "variadic method needs an element parameter");
        def.varargs = true;
        def
    }

    pub(crate) fn with_origin(mut self, origin: MethodOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn is_varargs(&self) -> bool {
        self.varargs
    }

    #[inline]
    pub fn origin(&self) -> MethodOrigin {
        self.origin
    }

    pub fn same_signature(&self, other: &MethodDef) -> bool {
        self.name == other.name && self.varargs == other.varargs && self.params == other.params
    }

    /// Fixed-arity applicability, with or without conversions.
    pub(crate) fn accepts_exact(&self, args: &[ClassId]) -> bool {
        !self.varargs
            && self.params.len() == args.len()
            && self.params.iter().zip(args).all(|(p, a)| p.is_exact(*a))
    }

    pub(crate) fn accepts_coerced(&self, args: &[ClassId], classes: &ClassTable) -> bool {
        !self.varargs
            && self.params.len() == args.len()
            && self.params.iter().zip(args).all(|(p, a)| p.accepts(*a, classes))
    }

    pub(crate) fn accepts_varargs(&self, args: &[ClassId], classes: &ClassTable) -> bool {
        if !self.varargs {
            return false;
        }
        let fixed = self.params.len() - 1;
        if args.len() < fixed {
            return false;
        }
        let element = self.params[fixed];
        self.params[..fixed].iter().zip(args).all(|(p, a)| p.accepts(*a, classes))
            && args[fixed..].iter().all(|a| element.accepts(*a, classes))
    }

    /// Every parameter of `self` is assignable to the matching parameter of `other`.
    pub(crate) fn at_least_as_specific(&self, other: &MethodDef, classes: &ClassTable) -> bool {
        self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|(a, b)| a.narrower_or_equal(*b, classes))
    }

    pub fn invoke(&self, receiver: &Val, args: &[Val]) -> Result<Val> {
        if !self.varargs {
            if !self.params.iter().zip(args).any(|(p, a)| p.widen(a).is_some()) {
                return (self.body)(receiver, args);
            }
            let widened: Vec<Val> = args
                .iter()
                .enumerate()
                .map(|(idx, arg)| widen_or_clone(self.params.get(idx).copied(), arg))
                .collect();
            return (self.body)(receiver, &widened);
        }
        let fixed = self.params.len() - 1;
        if args.len() < fixed {
            return Err(anyhow!(
                "{}() expects at least {} argument(s), got {}",
                self.name,
                fixed,
                args.len()
            ));
        }
        let element = self.params[fixed];
        let mut packed = Vec::with_capacity(fixed + 1);
        packed.extend(
            self.params[..fixed]
                .iter()
                .zip(&args[..fixed])
                .map(|(p, a)| widen_or_clone(Some(*p), a)),
        );
        packed.push(Val::list(args[fixed..].iter().map(|a| widen_or_clone(Some(element), a))));
        (self.body)(receiver, &packed)
    }

    pub fn describe(&self, classes: &ClassTable) -> String {
        let mut params: Vec<String> = self.params.iter().map(|p| p.describe(classes)).collect();
        if self.varargs
            && let Some(last) = params.last_mut()
        {
            last.push_str("...");
        }
        format!("{}({})", self.name, params.join(", "))
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("varargs", &self.varargs)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Getter/setter pair registered for a property name.
#[derive(Clone, Default)]
pub struct PropertyAccessor {
    pub getter: Option<GetterFn>,
    pub setter: Option<SetterFn>,
}

impl PropertyAccessor {
    pub fn read_only<G>(getter: G) -> Self
    where
        G: Fn(&Val) -> Result<Val> + Send + Sync + 'static,
    {
        Self {
            getter: Some(Arc::new(getter)),
            setter: None,
        }
    }

    pub fn read_write<G, S>(getter: G, setter: S) -> Self
    where
        G: Fn(&Val) -> Result<Val> + Send + Sync + 'static,
        S: Fn(&Val, &Val) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            getter: Some(Arc::new(getter)),
            setter: Some(Arc::new(setter)),
        }
    }
}

impl fmt::Debug for PropertyAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyAccessor")
            .field("readable", &self.getter.is_some())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

#[inline]
fn widen_or_clone(param: Option<ParamType>, arg: &Val) -> Val {
    param.and_then(|p| p.widen(arg)).unwrap_or_else(|| arg.clone())
}
