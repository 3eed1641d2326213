//! Class hierarchy, meta-classes and the versioned registry that owns them.

mod class;
mod metaclass;
mod method;
mod registry;

pub use class::{ClassDef, ClassEntry, ClassId, ClassTable};
pub use metaclass::{MetaClass, MetaClassCell, MetaMutation, MetaOwner, VersionCell};
pub use method::{
    GetterFn, MethodDef, MethodMissingFn, MethodOrigin, NativeFn, ParamType, PropertyAccessor, PropertyMissingFn,
    SetterFn,
};
pub use registry::{MetaClassRegistry, OverrideTarget};

#[cfg(test)]
mod class_test;
