use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::meta::{
    ClassEntry, ClassId, MethodDef, MethodMissingFn, MethodOrigin, ParamType, PropertyAccessor, PropertyMissingFn,
};
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::Val;

// Versions come from one process-wide clock, so a stamp is never handed out twice
// even across different classes or re-created cells.
static VERSION_CLOCK: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_stamp() -> u64 {
    VERSION_CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}

/// Monotonic version of one meta-class. Cache entries remember the value they
/// were bound at and compare it on every probe.
#[derive(Debug)]
pub struct VersionCell(AtomicU64);

impl VersionCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(next_stamp()))
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn bump(&self) -> u64 {
        let stamp = next_stamp();
        self.0.fetch_max(stamp, Ordering::AcqRel);
        stamp
    }
}

/// Who a meta-class belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaOwner {
    Class(ClassId),
    Instance { class: ClassId, instance: u64 },
}

impl MetaOwner {
    pub fn class(self) -> ClassId {
        match self {
            MetaOwner::Class(class) | MetaOwner::Instance { class, .. } => class,
        }
    }
}

/// Runtime change to a meta-class. Every mutation invalidates afterwards.
#[derive(Clone)]
pub enum MetaMutation {
    /// Add a method, replacing any method with the same signature.
    AddMethod(MethodDef),
    RemoveMethod { name: String, params: Vec<ParamType> },
    /// Category/extension method; loses ties against native methods.
    AddCategoryMethod(MethodDef),
    SetProperty { name: String, accessor: PropertyAccessor },
    RemoveProperty(String),
    SetMethodMissing(Option<MethodMissingFn>),
    SetPropertyMissing(Option<PropertyMissingFn>),
}

impl MetaMutation {
    pub fn method_missing<F>(hook: F) -> Self
    where
        F: Fn(&Val, &str, &[Val]) -> anyhow::Result<Val> + Send + Sync + 'static,
    {
        MetaMutation::SetMethodMissing(Some(Arc::new(hook)))
    }

    pub fn property_missing<F>(hook: F) -> Self
    where
        F: Fn(&Val, &str, Option<&Val>) -> anyhow::Result<Val> + Send + Sync + 'static,
    {
        MetaMutation::SetPropertyMissing(Some(Arc::new(hook)))
    }

    pub fn label(&self) -> &'static str {
        match self {
            MetaMutation::AddMethod(_) => "add_method",
            MetaMutation::RemoveMethod { .. } => "remove_method",
            MetaMutation::AddCategoryMethod(_) => "add_category_method",
            MetaMutation::SetProperty { .. } => "set_property",
            MetaMutation::RemoveProperty(_) => "remove_property",
            MetaMutation::SetMethodMissing(_) => "set_method_missing",
            MetaMutation::SetPropertyMissing(_) => "set_property_missing",
        }
    }
}

impl fmt::Debug for MetaMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaMutation::AddMethod(m) | MetaMutation::AddCategoryMethod(m) => {
                write!(f, "{}({:?})", self.label(), m)
            }
            MetaMutation::RemoveMethod { name, params } => write!(f, "remove_method({name}, {params:?})"),
            MetaMutation::SetProperty { name, accessor } => write!(f, "set_property({name}, {accessor:?})"),
            MetaMutation::RemoveProperty(name) => write!(f, "remove_property({name})"),
            MetaMutation::SetMethodMissing(hook) => write!(f, "set_method_missing(present={})", hook.is_some()),
            MetaMutation::SetPropertyMissing(hook) => {
                write!(f, "set_property_missing(present={})", hook.is_some())
            }
        }
    }
}

/// Dispatch table of one class (or one expando instance).
///
/// A `MetaClass` is an immutable snapshot: mutations build a new value which the
/// owning [`MetaClassCell`] publishes atomically, so a lookup never sees a
/// half-applied change.
#[derive(Clone)]
pub struct MetaClass {
    owner: MetaOwner,
    // name -> arity -> overloads, in installation order
    methods: FastHashMap<Arc<str>, FastHashMap<usize, Vec<Arc<MethodDef>>>>,
    varargs: FastHashMap<Arc<str>, Vec<Arc<MethodDef>>>,
    properties: FastHashMap<Arc<str>, PropertyAccessor>,
    method_missing: Option<MethodMissingFn>,
    property_missing: Option<PropertyMissingFn>,
}

impl MetaClass {
    pub(crate) fn empty(owner: MetaOwner) -> Self {
        Self {
            owner,
            methods: fast_hash_map_new(),
            varargs: fast_hash_map_new(),
            properties: fast_hash_map_new(),
            method_missing: None,
            property_missing: None,
        }
    }

    pub(crate) fn from_class(entry: &ClassEntry) -> Self {
        let mut meta = Self::empty(MetaOwner::Class(entry.id));
        for method in &entry.declared {
            meta.insert_method(method.clone());
        }
        meta
    }

    #[inline]
    pub fn owner(&self) -> MetaOwner {
        self.owner
    }

    /// Fixed-arity overloads named `name` taking `arity` arguments.
    #[inline]
    pub fn candidates(&self, name: &str, arity: usize) -> &[Arc<MethodDef>] {
        self.methods
            .get(name)
            .and_then(|by_arity| by_arity.get(&arity))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[inline]
    pub fn varargs_candidates(&self, name: &str) -> &[Arc<MethodDef>] {
        self.varargs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.varargs.contains_key(name)
    }

    pub fn method_count(&self) -> usize {
        self.methods.values().flat_map(|m| m.values()).map(Vec::len).sum::<usize>()
            + self.varargs.values().map(Vec::len).sum::<usize>()
    }

    #[inline]
    pub fn property(&self, name: &str) -> Option<&PropertyAccessor> {
        self.properties.get(name)
    }

    #[inline]
    pub fn method_missing(&self) -> Option<&MethodMissingFn> {
        self.method_missing.as_ref()
    }

    #[inline]
    pub fn property_missing(&self) -> Option<&PropertyMissingFn> {
        self.property_missing.as_ref()
    }

    /// Copy-on-write application of `mutation`.
    pub fn apply(&self, mutation: MetaMutation) -> MetaClass {
        let mut next = self.clone();
        match mutation {
            MetaMutation::AddMethod(method) => {
                next.insert_method(Arc::new(method.with_origin(MethodOrigin::Injected)));
            }
            MetaMutation::AddCategoryMethod(method) => {
                next.insert_method(Arc::new(method.with_origin(MethodOrigin::Category)));
            }
            MetaMutation::RemoveMethod { name, params } => next.remove_method(&name, &params),
            MetaMutation::SetProperty { name, accessor } => {
                next.properties.insert(Arc::from(name.as_str()), accessor);
            }
            MetaMutation::RemoveProperty(name) => {
                next.properties.remove(name.as_str());
            }
            MetaMutation::SetMethodMissing(hook) => next.method_missing = hook,
            MetaMutation::SetPropertyMissing(hook) => next.property_missing = hook,
        }
        next
    }

    fn insert_method(&mut self, method: Arc<MethodDef>) {
        let bucket = if method.is_varargs() {
            self.varargs.entry(method.name_arc().clone()).or_default()
        } else {
            self.methods
                .entry(method.name_arc().clone())
                .or_default()
                .entry(method.arity())
                .or_default()
        };
        // Same origin class (native or category) and same signature: replace in place.
        if let Some(slot) = bucket
            .iter_mut()
            .find(|m| m.same_signature(&method) && m.origin().is_native() == method.origin().is_native())
        {
            *slot = method;
        } else {
            bucket.push(method);
        }
    }

    fn remove_method(&mut self, name: &str, params: &[ParamType]) {
        if let Some(by_arity) = self.methods.get_mut(name) {
            if let Some(bucket) = by_arity.get_mut(&params.len()) {
                bucket.retain(|m| m.params() != params);
                if bucket.is_empty() {
                    by_arity.remove(&params.len());
                }
            }
            if by_arity.is_empty() {
                self.methods.remove(name);
            }
        }
        if let Some(bucket) = self.varargs.get_mut(name) {
            bucket.retain(|m| m.params() != params);
            if bucket.is_empty() {
                self.varargs.remove(name);
            }
        }
    }
}

impl fmt::Debug for MetaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaClass")
            .field("owner", &self.owner)
            .field("methods", &self.method_count())
            .field("properties", &self.properties.len())
            .field("method_missing", &self.method_missing.is_some())
            .field("property_missing", &self.property_missing.is_some())
            .finish()
    }
}

/// Canonical, versioned slot holding the current [`MetaClass`] of one owner.
pub struct MetaClassCell {
    owner: MetaOwner,
    current: ArcSwap<MetaClass>,
    version: Arc<VersionCell>,
    write: Mutex<()>,
}

impl MetaClassCell {
    pub(crate) fn new(meta: MetaClass) -> Self {
        Self {
            owner: meta.owner(),
            current: ArcSwap::from_pointee(meta),
            version: Arc::new(VersionCell::new()),
            write: Mutex::new(()),
        }
    }

    #[inline]
    pub fn owner(&self) -> MetaOwner {
        self.owner
    }

    #[inline]
    pub fn load(&self) -> Arc<MetaClass> {
        self.current.load_full()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.current()
    }

    #[inline]
    pub(crate) fn version_cell(&self) -> &Arc<VersionCell> {
        &self.version
    }

    /// Publish the mutated snapshot, then bump the version. Readers that observe
    /// the new version are guaranteed to load the new snapshot.
    pub(crate) fn mutate(&self, mutation: MetaMutation) -> u64 {
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.current.load().apply(mutation);
        self.current.store(Arc::new(next));
        self.version.bump()
    }
}

impl fmt::Debug for MetaClassCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaClassCell")
            .field("owner", &self.owner)
            .field("version", &self.version())
            .finish()
    }
}
