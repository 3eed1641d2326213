use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, trace};

use crate::config::DispatchConfig;
use crate::dispatch::{
    ArgShape, CallSiteKind, ForwardingHandle, MethodKey, PropertyHandle, ResolvedHandle, VersionGuard,
};
use crate::error::DispatchError;
use crate::meta::{ClassId, ClassTable, MetaClass, MetaClassRegistry, MethodDef};
use crate::util::fast_map::{FastDashMap, fast_dash_map_new};
use crate::val::Val;

/// A resolved handle plus the versions it is valid for.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub handle: ResolvedHandle,
    pub guard: VersionGuard,
}

struct MemoEntry {
    version: u64,
    handle: ResolvedHandle,
}

/// Finds the best-matching handle for a (receiver class, name, argument classes)
/// triple.
///
/// Precedence, first match wins:
/// 1. per class along the lookup chain (own class, superclasses nearest-first,
///    then interfaces/traits): an exact-type fixed-arity match, then a match
///    through coercion;
/// 2. a varargs match anywhere along the chain;
/// 3. the `methodMissing` hook (resolves to a forwarding handle);
/// 4. otherwise [`DispatchError::UnresolvedMethod`].
///
/// Within one step the most specific candidate wins; incomparable candidates are
/// rejected as ambiguous. Category methods lose ties against native ones.
pub struct MethodResolver {
    registry: Arc<MetaClassRegistry>,
    memo: FastDashMap<MethodKey, MemoEntry>,
    memoize: bool,
    memo_capacity: usize,
    invocations: AtomicU64,
    full_resolutions: AtomicU64,
    memo_hits: AtomicU64,
}

impl MethodResolver {
    pub fn new(registry: Arc<MetaClassRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            memo: fast_dash_map_new(),
            memoize: config.memoize_resolutions,
            memo_capacity: config.memo_capacity.max(1),
            invocations: AtomicU64::new(0),
            full_resolutions: AtomicU64::new(0),
            memo_hits: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<MetaClassRegistry> {
        &self.registry
    }

    /// Resolve a method against the current hierarchy and meta-classes. Pure: no
    /// memo, no counters.
    pub fn resolve(
        &self,
        receiver_class: ClassId,
        method_name: &str,
        arg_types: &[ClassId],
    ) -> Result<ResolvedHandle, DispatchError> {
        let classes = self.registry.classes();
        let metas = self.chain_metas(&classes, None, receiver_class)?;
        self.find_method(&classes, &metas, receiver_class, method_name, arg_types)
    }

    /// Resolve for a concrete receiver, capturing the version guard the result is
    /// valid under. Expando receivers see their per-instance overrides first.
    pub fn resolve_for(
        &self,
        kind: CallSiteKind,
        receiver: &Val,
        name: &str,
        args: &ArgShape,
    ) -> Result<Resolution, DispatchError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let class = receiver.class_id();
        let class_cell = self.registry.cell(class)?;
        let expando = receiver.as_object().and_then(|instance| instance.expando()).cloned();
        let guard = VersionGuard::capture(
            class_cell.version_cell().clone(),
            expando.as_ref().map(|cell| cell.version_cell().clone()),
        );

        let memo_key = (self.memoize && kind == CallSiteKind::Method && expando.is_none())
            .then(|| MethodKey::new(class, name, args.clone()));
        if let Some(key) = &memo_key
            && let Some(hit) = self.memo.get(key)
            && hit.version == guard.class_version()
        {
            self.memo_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Resolution {
                handle: hit.handle.clone(),
                guard,
            });
        }

        self.full_resolutions.fetch_add(1, Ordering::Relaxed);
        let classes = self.registry.classes();
        let expando_meta = expando.as_ref().map(|cell| cell.load());
        let metas = self.chain_metas(&classes, expando_meta, class)?;
        let outcome = match kind {
            CallSiteKind::Method => self.find_method(&classes, &metas, class, name, args.as_slice()),
            CallSiteKind::GetProperty => self.find_property(&classes, &metas, class, name, None),
            CallSiteKind::SetProperty => {
                let value = args.as_slice().first().copied().unwrap_or(ClassId::NULL);
                self.find_property(&classes, &metas, class, name, Some(value))
            }
        };
        let handle = match outcome {
            Ok(handle) => handle,
            Err(err) => {
                debug!(
                    target: "dynsite::resolve",
                    class = %classes.name_of(class),
                    member = name,
                    kind = %kind,
                    error = %err,
                    "resolution failed"
                );
                return Err(err);
            }
        };
        trace!(
            target: "dynsite::resolve",
            class = %classes.name_of(class),
            member = name,
            kind = %kind,
            handle = ?handle,
            "resolved"
        );

        if let Some(key) = memo_key {
            if self.memo.len() >= self.memo_capacity {
                self.memo.clear();
            }
            self.memo.insert(
                key,
                MemoEntry {
                    version: guard.class_version(),
                    handle: handle.clone(),
                },
            );
        }
        Ok(Resolution { handle, guard })
    }

    pub fn clear_memo(&self) {
        self.memo.clear();
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    /// Calls into [`MethodResolver::resolve_for`].
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Resolutions that walked the hierarchy instead of hitting the memo.
    pub fn full_resolutions(&self) -> u64 {
        self.full_resolutions.load(Ordering::Relaxed)
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits.load(Ordering::Relaxed)
    }

    fn chain_metas(
        &self,
        classes: &ClassTable,
        expando: Option<Arc<MetaClass>>,
        class: ClassId,
    ) -> Result<Vec<Arc<MetaClass>>, DispatchError> {
        let entry = classes.entry(class)?;
        let mut metas = Vec::with_capacity(entry.chain().len() + 1);
        metas.extend(expando);
        for &id in entry.chain() {
            metas.push(self.registry.cell(id)?.load());
        }
        Ok(metas)
    }

    fn find_method(
        &self,
        classes: &ClassTable,
        metas: &[Arc<MetaClass>],
        class: ClassId,
        name: &str,
        args: &[ClassId],
    ) -> Result<ResolvedHandle, DispatchError> {
        if let Some(method) = find_fixed(classes, metas, class, name, args)? {
            return Ok(ResolvedHandle::Direct(method));
        }
        for meta in metas {
            let candidates = meta.varargs_candidates(name);
            if candidates.is_empty() {
                continue;
            }
            let applicable = candidates.iter().filter(|m| m.accepts_varargs(args, classes));
            if let Some(method) = most_specific(classes, class, name, args, applicable)? {
                return Ok(ResolvedHandle::Direct(method));
            }
        }
        if let Some(hook) = metas.iter().find_map(|meta| meta.method_missing()) {
            return Ok(ResolvedHandle::Forwarding(ForwardingHandle::MethodMissing {
                name: Arc::from(name),
                hook: hook.clone(),
            }));
        }
        Err(DispatchError::UnresolvedMethod {
            class: classes.name_of(class).to_string(),
            method: name.to_string(),
            args: describe_args(classes, args),
        })
    }

    fn find_property(
        &self,
        classes: &ClassTable,
        metas: &[Arc<MetaClass>],
        class: ClassId,
        name: &str,
        write: Option<ClassId>,
    ) -> Result<ResolvedHandle, DispatchError> {
        if let Some(accessor) = metas.iter().find_map(|meta| meta.property(name)) {
            let handle = match write {
                None => accessor.getter.clone().map(PropertyHandle::Getter),
                Some(_) => accessor.setter.clone().map(PropertyHandle::Setter),
            };
            return handle.map(ResolvedHandle::Property).ok_or_else(|| {
                let class = classes.name_of(class).to_string();
                let property = name.to_string();
                match write {
                    None => DispatchError::PropertyNotReadable { class, property },
                    Some(_) => DispatchError::PropertyNotWritable { class, property },
                }
            });
        }

        let suffix = capitalize(name);
        let bean = match write {
            None => match find_fixed(classes, metas, class, &format!("get{suffix}"), &[])? {
                Some(getter) => Some(getter),
                None => find_fixed(classes, metas, class, &format!("is{suffix}"), &[])?,
            },
            Some(value) => find_fixed(classes, metas, class, &format!("set{suffix}"), &[value])?,
        };
        if let Some(method) = bean {
            return Ok(ResolvedHandle::Direct(method));
        }

        let declared = classes
            .chain(class)
            .iter()
            .any(|id| classes.get(*id).is_some_and(|entry| entry.declares_field(name)));
        if declared {
            let field: Arc<str> = Arc::from(name);
            return Ok(ResolvedHandle::Property(match write {
                None => PropertyHandle::ReadField(field),
                Some(_) => PropertyHandle::WriteField(field),
            }));
        }

        if let Some(hook) = metas.iter().find_map(|meta| meta.property_missing()) {
            return Ok(ResolvedHandle::Forwarding(ForwardingHandle::PropertyMissing {
                name: Arc::from(name),
                hook: hook.clone(),
            }));
        }
        Err(DispatchError::UnresolvedProperty {
            class: classes.name_of(class).to_string(),
            property: name.to_string(),
        })
    }
}

impl std::fmt::Debug for MethodResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodResolver")
            .field("memoize", &self.memoize)
            .field("memo_entries", &self.memo.len())
            .field("invocations", &self.invocations())
            .field("full_resolutions", &self.full_resolutions())
            .finish()
    }
}

// Per class along the chain: exact match first, then coercion.
fn find_fixed(
    classes: &ClassTable,
    metas: &[Arc<MetaClass>],
    class: ClassId,
    name: &str,
    args: &[ClassId],
) -> Result<Option<Arc<MethodDef>>, DispatchError> {
    for meta in metas {
        let candidates = meta.candidates(name, args.len());
        if candidates.is_empty() {
            continue;
        }
        let exact = candidates.iter().filter(|m| m.accepts_exact(args));
        if let Some(method) = most_specific(classes, class, name, args, exact)? {
            return Ok(Some(method));
        }
        let coerced = candidates.iter().filter(|m| m.accepts_coerced(args, classes));
        if let Some(method) = most_specific(classes, class, name, args, coerced)? {
            return Ok(Some(method));
        }
    }
    Ok(None)
}

fn most_specific<'a>(
    classes: &ClassTable,
    class: ClassId,
    name: &str,
    args: &[ClassId],
    applicable: impl Iterator<Item = &'a Arc<MethodDef>>,
) -> Result<Option<Arc<MethodDef>>, DispatchError> {
    let applicable: Vec<&Arc<MethodDef>> = applicable.collect();
    match applicable.as_slice() {
        [] => return Ok(None),
        [only] => return Ok(Some(Arc::clone(only))),
        _ => {}
    }

    let maximal: Vec<&Arc<MethodDef>> = applicable
        .iter()
        .copied()
        .filter(|candidate| {
            !applicable.iter().any(|other| {
                !Arc::ptr_eq(other, candidate)
                    && other.at_least_as_specific(candidate, classes)
                    && !candidate.at_least_as_specific(other, classes)
            })
        })
        .collect();

    if let [only] = maximal.as_slice() {
        return Ok(Some(Arc::clone(only)));
    }
    // Identical signatures only differ by origin: native wins, otherwise the
    // most recently installed.
    if let Some(first) = maximal.first()
        && maximal.iter().all(|m| m.same_signature(first))
    {
        let pick = maximal
            .iter()
            .find(|m| m.origin().is_native())
            .or_else(|| maximal.last())
            .copied()
            .unwrap_or(*first);
        return Ok(Some(Arc::clone(pick)));
    }

    Err(DispatchError::AmbiguousOverload {
        class: classes.name_of(class).to_string(),
        method: name.to_string(),
        args: describe_args(classes, args),
        candidates: maximal
            .iter()
            .map(|m| m.describe(classes))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn describe_args(classes: &ClassTable, args: &[ClassId]) -> String {
    args.iter().map(|id| classes.name_of(*id)).collect::<Vec<_>>().join(", ")
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
