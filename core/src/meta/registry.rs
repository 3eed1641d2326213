use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::error::DispatchError;
use crate::meta::{ClassDef, ClassId, ClassTable, MetaClass, MetaClassCell, MetaMutation, MetaOwner, MethodDef};
use crate::util::fast_map::{FastDashMap, fast_dash_map_new};
use crate::val::Instance;

/// Target of [`MetaClassRegistry::apply_override`].
#[derive(Clone, Copy, Debug)]
pub enum OverrideTarget<'a> {
    Class(ClassId),
    /// Per-instance ("expando") override; the meta-class is owned by the instance.
    Instance(&'a Arc<Instance>),
}

/// Process-wide mapping from runtime class to its mutable dispatch table.
///
/// Meta-classes are created lazily on first lookup and never removed. Each owns a
/// version counter; mutating a class bumps its version and the versions of every
/// class that inherits from it, and call sites heal by comparing versions on their
/// next probe.
pub struct MetaClassRegistry {
    classes: ArcSwap<ClassTable>,
    class_write: Mutex<()>,
    metas: FastDashMap<ClassId, Arc<MetaClassCell>>,
}

impl MetaClassRegistry {
    pub fn new() -> Self {
        Self {
            classes: ArcSwap::from_pointee(ClassTable::with_builtins()),
            class_write: Mutex::new(()),
            metas: fast_dash_map_new(),
        }
    }

    /// Current hierarchy snapshot.
    #[inline]
    pub fn classes(&self) -> Arc<ClassTable> {
        self.classes.load_full()
    }

    pub fn define_class(&self, def: ClassDef) -> Result<ClassId, DispatchError> {
        let _guard = self.class_write.lock().unwrap_or_else(PoisonError::into_inner);
        let name = def.name().to_string();
        let (next, id) = self.classes.load().define(def)?;
        self.classes.store(Arc::new(next));
        debug!(target: "dynsite::meta", class = %name, id = id.0, "class defined");
        Ok(id)
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.classes.load().by_name(name)
    }

    pub fn get_meta_class(&self, class: ClassId) -> Result<Arc<MetaClass>, DispatchError> {
        Ok(self.cell(class)?.load())
    }

    /// Current version of `class`'s meta-class (creating it if needed).
    pub fn version(&self, class: ClassId) -> Result<u64, DispatchError> {
        Ok(self.cell(class)?.version())
    }

    pub(crate) fn cell(&self, class: ClassId) -> Result<Arc<MetaClassCell>, DispatchError> {
        if let Some(cell) = self.metas.get(&class) {
            return Ok(cell.value().clone());
        }
        let classes = self.classes.load();
        let entry = classes.entry(class)?;
        let cell = self
            .metas
            .entry(class)
            .or_insert_with(|| Arc::new(MetaClassCell::new(MetaClass::from_class(entry))))
            .value()
            .clone();
        Ok(cell)
    }

    /// Mark `class` and everything inheriting from it stale. No call site is
    /// touched here: each one notices the new version on its next probe.
    pub fn invalidate(&self, class: ClassId) -> Result<(), DispatchError> {
        let classes = self.classes.load();
        classes.entry(class)?;
        let mut bumped = 0usize;
        for id in classes.descendants(class) {
            if let Some(cell) = self.metas.get(&id) {
                cell.version_cell().bump();
                bumped += 1;
            }
        }
        debug!(target: "dynsite::meta", class = %classes.name_of(class), bumped, "meta-class invalidated");
        Ok(())
    }

    /// Add or replace a method, property accessor or missing-member hook, then
    /// invalidate. When this returns, every later probe observes the new version.
    pub fn apply_override(&self, target: OverrideTarget<'_>, mutation: MetaMutation) -> Result<(), DispatchError> {
        match target {
            OverrideTarget::Class(class) => {
                let cell = self.cell(class)?;
                debug!(target: "dynsite::meta", class = class.0, mutation = mutation.label(), "class override");
                cell.mutate(mutation);
                self.invalidate(class)
            }
            OverrideTarget::Instance(instance) => {
                self.classes.load().entry(instance.class())?;
                let cell = instance.expando_or_init(|| {
                    Arc::new(MetaClassCell::new(MetaClass::empty(MetaOwner::Instance {
                        class: instance.class(),
                        instance: instance.id(),
                    })))
                });
                debug!(
                    target: "dynsite::meta",
                    instance = instance.id(),
                    mutation = mutation.label(),
                    "instance override"
                );
                cell.mutate(mutation);
                Ok(())
            }
        }
    }

    /// Inject a category: a batch of extension methods on `class`.
    pub fn apply_category(&self, class: ClassId, methods: impl IntoIterator<Item = MethodDef>) -> Result<(), DispatchError> {
        let cell = self.cell(class)?;
        let mut count = 0usize;
        for method in methods {
            cell.mutate(MetaMutation::AddCategoryMethod(method));
            count += 1;
        }
        debug!(target: "dynsite::meta", class = class.0, count, "category applied");
        self.invalidate(class)
    }

    /// Mix trait/interface `trait_id` into `class` at runtime. The class and all
    /// its descendants pick up the trait's methods on their next dispatch.
    pub fn apply_trait(&self, class: ClassId, trait_id: ClassId) -> Result<(), DispatchError> {
        {
            let _guard = self.class_write.lock().unwrap_or_else(PoisonError::into_inner);
            let next = self.classes.load().with_interface(class, trait_id)?;
            self.classes.store(Arc::new(next));
        }
        debug!(target: "dynsite::meta", class = class.0, trait_id = trait_id.0, "trait applied");
        self.invalidate(class)
    }

    /// Expando meta-class of `instance`, if one was ever created.
    pub fn instance_meta(&self, instance: &Instance) -> Option<Arc<MetaClass>> {
        instance.expando().map(|cell| cell.load())
    }

    /// Number of class meta-classes materialised so far.
    pub fn meta_class_count(&self) -> usize {
        self.metas.len()
    }
}

impl Default for MetaClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetaClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaClassRegistry")
            .field("classes", &self.classes.load().len())
            .field("meta_classes", &self.metas.len())
            .finish()
    }
}
