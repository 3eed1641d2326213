use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use once_cell::sync::OnceCell;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::meta::{ClassId, MetaClassCell};
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};

/// Runtime value flowing through call sites.
///
/// Every value has a runtime class ([`Val::class_id`]); that class, together with
/// the argument classes, forms the shape that inline caches key on.
#[derive(Clone, Default)]
pub enum Val {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<[Val]>),
    Object(Arc<Instance>),
}

impl Val {
    #[inline]
    pub fn class_id(&self) -> ClassId {
        match self {
            Val::Nil => ClassId::NULL,
            Val::Bool(_) => ClassId::BOOL,
            Val::Int(_) => ClassId::INT,
            Val::Float(_) => ClassId::FLOAT,
            Val::Str(_) => ClassId::STRING,
            Val::List(_) => ClassId::LIST,
            Val::Object(instance) => instance.class(),
        }
    }

    pub fn str(s: impl AsRef<str>) -> Self {
        Val::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: impl IntoIterator<Item = Val>) -> Self {
        Val::List(items.into_iter().collect::<Vec<_>>().into())
    }

    /// Allocate a fresh instance of `class` with no fields set.
    pub fn new_object(class: ClassId) -> Self {
        Val::Object(Instance::new(class))
    }

    #[inline]
    pub fn as_object(&self) -> Option<&Arc<Instance>> {
        match self {
            Val::Object(instance) => Some(instance),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Val::Nil)
    }

    /// Builtin kind name; objects report `"Object"`. Class names live in the
    /// class table, see [`crate::meta::ClassTable::name_of`].
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "Nil",
            Val::Bool(_) => "Bool",
            Val::Int(_) => "Int",
            Val::Float(_) => "Float",
            Val::Str(_) => "String",
            Val::List(_) => "List",
            Val::Object(_) => "Object",
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Nil, Val::Nil) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => (*a as f64) == *b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => a == b,
            (Val::Object(a), Val::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => write!(f, "Nil"),
            Val::Bool(b) => write!(f, "Bool({b})"),
            Val::Int(i) => write!(f, "Int({i})"),
            Val::Float(x) => write!(f, "Float({x})"),
            Val::Str(s) => write!(f, "Str({s:?})"),
            Val::List(items) => f.debug_list().entries(items.iter()).finish(),
            Val::Object(instance) => write!(f, "Object(#{} class={})", instance.id(), instance.class()),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => write!(f, "nil"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int(i) => write!(f, "{i}"),
            Val::Float(x) => write!(f, "{x}"),
            Val::Str(s) => write!(f, "{s}"),
            Val::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Val::Object(instance) => write!(f, "<{}#{}>", instance.class(), instance.id()),
        }
    }
}

impl Serialize for Val {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Val::Nil => serializer.serialize_unit(),
            Val::Bool(b) => serializer.serialize_bool(*b),
            Val::Int(i) => serializer.serialize_i64(*i),
            Val::Float(x) => serializer.serialize_f64(*x),
            Val::Str(s) => serializer.serialize_str(s),
            Val::List(items) => items.as_ref().serialize(serializer),
            Val::Object(instance) => {
                let fields = instance.fields_snapshot();
                let mut map = serializer.serialize_map(Some(fields.len() + 2))?;
                map.serialize_entry("@class", &instance.class().0)?;
                map.serialize_entry("@id", &instance.id())?;
                let mut names: Vec<_> = fields.keys().collect();
                names.sort();
                for name in names {
                    map.serialize_entry(name.as_ref(), &fields[name])?;
                }
                map.end()
            }
        }
    }
}

impl From<bool> for Val {
    fn from(value: bool) -> Self {
        Val::Bool(value)
    }
}

impl From<i64> for Val {
    fn from(value: i64) -> Self {
        Val::Int(value)
    }
}

impl From<f64> for Val {
    fn from(value: f64) -> Self {
        Val::Float(value)
    }
}

impl From<&str> for Val {
    fn from(value: &str) -> Self {
        Val::str(value)
    }
}

impl From<String> for Val {
    fn from(value: String) -> Self {
        Val::Str(Arc::from(value))
    }
}

impl From<Arc<Instance>> for Val {
    fn from(value: Arc<Instance>) -> Self {
        Val::Object(value)
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A heap object of a user or fixture class.
///
/// Field storage is per instance; which fields exist is declared on the class.
/// The optional expando meta-class holds per-instance overrides and dies with the
/// instance.
pub struct Instance {
    id: u64,
    class: ClassId,
    fields: Mutex<FastHashMap<Arc<str>, Val>>,
    expando: OnceCell<Arc<MetaClassCell>>,
}

impl Instance {
    pub fn new(class: ClassId) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            class,
            fields: Mutex::new(fast_hash_map_new()),
            expando: OnceCell::new(),
        })
    }

    pub fn with_fields<I, K>(class: ClassId, fields: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (K, Val)>,
        K: AsRef<str>,
    {
        let instance = Self::new(class);
        {
            let mut slots = instance.lock_fields();
            for (name, value) in fields {
                slots.insert(Arc::from(name.as_ref()), value);
            }
        }
        instance
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn field(&self, name: &str) -> Option<Val> {
        self.lock_fields().get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Val) -> Option<Val> {
        let mut fields = self.lock_fields();
        match fields.get_mut(name) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => fields.insert(Arc::from(name), value),
        }
    }

    pub fn fields_snapshot(&self) -> FastHashMap<Arc<str>, Val> {
        self.lock_fields().clone()
    }

    /// Per-instance meta-class, if any override was ever applied to this instance.
    #[inline]
    pub(crate) fn expando(&self) -> Option<&Arc<MetaClassCell>> {
        self.expando.get()
    }

    pub(crate) fn expando_or_init(&self, init: impl FnOnce() -> Arc<MetaClassCell>) -> &Arc<MetaClassCell> {
        self.expando.get_or_init(init)
    }

    pub fn has_expando(&self) -> bool {
        self.expando.get().is_some()
    }

    fn lock_fields(&self) -> std::sync::MutexGuard<'_, FastHashMap<Arc<str>, Val>> {
        // Field maps hold plain values; a panic mid-update cannot leave them torn.
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("expando", &self.has_expando())
            .finish()
    }
}
