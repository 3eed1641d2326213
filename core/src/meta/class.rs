use std::{collections::VecDeque, fmt, sync::Arc};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::meta::{MethodDef, ParamType};
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::Val;

/// Identity of a runtime class. Builtins occupy the first ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const OBJECT: ClassId = ClassId(0);
    pub const NULL: ClassId = ClassId(1);
    pub const BOOL: ClassId = ClassId(2);
    pub const NUMBER: ClassId = ClassId(3);
    pub const INT: ClassId = ClassId(4);
    pub const FLOAT: ClassId = ClassId(5);
    pub const STRING: ClassId = ClassId(6);
    pub const LIST: ClassId = ClassId(7);

    /// Primitives reject `Nil` arguments.
    #[inline]
    pub fn is_primitive(self) -> bool {
        matches!(self, ClassId::BOOL | ClassId::INT | ClassId::FLOAT)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Class definition handed to [`crate::meta::MetaClassRegistry::define_class`].
#[derive(Clone, Debug)]
pub struct ClassDef {
    name: String,
    superclass: Option<ClassId>,
    interfaces: Vec<ClassId>,
    is_interface: bool,
    methods: Vec<MethodDef>,
    fields: Vec<Arc<str>>,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: None,
            interfaces: Vec::new(),
            is_interface: false,
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Interface or trait: no superclass, may carry default methods.
    pub fn interface(name: &str) -> Self {
        Self {
            is_interface: true,
            ..Self::new(name)
        }
    }

    pub fn extends(mut self, superclass: ClassId) -> Self {
        self.superclass = Some(superclass);
        self
    }

    pub fn implements(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.push(Arc::from(name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A class as published in a [`ClassTable`] snapshot.
#[derive(Debug)]
pub struct ClassEntry {
    pub id: ClassId,
    pub name: Arc<str>,
    pub superclass: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub is_interface: bool,
    pub fields: Vec<Arc<str>>,
    pub declared: Vec<Arc<MethodDef>>,
    chain: Arc<[ClassId]>,
}

impl ClassEntry {
    /// Lookup order: own class, superclasses nearest-first, then interfaces/traits
    /// in declaration order (breadth-first through super-interfaces).
    #[inline]
    pub fn chain(&self) -> &[ClassId] {
        &self.chain
    }

    pub fn declares_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.as_ref() == name)
    }
}

/// Immutable snapshot of the class hierarchy. Mutations produce a new table.
#[derive(Clone, Debug)]
pub struct ClassTable {
    entries: Vec<Arc<ClassEntry>>,
    by_name: FastHashMap<Arc<str>, ClassId>,
}

impl ClassTable {
    pub fn with_builtins() -> Self {
        let mut table = Self {
            entries: Vec::new(),
            by_name: fast_hash_map_new(),
        };
        let builtins = [
            (ClassId::OBJECT, builtin_object()),
            (ClassId::NULL, ClassDef::new("NullObject")),
            (ClassId::BOOL, ClassDef::new("Bool")),
            (ClassId::NUMBER, ClassDef::new("Number")),
            (ClassId::INT, ClassDef::new("Int").extends(ClassId::NUMBER)),
            (ClassId::FLOAT, ClassDef::new("Float").extends(ClassId::NUMBER)),
            (ClassId::STRING, builtin_string()),
            (ClassId::LIST, builtin_list()),
        ];
        for (expected, def) in builtins {
            table.push(def);
            debug_assert_eq!(table.entries.last().map(|e| e.id), Some(expected));
        }
        table
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ClassId) -> Option<&Arc<ClassEntry>> {
        self.entries.get(id.index())
    }

    pub fn entry(&self, id: ClassId) -> Result<&Arc<ClassEntry>, DispatchError> {
        self.get(id).ok_or(DispatchError::UnknownClass(id.0))
    }

    pub fn by_name(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ClassId) -> &str {
        self.get(id).map(|e| e.name.as_ref()).unwrap_or("<unknown>")
    }

    pub fn chain(&self, id: ClassId) -> &[ClassId] {
        self.get(id).map(|e| e.chain()).unwrap_or(&[])
    }

    /// `from` is `to` or inherits from / implements it.
    #[inline]
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        from == to || self.chain(from).contains(&to)
    }

    /// Classes whose lookup chain includes `id` (including `id` itself).
    pub fn descendants(&self, id: ClassId) -> Vec<ClassId> {
        self.entries
            .iter()
            .filter(|e| e.chain.contains(&id))
            .map(|e| e.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassEntry>> {
        self.entries.iter()
    }

    pub(crate) fn define(&self, def: ClassDef) -> Result<(ClassTable, ClassId), DispatchError> {
        if self.by_name.contains_key(def.name.as_str()) {
            return Err(DispatchError::DuplicateClass(def.name));
        }
        let invalid = |reason: String| DispatchError::InvalidClass {
            class: def.name.clone(),
            reason,
        };
        if def.is_interface && def.superclass.is_some() {
            return Err(invalid("interfaces cannot extend a class".to_string()));
        }
        if let Some(superclass) = def.superclass {
            let parent = self.entry(superclass)?;
            if parent.is_interface {
                return Err(invalid(format!("cannot extend interface {}", parent.name)));
            }
        }
        for &iface in &def.interfaces {
            let entry = self.entry(iface)?;
            if !entry.is_interface {
                return Err(invalid(format!("{} is not an interface", entry.name)));
            }
        }
        let mut next = self.clone();
        let id = next.push(def);
        Ok((next, id))
    }

    /// Append `iface` to `class`'s interface list (trait application).
    pub(crate) fn with_interface(&self, class: ClassId, iface: ClassId) -> Result<ClassTable, DispatchError> {
        let target = self.entry(class)?;
        let trait_entry = self.entry(iface)?;
        if !trait_entry.is_interface {
            return Err(DispatchError::InvalidClass {
                class: target.name.to_string(),
                reason: format!("{} is not a trait or interface", trait_entry.name),
            });
        }
        if self.is_assignable(iface, class) {
            return Err(DispatchError::InvalidClass {
                class: target.name.to_string(),
                reason: format!("applying {} would create an inheritance cycle", trait_entry.name),
            });
        }
        if target.interfaces.contains(&iface) {
            return Ok(self.clone());
        }
        let mut next = self.clone();
        let mut interfaces = target.interfaces.clone();
        interfaces.push(iface);
        next.entries[class.index()] = Arc::new(ClassEntry {
            id: target.id,
            name: target.name.clone(),
            superclass: target.superclass,
            interfaces,
            is_interface: target.is_interface,
            fields: target.fields.clone(),
            declared: target.declared.clone(),
            chain: target.chain.clone(),
        });
        next.relinearize();
        Ok(next)
    }

    fn push(&mut self, def: ClassDef) -> ClassId {
        let id = ClassId(self.entries.len() as u32);
        let superclass = match def.superclass {
            Some(parent) => Some(parent),
            None if def.is_interface || id == ClassId::OBJECT => None,
            None => Some(ClassId::OBJECT),
        };
        let name: Arc<str> = Arc::from(def.name.as_str());
        let chain = self.linearize(id, superclass, &def.interfaces);
        self.entries.push(Arc::new(ClassEntry {
            id,
            name: name.clone(),
            superclass,
            interfaces: def.interfaces,
            is_interface: def.is_interface,
            fields: def.fields,
            declared: def.methods.into_iter().map(Arc::new).collect(),
            chain,
        }));
        self.by_name.insert(name, id);
        id
    }

    fn relinearize(&mut self) {
        let chains: Vec<Arc<[ClassId]>> = self
            .entries
            .iter()
            .map(|e| self.linearize(e.id, e.superclass, &e.interfaces))
            .collect();
        for (slot, chain) in self.entries.iter_mut().zip(chains) {
            if slot.chain != chain {
                *slot = Arc::new(ClassEntry {
                    id: slot.id,
                    name: slot.name.clone(),
                    superclass: slot.superclass,
                    interfaces: slot.interfaces.clone(),
                    is_interface: slot.is_interface,
                    fields: slot.fields.clone(),
                    declared: slot.declared.clone(),
                    chain,
                });
            }
        }
    }

    fn linearize(&self, own: ClassId, superclass: Option<ClassId>, interfaces: &[ClassId]) -> Arc<[ClassId]> {
        let mut chain = vec![own];
        let mut cursor = superclass;
        while let Some(id) = cursor {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            cursor = self.get(id).and_then(|e| e.superclass);
        }

        let mut queue: VecDeque<ClassId> = interfaces.iter().copied().collect();
        for &ancestor in &chain[1..] {
            if let Some(entry) = self.get(ancestor) {
                queue.extend(entry.interfaces.iter().copied());
            }
        }
        while let Some(iface) = queue.pop_front() {
            if chain.contains(&iface) {
                continue;
            }
            chain.push(iface);
            if let Some(entry) = self.get(iface) {
                queue.extend(entry.interfaces.iter().copied());
            }
        }

        if own != ClassId::OBJECT && !chain.contains(&ClassId::OBJECT) {
            chain.push(ClassId::OBJECT);
        }
        chain.into()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtin_object() -> ClassDef {
    ClassDef::new("Object")
        .method(MethodDef::new("toString", [], |recv, _| Ok(Val::str(recv.to_string()))))
        .method(MethodDef::new("equals", [ParamType::Any], |recv, args| {
            Ok(Val::Bool(args.first().is_some_and(|other| recv == other)))
        }))
}

fn builtin_string() -> ClassDef {
    ClassDef::new("String")
        .method(MethodDef::new("size", [], |recv, _| {
            let s = recv.as_str().ok_or_else(|| anyhow!("size() receiver is not a String"))?;
            Ok(Val::Int(s.chars().count() as i64))
        }))
        .method(MethodDef::new("toUpperCase", [], |recv, _| {
            let s = recv
                .as_str()
                .ok_or_else(|| anyhow!("toUpperCase() receiver is not a String"))?;
            Ok(Val::str(s.to_uppercase()))
        }))
}

fn builtin_list() -> ClassDef {
    ClassDef::new("List").method(MethodDef::new("size", [], |recv, _| match recv {
        Val::List(items) => Ok(Val::Int(items.len() as i64)),
        other => Err(anyhow!("size() receiver is not a List: {}", other.type_name())),
    }))
}
