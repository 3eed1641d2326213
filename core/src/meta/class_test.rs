#[cfg(test)]
mod tests {
    use crate::error::DispatchError;
    use crate::meta::{ClassDef, ClassId, ClassTable, MethodDef, ParamType};
    use crate::val::Val;

    fn noop(name: &str) -> MethodDef {
        MethodDef::new(name, [], |_, _| Ok(Val::Nil))
    }

    #[test]
    fn test_builtin_ids_are_stable() {
        let table = ClassTable::with_builtins();
        assert_eq!(table.by_name("Object"), Some(ClassId::OBJECT));
        assert_eq!(table.by_name("Int"), Some(ClassId::INT));
        assert_eq!(table.by_name("List"), Some(ClassId::LIST));
        assert!(table.is_assignable(ClassId::INT, ClassId::NUMBER));
        assert!(table.is_assignable(ClassId::FLOAT, ClassId::OBJECT));
        assert!(!table.is_assignable(ClassId::NUMBER, ClassId::INT));
    }

    #[test]
    fn test_chain_orders_superclasses_before_interfaces() {
        let table = ClassTable::with_builtins();
        let (table, named) = table.define(ClassDef::interface("Named")).unwrap();
        let (table, base) = table.define(ClassDef::new("Base").implements(named)).unwrap();
        let (table, greeter) = table.define(ClassDef::interface("Greeter")).unwrap();
        let (table, child) = table
            .define(ClassDef::new("Child").extends(base).implements(greeter))
            .unwrap();

        assert_eq!(table.chain(child), &[child, base, ClassId::OBJECT, greeter, named][..]);
        assert_eq!(table.chain(named), &[named, ClassId::OBJECT][..]);
    }

    #[test]
    fn test_define_rejects_bad_hierarchies() {
        let table = ClassTable::with_builtins();
        let (table, iface) = table.define(ClassDef::interface("Shape")).unwrap();

        let err = table.define(ClassDef::new("Object")).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateClass("Object".to_string()));

        let err = table.define(ClassDef::new("Bad").extends(iface)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidClass { .. }));

        let err = table.define(ClassDef::new("Worse").implements(ClassId::STRING)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidClass { .. }));

        let err = table.define(ClassDef::new("Lost").extends(ClassId(999))).unwrap_err();
        assert_eq!(err, DispatchError::UnknownClass(999));
    }

    #[test]
    fn test_with_interface_relinearizes_descendants() {
        let table = ClassTable::with_builtins();
        let (table, base) = table.define(ClassDef::new("Base").method(noop("run"))).unwrap();
        let (table, child) = table.define(ClassDef::new("Child").extends(base)).unwrap();
        let (table, mixin) = table.define(ClassDef::interface("Mixin").method(noop("mixed"))).unwrap();

        assert!(!table.is_assignable(child, mixin));
        let next = table.with_interface(base, mixin).unwrap();
        assert!(next.is_assignable(base, mixin));
        assert!(next.is_assignable(child, mixin));
        assert_eq!(next.descendants(mixin), vec![base, child, mixin]);
        // the previous snapshot is untouched
        assert!(!table.is_assignable(child, mixin));
    }

    #[test]
    fn test_param_coercions() {
        let table = ClassTable::with_builtins();
        let float = ParamType::Class(ClassId::FLOAT);
        assert!(float.accepts(ClassId::INT, &table));
        assert!(!float.accepts(ClassId::STRING, &table));
        assert!(!float.accepts(ClassId::NULL, &table));
        assert!(ParamType::Class(ClassId::STRING).accepts(ClassId::NULL, &table));
        assert!(ParamType::Any.accepts(ClassId::LIST, &table));
        assert!(!ParamType::Any.is_exact(ClassId::OBJECT));
        assert!(ParamType::Class(ClassId::INT).narrower_or_equal(ParamType::Class(ClassId::NUMBER), &table));
        assert!(!ParamType::Any.narrower_or_equal(ParamType::Class(ClassId::NUMBER), &table));
    }

    #[test]
    fn test_varargs_packs_trailing_arguments() {
        let sum = MethodDef::variadic("sum", [ParamType::Class(ClassId::INT)], |_, args| {
            let total = match &args[0] {
                Val::List(items) => items.iter().filter_map(Val::as_int).sum::<i64>(),
                _ => -1,
            };
            Ok(Val::Int(total))
        });
        let table = ClassTable::with_builtins();
        assert!(sum.accepts_varargs(&[], &table));
        assert!(sum.accepts_varargs(&[ClassId::INT, ClassId::INT], &table));
        assert!(!sum.accepts_varargs(&[ClassId::STRING], &table));
        let out = sum.invoke(&Val::Nil, &[Val::Int(2), Val::Int(3), Val::Int(4)]).unwrap();
        assert_eq!(out, Val::Int(9));
        assert_eq!(sum.describe(&table), "sum(Int...)");
    }
}
