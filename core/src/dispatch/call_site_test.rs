#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use crate::config::DispatchConfig;
    use crate::dispatch::{CallSiteKind, Dispatcher, SiteId, SiteState};
    use crate::error::DispatchError;
    use crate::meta::{ClassDef, ClassId, MetaMutation, MethodDef, OverrideTarget};
    use crate::val::{Instance, Val};

    fn dispatcher_with(config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(config).expect("valid config")
    }

    fn dispatcher(optimize: u64) -> Dispatcher {
        dispatcher_with(DispatchConfig {
            optimize_threshold: optimize,
            ..DispatchConfig::default()
        })
    }

    fn constant(name: &str, value: &'static str) -> MethodDef {
        MethodDef::new(name, [], move |_, _| Ok(Val::str(value)))
    }

    fn svc(dispatcher: &Dispatcher) -> ClassId {
        dispatcher
            .registry()
            .define_class(ClassDef::new("Svc").method(constant("getName", "x")))
            .unwrap()
    }

    fn receivers(dispatcher: &Dispatcher, count: usize) -> Vec<Val> {
        (0..count)
            .map(|idx| {
                let name = format!("Receiver{idx}");
                let tag = name.clone();
                let class = dispatcher
                    .registry()
                    .define_class(ClassDef::new(&name).method(MethodDef::new("receive", [], move |_, _| {
                        Ok(Val::str(&tag))
                    })))
                    .unwrap();
                Val::new_object(class)
            })
            .collect()
    }

    #[test]
    fn test_first_call_goes_monomorphic() {
        let dispatcher = dispatcher(10_000);
        let receiver = Val::new_object(svc(&dispatcher));
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();
        assert_eq!(site.state(), SiteState::Cold);

        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("x"));
        assert_eq!(site.state(), SiteState::Monomorphic);
        assert_eq!(site.live_entries(), 1);
        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("x"));
        assert_eq!(site.hits(), 1);
        assert_eq!(site.misses(), 1);
        assert_eq!(site.resolutions(), 1);
    }

    #[test]
    fn test_hot_monomorphic_site_freezes_after_threshold() {
        let dispatcher = dispatcher(10_000);
        let receiver = Val::new_object(svc(&dispatcher));
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();

        for call in 1..=20_000u64 {
            assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("x"));
            if call == 10_000 {
                assert_eq!(site.state(), SiteState::Monomorphic);
            }
            if call == 10_001 {
                assert_eq!(site.state(), SiteState::Frozen);
            }
        }
        assert_eq!(site.resolutions(), 1);
        assert_eq!(site.state(), SiteState::Frozen);
        assert_eq!(site.call_count(), 20_000);
        assert_eq!(site.snapshot().freezes, 1);
    }

    #[test]
    fn test_two_receivers_stay_polymorphic() {
        let dispatcher = dispatcher(10_000);
        let pair = receivers(&dispatcher, 2);
        let site = dispatcher.method_site(SiteId(7), "receive").unwrap();

        for call in 0..1_000 {
            let receiver = &pair[call % 2];
            let expected = format!("Receiver{}", call % 2);
            assert_eq!(site.call(receiver, &[]).unwrap(), Val::str(expected));
        }
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.resolutions(), 2);
        assert_eq!(site.distinct_shapes(), 2);
    }

    #[test]
    fn test_round_robin_within_capacity_never_goes_megamorphic() {
        let dispatcher = dispatcher(1_000_000);
        let shapes = receivers(&dispatcher, 4);
        let site = dispatcher.method_site(SiteId(3), "receive").unwrap();

        for call in 0..4_000 {
            site.call(&shapes[call % shapes.len()], &[]).unwrap();
            assert_ne!(site.state(), SiteState::Megamorphic);
        }
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.resolutions(), 4);
        assert_eq!(site.miss_penalty(), 0);
    }

    #[test]
    fn test_capacity_plus_one_shapes_go_megamorphic_without_errors() {
        let dispatcher = dispatcher(1_000_000);
        let shapes = receivers(&dispatcher, 5);
        let site = dispatcher.method_site(SiteId(3), "receive").unwrap();

        for call in 0..500 {
            let idx = call % shapes.len();
            assert_eq!(
                site.call(&shapes[idx], &[]).unwrap(),
                Val::str(format!("Receiver{idx}"))
            );
        }
        assert_eq!(site.state(), SiteState::Megamorphic);
        assert_eq!(site.live_entries(), 0);
        // uncached from here on
        let before = site.resolutions();
        site.call(&shapes[0], &[]).unwrap();
        assert_eq!(site.resolutions(), before + 1);
    }

    #[test]
    fn test_thrashing_detected_without_early_fallback() {
        let dispatcher = dispatcher_with(DispatchConfig {
            optimize_threshold: 1_000_000,
            fallback_threshold: 0,
            ..DispatchConfig::default()
        });
        let shapes = receivers(&dispatcher, 5);
        let site = dispatcher.method_site(SiteId(3), "receive").unwrap();

        for call in 0..16 {
            site.call(&shapes[call % shapes.len()], &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert!(site.miss_penalty() > 0);
        site.call(&shapes[1], &[]).unwrap();
        assert_eq!(site.state(), SiteState::Megamorphic);
    }

    #[test]
    fn test_early_fallback_skips_polymorphic_caching() {
        let dispatcher = dispatcher_with(DispatchConfig {
            fallback_threshold: 3,
            ..DispatchConfig::default()
        });
        let shapes = receivers(&dispatcher, 5);
        let site = dispatcher.method_site(SiteId(9), "receive").unwrap();

        // below the threshold, then at it but still within the four slots
        for (idx, shape) in shapes[..4].iter().enumerate() {
            site.call(shape, &[]).unwrap();
            let expected = if idx == 0 { SiteState::Monomorphic } else { SiteState::Polymorphic };
            assert_eq!(site.state(), expected);
        }
        assert_eq!(site.hits(), 0);
        assert_eq!(site.live_entries(), 4);
        site.call(&shapes[4], &[]).unwrap();
        assert_eq!(site.state(), SiteState::Megamorphic);
    }

    #[test]
    fn test_full_width_rotation_never_falls_back() {
        let dispatcher = dispatcher_with(DispatchConfig {
            cache_capacity: 8,
            fallback_threshold: 8,
            optimize_threshold: 1_000_000,
            ..DispatchConfig::default()
        });
        let shapes = receivers(&dispatcher, 8);
        let site = dispatcher.method_site(SiteId(10), "receive").unwrap();

        for call in 0..80 {
            let idx = call % shapes.len();
            assert_eq!(site.call(&shapes[idx], &[]).unwrap(), Val::str(format!("Receiver{idx}")));
            assert_ne!(site.state(), SiteState::Megamorphic, "call {call}");
        }
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.resolutions(), 8);
        assert_eq!(site.miss_penalty(), 0);
    }

    #[test]
    fn test_reset_leaves_megamorphic() {
        let dispatcher = dispatcher_with(DispatchConfig {
            fallback_threshold: 2,
            ..DispatchConfig::default()
        });
        let shapes = receivers(&dispatcher, 5);
        let site = dispatcher.method_site(SiteId(9), "receive").unwrap();
        for shape in &shapes {
            site.call(shape, &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Megamorphic);

        site.reset();
        assert_eq!(site.state(), SiteState::Cold);
        assert_eq!(site.distinct_shapes(), 0);
        site.call(&shapes[0], &[]).unwrap();
        assert_eq!(site.state(), SiteState::Monomorphic);
    }

    #[test]
    fn test_stale_entry_is_rebound_in_place() {
        let dispatcher = dispatcher(10_000);
        let class = svc(&dispatcher);
        let receiver = Val::new_object(class);
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();
        for _ in 0..5 {
            site.call(&receiver, &[]).unwrap();
        }

        dispatcher
            .registry()
            .apply_override(OverrideTarget::Class(class), MetaMutation::AddMethod(constant("getName", "y")))
            .unwrap();

        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("y"));
        assert_eq!(site.state(), SiteState::Monomorphic);
        assert_eq!(site.distinct_shapes(), 1);
        assert_eq!(site.resolutions(), 2);
        assert_eq!(site.live_entries(), 1);
    }

    #[test]
    fn test_frozen_site_observes_override_on_next_call() {
        let dispatcher = dispatcher(100);
        let class = svc(&dispatcher);
        let receiver = Val::new_object(class);
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();
        for _ in 0..200 {
            site.call(&receiver, &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Frozen);

        dispatcher
            .registry()
            .apply_override(OverrideTarget::Class(class), MetaMutation::AddMethod(constant("getName", "y")))
            .unwrap();

        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("y"));
        assert_eq!(site.state(), SiteState::Monomorphic);
        assert_eq!(site.resolutions(), 2);
        assert_eq!(site.snapshot().thaws, 1);

        for _ in 0..150 {
            assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("y"));
        }
        assert_eq!(site.state(), SiteState::Frozen);
        assert_eq!(site.resolutions(), 2);
    }

    #[test]
    fn test_superclass_change_heals_subclass_sites() {
        let dispatcher = dispatcher(50);
        let registry = dispatcher.registry();
        let base = registry
            .define_class(ClassDef::new("Base").method(constant("kind", "base")))
            .unwrap();
        let child = registry.define_class(ClassDef::new("Child").extends(base)).unwrap();
        let receiver = Val::new_object(child);
        let site = dispatcher.method_site(SiteId(2), "kind").unwrap();
        for _ in 0..100 {
            assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("base"));
        }
        assert_eq!(site.state(), SiteState::Frozen);

        registry
            .apply_override(OverrideTarget::Class(base), MetaMutation::AddMethod(constant("kind", "patched")))
            .unwrap();
        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("patched"));
    }

    #[test]
    fn test_trait_application_reaches_cached_missing_method_site() {
        let dispatcher = dispatcher(10_000);
        let registry = dispatcher.registry();
        let duck = registry.define_class(ClassDef::new("Duck")).unwrap();
        registry
            .apply_override(
                OverrideTarget::Class(duck),
                MetaMutation::method_missing(|_, name, _| Ok(Val::str(format!("missing {name}")))),
            )
            .unwrap();
        let flying = registry
            .define_class(ClassDef::interface("Flying").method(constant("fly", "flap")))
            .unwrap();
        let receiver = Val::new_object(duck);
        let site = dispatcher.method_site(SiteId(4), "fly").unwrap();
        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("missing fly"));

        registry.apply_trait(duck, flying).unwrap();
        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("flap"));
    }

    #[test]
    fn test_frozen_site_thaws_on_unseen_shape() {
        let dispatcher = dispatcher(100);
        let shapes = receivers(&dispatcher, 2);
        let site = dispatcher.method_site(SiteId(5), "receive").unwrap();
        for _ in 0..150 {
            site.call(&shapes[0], &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Frozen);

        assert_eq!(site.call(&shapes[1], &[]).unwrap(), Val::str("Receiver1"));
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.live_entries(), 2);
        assert_eq!(site.call(&shapes[0], &[]).unwrap(), Val::str("Receiver0"));
        assert_eq!(site.resolutions(), 2);
    }

    #[test]
    fn test_frozen_hits_are_counted_per_entry() {
        let dispatcher = dispatcher(10_000);
        let receiver = Val::new_object(svc(&dispatcher));
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();
        for _ in 0..20_000 {
            site.call(&receiver, &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Frozen);

        let snapshot = site.snapshot();
        assert_eq!(snapshot.hits, 19_999);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].hits, 19_999);
    }

    #[test]
    fn test_thaw_evicts_the_shape_idle_while_frozen() {
        let dispatcher = dispatcher_with(DispatchConfig {
            cache_capacity: 2,
            optimize_threshold: 100,
            ..DispatchConfig::default()
        });
        let shapes = receivers(&dispatcher, 3);
        let site = dispatcher.method_site(SiteId(11), "receive").unwrap();
        for call in 0..200 {
            site.call(&shapes[call % 2], &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Frozen);
        for _ in 0..500 {
            site.call(&shapes[0], &[]).unwrap();
        }

        assert_eq!(site.call(&shapes[2], &[]).unwrap(), Val::str("Receiver2"));
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.call(&shapes[0], &[]).unwrap(), Val::str("Receiver0"));
        assert_eq!(site.resolutions(), 3);
        assert_eq!(site.miss_penalty(), 1);
    }

    #[test]
    fn test_polymorphic_site_freezes_all_shapes() {
        let dispatcher = dispatcher(100);
        let shapes = receivers(&dispatcher, 3);
        let site = dispatcher.method_site(SiteId(6), "receive").unwrap();
        for call in 0..300 {
            site.call(&shapes[call % 3], &[]).unwrap();
        }
        assert_eq!(site.state(), SiteState::Frozen);
        assert_eq!(site.live_entries(), 3);
        for (idx, shape) in shapes.iter().enumerate() {
            assert_eq!(site.call(shape, &[]).unwrap(), Val::str(format!("Receiver{idx}")));
        }
        assert_eq!(site.state(), SiteState::Frozen);
        assert_eq!(site.resolutions(), 3);
    }

    #[test]
    fn test_unresolved_method_surfaces_and_leaves_site_cold() {
        let dispatcher = dispatcher(10_000);
        let receiver = Val::new_object(svc(&dispatcher));
        let site = dispatcher.method_site(SiteId(1), "nothing").unwrap();

        let err = site.call(&receiver, &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::UnresolvedMethod { .. })
        ));
        assert_eq!(site.state(), SiteState::Cold);
        assert_eq!(site.misses(), 1);
        assert_eq!(site.live_entries(), 0);
    }

    #[test]
    fn test_missing_method_handle_is_cached() {
        let dispatcher = dispatcher(10_000);
        let registry = dispatcher.registry();
        let finder = registry.define_class(ClassDef::new("PersonFinder")).unwrap();
        let hook_calls = Arc::new(AtomicU64::new(0));
        let seen = hook_calls.clone();
        registry
            .apply_override(
                OverrideTarget::Class(finder),
                MetaMutation::method_missing(move |_, name, args| {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Ok(Val::str(format!("{name}:{}", args.len())))
                }),
            )
            .unwrap();
        let receiver = Val::new_object(finder);
        let site = dispatcher.method_site(SiteId(11), "findByName").unwrap();

        for _ in 0..100 {
            assert_eq!(
                site.call(&receiver, &[Val::str("Ada")]).unwrap(),
                Val::str("findByName:1")
            );
        }
        assert_eq!(site.resolutions(), 1);
        assert_eq!(hook_calls.load(Ordering::Relaxed), 100);
        assert_eq!(site.state(), SiteState::Monomorphic);
    }

    #[test]
    fn test_argument_classes_are_part_of_the_shape() {
        let dispatcher = dispatcher(10_000);
        let printer = dispatcher
            .registry()
            .define_class(
                ClassDef::new("Printer")
                    .method(MethodDef::new("print", [ClassId::INT.into()], |_, _| Ok(Val::str("int"))))
                    .method(MethodDef::new("print", [ClassId::STRING.into()], |_, _| {
                        Ok(Val::str("string"))
                    })),
            )
            .unwrap();
        let receiver = Val::new_object(printer);
        let site = dispatcher.method_site(SiteId(12), "print").unwrap();

        assert_eq!(site.call(&receiver, &[Val::Int(1)]).unwrap(), Val::str("int"));
        assert_eq!(site.call(&receiver, &[Val::str("a")]).unwrap(), Val::str("string"));
        assert_eq!(site.call(&receiver, &[Val::Int(2)]).unwrap(), Val::str("int"));
        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.resolutions(), 2);
    }

    #[test]
    fn test_expando_receivers_get_their_own_entries() {
        let dispatcher = dispatcher(10_000);
        let class = dispatcher
            .registry()
            .define_class(ClassDef::new("Svc").method(constant("hello", "class")))
            .unwrap();
        let special = Instance::new(class);
        dispatcher
            .registry()
            .apply_override(OverrideTarget::Instance(&special), MetaMutation::AddMethod(constant("hello", "mine")))
            .unwrap();
        let plain = Val::new_object(class);
        let special_val = Val::Object(special.clone());
        let site = dispatcher.method_site(SiteId(13), "hello").unwrap();

        assert_eq!(site.call(&plain, &[]).unwrap(), Val::str("class"));
        assert_eq!(site.call(&special_val, &[]).unwrap(), Val::str("mine"));
        assert_eq!(site.call(&plain, &[]).unwrap(), Val::str("class"));
        assert_eq!(site.state(), SiteState::Polymorphic);

        dispatcher
            .registry()
            .apply_override(OverrideTarget::Instance(&special), MetaMutation::AddMethod(constant("hello", "again")))
            .unwrap();
        assert_eq!(site.call(&special_val, &[]).unwrap(), Val::str("again"));
        assert_eq!(site.call(&plain, &[]).unwrap(), Val::str("class"));
        assert_eq!(site.resolutions(), 3);
    }

    #[test]
    fn test_property_sites_cache_and_freeze() {
        let dispatcher = dispatcher(10);
        let person = dispatcher
            .registry()
            .define_class(ClassDef::new("Person").field("name"))
            .unwrap();
        let ada = Val::Object(Instance::with_fields(person, [("name", Val::str("Ada"))]));
        let getter = dispatcher
            .call_site(SiteId(20), CallSiteKind::GetProperty, "name")
            .unwrap();
        let setter = dispatcher
            .call_site(SiteId(21), CallSiteKind::SetProperty, "name")
            .unwrap();

        for _ in 0..20 {
            assert_eq!(getter.get(&ada).unwrap(), Val::str("Ada"));
        }
        assert_eq!(getter.state(), SiteState::Frozen);
        assert_eq!(setter.set(&ada, Val::str("Grace")).unwrap(), Val::str("Grace"));
        assert_eq!(getter.get(&ada).unwrap(), Val::str("Grace"));
        assert_eq!(getter.resolutions(), 1);
    }

    #[test]
    fn test_hits_reorder_entries_most_recent_first() {
        let dispatcher = dispatcher(10_000);
        let shapes = receivers(&dispatcher, 2);
        let site = dispatcher.method_site(SiteId(14), "receive").unwrap();
        site.call(&shapes[0], &[]).unwrap();
        site.call(&shapes[1], &[]).unwrap();
        assert_eq!(site.snapshot().entries[0].receiver, "Receiver1");

        site.call(&shapes[0], &[]).unwrap();
        let snapshot = site.snapshot();
        assert_eq!(snapshot.entries[0].receiver, "Receiver0");
        assert_eq!(snapshot.entries[0].hits, 1);
    }

    #[test]
    fn test_snapshot_serializes_state_and_entries() {
        let dispatcher = dispatcher(5);
        let receiver = Val::new_object(svc(&dispatcher));
        let site = dispatcher.method_site(SiteId(30), "getName").unwrap();
        for _ in 0..10 {
            site.call(&receiver, &[]).unwrap();
        }
        let json = serde_json::to_value(site.snapshot()).unwrap();
        assert_eq!(json["state"], "FROZEN");
        assert_eq!(json["kind"], "method");
        assert_eq!(json["name"], "getName");
        assert_eq!(json["calls"], 10);
        assert_eq!(json["entries"][0]["receiver"], "Svc");
        assert_eq!(json["entries"][0]["target"], "getName()");
        assert_eq!(json["entries"][0]["stale"], false);
    }
}
