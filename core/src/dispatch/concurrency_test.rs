#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use std::thread;

    use crate::config::DispatchConfig;
    use crate::dispatch::{Dispatcher, SiteId, SiteState};
    use crate::meta::{ClassDef, MetaMutation, MethodDef, OverrideTarget};
    use crate::val::Val;

    const THREADS: usize = 8;

    fn dispatcher(optimize: u64) -> Dispatcher {
        Dispatcher::new(DispatchConfig {
            optimize_threshold: optimize,
            ..DispatchConfig::default()
        })
        .expect("valid config")
    }

    #[test]
    fn test_shared_monomorphic_site_resolves_once_per_racing_miss() {
        let dispatcher = dispatcher(1_000);
        let svc = dispatcher
            .registry()
            .define_class(ClassDef::new("Svc").method(MethodDef::new("getName", [], |_, _| Ok(Val::str("x")))))
            .unwrap();
        let site = dispatcher.method_site(SiteId(1), "getName").unwrap();

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let site = site.clone();
                scope.spawn(move || {
                    let receiver = Val::new_object(svc);
                    for _ in 0..5_000 {
                        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str("x"));
                    }
                });
            }
        });

        // misses serialise on the slow path, so only the first one resolves
        assert_eq!(site.resolutions(), 1);
        assert_eq!(site.call_count(), (THREADS * 5_000) as u64);
        assert_eq!(site.state(), SiteState::Frozen);
    }

    #[test]
    fn test_polymorphic_site_under_contention_returns_correct_targets() {
        let dispatcher = dispatcher(1_000_000);
        let registry = dispatcher.registry();
        let classes: Vec<_> = (0..3)
            .map(|idx| {
                let tag = format!("Shape{idx}");
                let body = tag.clone();
                registry
                    .define_class(ClassDef::new(&tag).method(MethodDef::new("area", [], move |_, _| {
                        Ok(Val::str(&body))
                    })))
                    .unwrap()
            })
            .collect();
        let site = dispatcher.method_site(SiteId(2), "area").unwrap();

        thread::scope(|scope| {
            for worker in 0..THREADS {
                let site = site.clone();
                let classes = classes.clone();
                scope.spawn(move || {
                    for call in 0..3_000 {
                        let idx = (worker + call) % classes.len();
                        let receiver = Val::new_object(classes[idx]);
                        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::str(format!("Shape{idx}")));
                    }
                });
            }
        });

        assert_eq!(site.state(), SiteState::Polymorphic);
        assert_eq!(site.resolutions(), 3);
        assert_eq!(site.live_entries(), 3);
    }

    #[test]
    fn test_override_during_calls_is_observed_after_it_returns() {
        let dispatcher = dispatcher(200);
        let registry = dispatcher.registry().clone();
        let svc = registry
            .define_class(ClassDef::new("Svc").method(MethodDef::new("version", [], |_, _| Ok(Val::Int(1)))))
            .unwrap();
        let site = dispatcher.method_site(SiteId(3), "version").unwrap();
        let patched = AtomicBool::new(false);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let site = site.clone();
                let patched = &patched;
                scope.spawn(move || {
                    let receiver = Val::new_object(svc);
                    for _ in 0..4_000 {
                        // read the flag first: once set, the override is published
                        let after = patched.load(Ordering::Acquire);
                        let value = site.call(&receiver, &[]).unwrap();
                        if after {
                            assert_eq!(value, Val::Int(2));
                        } else {
                            assert!(value == Val::Int(1) || value == Val::Int(2));
                        }
                    }
                });
            }
            scope.spawn(|| {
                thread::yield_now();
                registry
                    .apply_override(
                        OverrideTarget::Class(svc),
                        MetaMutation::AddMethod(MethodDef::new("version", [], |_, _| Ok(Val::Int(2)))),
                    )
                    .unwrap();
                patched.store(true, Ordering::Release);
            });
        });

        assert_eq!(site.call(&Val::new_object(svc), &[]).unwrap(), Val::Int(2));
        assert!(site.resolutions() <= 1 + THREADS as u64 + 1);
    }

    #[test]
    fn test_megamorphic_site_stays_correct_across_threads() {
        let dispatcher = Dispatcher::new(DispatchConfig {
            cache_capacity: 2,
            fallback_threshold: 3,
            ..DispatchConfig::default()
        })
        .unwrap();
        let registry = dispatcher.registry();
        let classes: Vec<_> = (0..6)
            .map(|idx| {
                registry
                    .define_class(ClassDef::new(&format!("Kind{idx}")).method(MethodDef::new(
                        "id",
                        [],
                        move |_, _| Ok(Val::Int(idx)),
                    )))
                    .unwrap()
            })
            .collect();
        let site = dispatcher.method_site(SiteId(4), "id").unwrap();

        thread::scope(|scope| {
            for worker in 0..THREADS {
                let site = site.clone();
                let classes = classes.clone();
                scope.spawn(move || {
                    for call in 0..600 {
                        let idx = (worker * 7 + call) % classes.len();
                        let receiver = Val::new_object(classes[idx]);
                        assert_eq!(site.call(&receiver, &[]).unwrap(), Val::Int(idx as i64));
                    }
                });
            }
        });

        assert_eq!(site.state(), SiteState::Megamorphic);
        assert!(dispatcher.resolver().memo_hits() > 0);
    }

    #[test]
    fn test_registry_is_shareable_across_threads() {
        let dispatcher = Arc::new(dispatcher(10_000));
        thread::scope(|scope| {
            for worker in 0..THREADS {
                let dispatcher = dispatcher.clone();
                scope.spawn(move || {
                    let class = dispatcher
                        .registry()
                        .define_class(ClassDef::new(&format!("Worker{worker}")))
                        .unwrap();
                    assert_eq!(dispatcher.registry().class_id(&format!("Worker{worker}")), Some(class));
                    dispatcher.registry().get_meta_class(class).unwrap();
                });
            }
        });
        let classes = dispatcher.registry().classes();
        let workers = classes.iter().filter(|entry| entry.name.starts_with("Worker")).count();
        assert_eq!(workers, THREADS);
    }
}
