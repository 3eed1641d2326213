use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use anyhow::{Context, Result, anyhow, ensure};
use serde::Serialize;

use crate::{
    config::DispatchConfig,
    dispatch::{AdaptiveCallSite, CallSiteKind, CallSiteSnapshot, DispatchMetrics, Dispatcher, SiteId, SiteState},
    meta::{ClassDef, ClassId, MetaMutation, MethodDef, OverrideTarget},
    val::{Instance, Val},
};

/// Result of one scenario run: what the sites ended up as.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: &'static str,
    pub calls: u64,
    pub checksum: i64,
    pub sites: Vec<CallSiteSnapshot>,
    pub metrics: DispatchMetrics,
}

#[derive(Clone, Copy)]
pub struct Scenario {
    def: &'static ScenarioDef,
}

impl Scenario {
    pub fn key(&self) -> &'static str {
        self.def.key
    }

    pub fn title(&self) -> &'static str {
        self.def.title
    }

    pub fn default_calls(&self) -> u64 {
        self.def.default_calls
    }

    pub fn bench_case_name(&self) -> String {
        format!("{}_dispatch", self.def.key)
    }

    /// Fresh dispatcher and fixture; nothing has been called yet.
    pub fn prepare(&self, config: &DispatchConfig) -> Result<PreparedScenario> {
        let dispatcher = Dispatcher::new(config.clone()).context("invalid dispatch config for scenario")?;
        let fixture = Fixture::build(self.def.workload, &dispatcher)
            .with_context(|| format!("failed to set up scenario '{}'", self.def.key))?;
        Ok(PreparedScenario {
            def: self.def,
            dispatcher,
            fixture,
            calls: 0,
            checksum: 0,
        })
    }

    /// Prepare, drive `calls` calls, verify and collect the outcome.
    pub fn run(&self, config: &DispatchConfig, calls: u64) -> Result<ScenarioOutcome> {
        let mut prepared = self.prepare(config)?;
        prepared.drive(calls)?;
        prepared.finish()
    }
}

pub struct PreparedScenario {
    def: &'static ScenarioDef,
    dispatcher: Dispatcher,
    fixture: Fixture,
    calls: u64,
    checksum: i64,
}

impl PreparedScenario {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Issue `calls` more calls, checking every returned value.
    pub fn drive(&mut self, calls: u64) -> Result<i64> {
        let start = self.calls;
        let mut sum = 0i64;
        for step in start..start + calls {
            sum = sum.wrapping_add(self.fixture.step(&self.dispatcher, step).with_context(|| {
                format!("scenario '{}' failed at call {}", self.def.key, step + 1)
            })?);
        }
        self.calls += calls;
        self.checksum = self.checksum.wrapping_add(sum);
        Ok(sum)
    }

    /// Check the end state of the sites and return the outcome.
    pub fn finish(self) -> Result<ScenarioOutcome> {
        self.fixture
            .verify(&self.dispatcher, self.calls)
            .with_context(|| format!("scenario '{}' ended in an unexpected state", self.def.key))?;
        Ok(ScenarioOutcome {
            scenario: self.def.key,
            calls: self.calls,
            checksum: self.checksum,
            sites: self.dispatcher.snapshots(),
            metrics: self.dispatcher.metrics(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum Workload {
    MonomorphicHot,
    ColdCall,
    RoundRobin,
    MegamorphicRandom,
    DynamicFinder,
    InvalidationStorm,
    PropertyAccess,
}

struct ScenarioDef {
    key: &'static str,
    title: &'static str,
    default_calls: u64,
    workload: Workload,
}

static SCENARIOS: &[ScenarioDef] = &[
    ScenarioDef {
        key: "monomorphic_hot",
        title: "One receiver class hammering one site until it freezes",
        default_calls: 20_000,
        workload: Workload::MonomorphicHot,
    },
    ScenarioDef {
        key: "cold_call",
        title: "Short-lived objects and sites called twice then dropped",
        default_calls: 5_000,
        workload: Workload::ColdCall,
    },
    ScenarioDef {
        key: "round_robin",
        title: "As many receiver classes as cache slots, in rotation",
        default_calls: 20_000,
        workload: Workload::RoundRobin,
    },
    ScenarioDef {
        key: "megamorphic_random",
        title: "Many receiver classes in pseudo-random order",
        default_calls: 20_000,
        workload: Workload::MegamorphicRandom,
    },
    ScenarioDef {
        key: "dynamic_finder",
        title: "findByX calls served by a methodMissing hook",
        default_calls: 20_000,
        workload: Workload::DynamicFinder,
    },
    ScenarioDef {
        key: "invalidation_storm",
        title: "Hot site whose method is replaced every 500 calls",
        default_calls: 20_000,
        workload: Workload::InvalidationStorm,
    },
    ScenarioDef {
        key: "property_access",
        title: "Field writes and getter reads through property sites",
        default_calls: 20_000,
        workload: Workload::PropertyAccess,
    },
];

const STORM_PERIOD: u64 = 500;
const MEGAMORPHIC_FACTOR: usize = 4;

pub fn all_scenarios() -> Vec<Scenario> {
    SCENARIOS.iter().map(|def| Scenario { def }).collect()
}

pub fn find_scenario(key: &str) -> Option<Scenario> {
    SCENARIOS.iter().find(|def| def.key == key).map(|def| Scenario { def })
}

enum Fixture {
    MonomorphicHot {
        site: Arc<AdaptiveCallSite>,
        receiver: Val,
    },
    ColdCall {
        class: ClassId,
    },
    Rotation {
        site: Arc<AdaptiveCallSite>,
        receivers: Vec<Val>,
        shuffled: bool,
    },
    DynamicFinder {
        site: Arc<AdaptiveCallSite>,
        receiver: Val,
    },
    InvalidationStorm {
        site: Arc<AdaptiveCallSite>,
        class: ClassId,
        receiver: Val,
        generation: AtomicI64,
    },
    PropertyAccess {
        read: Arc<AdaptiveCallSite>,
        write: Arc<AdaptiveCallSite>,
        receiver: Val,
    },
}

impl Fixture {
    fn build(workload: Workload, dispatcher: &Dispatcher) -> Result<Self> {
        let registry = dispatcher.registry();
        let fixture = match workload {
            Workload::MonomorphicHot => {
                let svc = registry.define_class(
                    ClassDef::new("Svc").method(MethodDef::new("getName", [], |_, _| Ok(Val::str("x")))),
                )?;
                Fixture::MonomorphicHot {
                    site: dispatcher.method_site(SiteId(1), "getName")?,
                    receiver: Val::new_object(svc),
                }
            }
            Workload::ColdCall => {
                let class = registry.define_class(
                    ClassDef::new("Request")
                        .field("id")
                        .method(MethodDef::new("handle", [ClassId::INT.into()], |_, args| {
                            Ok(Val::Int(args[0].as_int().unwrap_or_default() * 2))
                        })),
                )?;
                Fixture::ColdCall { class }
            }
            Workload::RoundRobin | Workload::MegamorphicRandom => {
                let capacity = dispatcher.config().cache_capacity;
                let (count, shuffled) = match workload {
                    Workload::RoundRobin => (capacity, false),
                    _ => (capacity * MEGAMORPHIC_FACTOR + 1, true),
                };
                let receivers = (0..count)
                    .map(|idx| -> Result<Val> {
                        let tag = idx as i64;
                        let class = registry.define_class(
                            ClassDef::new(&format!("Receiver{idx}"))
                                .method(MethodDef::new("receive", [], move |_, _| Ok(Val::Int(tag)))),
                        )?;
                        Ok(Val::new_object(class))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Fixture::Rotation {
                    site: dispatcher.method_site(SiteId(1), "receive")?,
                    receivers,
                    shuffled,
                }
            }
            Workload::DynamicFinder => {
                let finder = registry.define_class(ClassDef::new("PersonFinder"))?;
                registry.apply_override(
                    OverrideTarget::Class(finder),
                    MetaMutation::method_missing(|_, name, args| {
                        let Some(column) = name.strip_prefix("findBy") else {
                            return Err(anyhow!("no finder for {name}"));
                        };
                        let key = args.first().and_then(Val::as_int).unwrap_or_default();
                        Ok(Val::Int(key + column.len() as i64))
                    }),
                )?;
                Fixture::DynamicFinder {
                    site: dispatcher.method_site(SiteId(1), "findByName")?,
                    receiver: Val::new_object(finder),
                }
            }
            Workload::InvalidationStorm => {
                let class = registry.define_class(
                    ClassDef::new("Config").method(MethodDef::new("generation", [], |_, _| Ok(Val::Int(0)))),
                )?;
                Fixture::InvalidationStorm {
                    site: dispatcher.method_site(SiteId(1), "generation")?,
                    class,
                    receiver: Val::new_object(class),
                    generation: AtomicI64::new(0),
                }
            }
            Workload::PropertyAccess => {
                let class = registry.define_class(
                    ClassDef::new("Counter")
                        .field("count")
                        .method(MethodDef::new("getDoubled", [], |receiver, _| {
                            let count = receiver
                                .as_object()
                                .and_then(|instance| instance.field("count"))
                                .and_then(|value| value.as_int())
                                .unwrap_or_default();
                            Ok(Val::Int(count * 2))
                        })),
                )?;
                Fixture::PropertyAccess {
                    read: dispatcher.call_site(SiteId(1), CallSiteKind::GetProperty, "doubled")?,
                    write: dispatcher.call_site(SiteId(2), CallSiteKind::SetProperty, "count")?,
                    receiver: Val::Object(Instance::with_fields(class, [("count", Val::Int(0))])),
                }
            }
        };
        Ok(fixture)
    }

    fn step(&self, dispatcher: &Dispatcher, step: u64) -> Result<i64> {
        match self {
            Fixture::MonomorphicHot { site, receiver } => {
                let value = site.call(receiver, &[])?;
                expect(&value, &Val::str("x"))?;
                Ok(1)
            }
            Fixture::ColdCall { class } => {
                let site = AdaptiveCallSite::new(
                    SiteId(step),
                    CallSiteKind::Method,
                    "handle",
                    dispatcher.config().cache_capacity,
                    dispatcher.resolver().clone(),
                    dispatcher.policy().clone(),
                );
                let receiver = Val::new_object(*class);
                let arg = [Val::Int(step as i64)];
                let first = site.call(&receiver, &arg)?;
                let second = site.call(&receiver, &arg)?;
                expect(&first, &Val::Int(step as i64 * 2))?;
                expect(&second, &first)?;
                Ok(first.as_int().unwrap_or_default())
            }
            Fixture::Rotation {
                site,
                receivers,
                shuffled,
            } => {
                let idx = if *shuffled {
                    (mix(step) % receivers.len() as u64) as usize
                } else {
                    step as usize % receivers.len()
                };
                let value = site.call(&receivers[idx], &[])?;
                expect(&value, &Val::Int(idx as i64))?;
                Ok(idx as i64)
            }
            Fixture::DynamicFinder { site, receiver } => {
                let key = (step % 1_000) as i64;
                let value = site.call(receiver, &[Val::Int(key)])?;
                expect(&value, &Val::Int(key + "Name".len() as i64))?;
                Ok(key)
            }
            Fixture::InvalidationStorm {
                site,
                class,
                receiver,
                generation,
            } => {
                if step > 0 && step % STORM_PERIOD == 0 {
                    let next = generation.fetch_add(1, Ordering::Relaxed) + 1;
                    dispatcher.registry().apply_override(
                        OverrideTarget::Class(*class),
                        MetaMutation::AddMethod(MethodDef::new("generation", [], move |_, _| Ok(Val::Int(next)))),
                    )?;
                }
                let expected = generation.load(Ordering::Relaxed);
                let value = site.call(receiver, &[])?;
                expect(&value, &Val::Int(expected))?;
                Ok(expected)
            }
            Fixture::PropertyAccess { read, write, receiver } => {
                let count = (step % 100) as i64;
                let written = write.set(receiver, Val::Int(count))?;
                expect(&written, &Val::Int(count))?;
                let value = read.get(receiver)?;
                expect(&value, &Val::Int(count * 2))?;
                Ok(count)
            }
        }
    }

    fn verify(&self, dispatcher: &Dispatcher, calls: u64) -> Result<()> {
        let optimize = dispatcher.policy().optimize_threshold();
        match self {
            Fixture::MonomorphicHot { site, .. } | Fixture::DynamicFinder { site, .. } => {
                ensure!(
                    site.resolutions() <= 1,
                    "expected a single resolution, got {}",
                    site.resolutions()
                );
                if calls > optimize {
                    ensure_state(site, SiteState::Frozen)?;
                }
            }
            Fixture::ColdCall { .. } => {
                ensure!(dispatcher.site_count() == 0, "cold sites must not be registered");
            }
            Fixture::Rotation {
                site,
                receivers,
                shuffled: false,
            } => {
                ensure!(
                    site.state() != SiteState::Megamorphic,
                    "rotation within capacity went megamorphic"
                );
                let expected = (receivers.len() as u64).min(calls);
                ensure!(
                    site.resolutions() == expected,
                    "expected {expected} resolutions, got {}",
                    site.resolutions()
                );
            }
            Fixture::Rotation {
                site, shuffled: true, ..
            } => {
                let limit = site.capacity() as u64 * dispatcher.policy().megamorphic_multiplier();
                if calls >= limit * 8 {
                    ensure_state(site, SiteState::Megamorphic)?;
                }
            }
            Fixture::InvalidationStorm { site, generation, .. } => {
                let bound = generation.load(Ordering::Relaxed) as u64 + 1;
                ensure!(
                    site.resolutions() <= bound.min(calls),
                    "expected at most {bound} resolutions, got {}",
                    site.resolutions()
                );
            }
            Fixture::PropertyAccess { read, write, .. } => {
                ensure!(
                    read.resolutions() <= 1 && write.resolutions() <= 1,
                    "property sites re-resolved: read {} write {}",
                    read.resolutions(),
                    write.resolutions()
                );
            }
        }
        Ok(())
    }
}

fn expect(actual: &Val, expected: &Val) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(anyhow!("expected {:?} but observed {:?}", expected, actual))
    }
}

fn ensure_state(site: &AdaptiveCallSite, expected: SiteState) -> Result<()> {
    ensure!(
        site.state() == expected,
        "site {} ended {} instead of {}",
        site.id(),
        site.state(),
        expected
    );
    Ok(())
}

// splitmix64: a fixed, seedless sequence keeps runs comparable
fn mix(step: u64) -> u64 {
    let mut z = step.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
