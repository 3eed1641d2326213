use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use anyhow::Result;
use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::{debug, trace};

use crate::dispatch::{
    CallSiteKind, CallSiteSnapshot, EntrySnapshot, InlineCacheEntry, MethodResolver, OptimizationPolicy,
    PolicyDecision, PolicyInput, ReceiverKey, Resolution, ResolvedHandle, ShapeKey, SiteId,
};
use crate::error::DispatchError;
use crate::val::Val;

/// Call-site classification.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteState {
    #[default]
    Cold = 0,
    Monomorphic = 1,
    Polymorphic = 2,
    Megamorphic = 3,
    Frozen = 4,
}

impl SiteState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SiteState::Monomorphic,
            2 => SiteState::Polymorphic,
            3 => SiteState::Megamorphic,
            4 => SiteState::Frozen,
            _ => SiteState::Cold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SiteState::Cold => "COLD",
            SiteState::Monomorphic => "MONOMORPHIC",
            SiteState::Polymorphic => "POLYMORPHIC",
            SiteState::Megamorphic => "MEGAMORPHIC",
            SiteState::Frozen => "FROZEN",
        }
    }
}

impl fmt::Display for SiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Heuristic counters: relaxed, may under-count under races.
#[derive(Debug, Default)]
struct SiteCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    resolutions: AtomicU64,
    distinct_shapes: AtomicU64,
    miss_penalty: AtomicU64,
    last_new_shape_at: AtomicU64,
    freezes: AtomicU64,
    thaws: AtomicU64,
}

impl SiteCounters {
    #[inline]
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Entries a FROZEN site dispatches through, fixed at freeze time.
struct FrozenTarget {
    entries: Box<[Arc<InlineCacheEntry>]>,
}

impl FrozenTarget {
    #[inline]
    fn lookup(&self, shape: &ShapeKey) -> Option<&Arc<InlineCacheEntry>> {
        self.entries.iter().find(|entry| entry.shape() == shape)
    }
}

/// The cache attached to one call location.
///
/// Up to `capacity` entries live in fixed slots, each published through an
/// atomic pointer swap, so readers always see a whole entry. Hits (and FROZEN
/// dispatch) take no lock. Misses serialise on a per-site mutex, which is never
/// held while user code runs.
pub struct AdaptiveCallSite {
    id: SiteId,
    kind: CallSiteKind,
    name: Arc<str>,
    resolver: Arc<MethodResolver>,
    policy: Arc<OptimizationPolicy>,
    state: AtomicU8,
    // MRU first
    slots: Box<[ArcSwapOption<InlineCacheEntry>]>,
    frozen: ArcSwapOption<FrozenTarget>,
    calls: CachePadded<AtomicU64>,
    counters: SiteCounters,
    slow_path: Mutex<()>,
}

impl AdaptiveCallSite {
    pub fn new(
        id: SiteId,
        kind: CallSiteKind,
        name: &str,
        capacity: usize,
        resolver: Arc<MethodResolver>,
        policy: Arc<OptimizationPolicy>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            kind,
            name: Arc::from(name),
            resolver,
            policy,
            state: AtomicU8::new(SiteState::Cold as u8),
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            frozen: ArcSwapOption::empty(),
            calls: CachePadded::new(AtomicU64::new(0)),
            counters: SiteCounters::default(),
            slow_path: Mutex::new(()),
        }
    }

    /// Dispatch `receiver.name(args)` (or the property access this site stands for).
    pub fn call(&self, receiver: &Val, args: &[Val]) -> Result<Val> {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let shape = ShapeKey::of(receiver, args);
        match self.state() {
            SiteState::Frozen => {
                if let Some(handle) = self.probe_frozen(&shape, calls) {
                    SiteCounters::bump(&self.counters.hits);
                    return handle.invoke(receiver, args);
                }
            }
            SiteState::Monomorphic | SiteState::Polymorphic => {
                if let Some(handle) = self.probe_slots(&shape, calls, true) {
                    SiteCounters::bump(&self.counters.hits);
                    if self.policy.promotion_possible(calls) {
                        self.consider_promotion(calls);
                    }
                    return handle.invoke(receiver, args);
                }
            }
            SiteState::Megamorphic => {
                let handle = self.resolve_uncached(receiver, &shape)?;
                return handle.invoke(receiver, args);
            }
            SiteState::Cold => {}
        }

        let handle = {
            let _lock = self.lock();
            self.miss_locked(receiver, &shape, calls)?
        };
        handle.invoke(receiver, args)
    }

    /// Property read through a `GetProperty` site.
    pub fn get(&self, receiver: &Val) -> Result<Val> {
        self.call(receiver, &[])
    }

    /// Property write through a `SetProperty` site; evaluates to the written value
    /// unless a setter method returns something else.
    pub fn set(&self, receiver: &Val, value: Val) -> Result<Val> {
        self.call(receiver, std::slice::from_ref(&value))
    }

    /// Drop every cached entry and start over in COLD. The only way out of
    /// MEGAMORPHIC.
    pub fn reset(&self) {
        let _lock = self.lock();
        let from = self.state();
        self.clear_slots();
        self.frozen.store(None);
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.distinct_shapes.store(0, Ordering::Relaxed);
        self.counters.miss_penalty.store(0, Ordering::Relaxed);
        self.counters
            .last_new_shape_at
            .store(self.calls.load(Ordering::Relaxed), Ordering::Relaxed);
        self.state.store(SiteState::Cold as u8, Ordering::Release);
        debug!(target: "dynsite::site", site = %self.id, member = %self.name, from = %from, "call site reset");
    }

    #[inline]
    pub fn state(&self) -> SiteState {
        SiteState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn id(&self) -> SiteId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> CallSiteKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        SiteCounters::get(&self.counters.hits)
    }

    pub fn misses(&self) -> u64 {
        SiteCounters::get(&self.counters.misses)
    }

    /// Resolver invocations issued by this site.
    pub fn resolutions(&self) -> u64 {
        SiteCounters::get(&self.counters.resolutions)
    }

    pub fn distinct_shapes(&self) -> u64 {
        SiteCounters::get(&self.counters.distinct_shapes)
    }

    pub fn miss_penalty(&self) -> u64 {
        SiteCounters::get(&self.counters.miss_penalty)
    }

    pub fn live_entries(&self) -> usize {
        match self.state() {
            SiteState::Frozen => self.frozen.load().as_deref().map_or(0, |target| target.entries.len()),
            _ => self.slots.iter().filter(|slot| slot.load().is_some()).count(),
        }
    }

    pub(crate) fn policy_input(&self) -> PolicyInput {
        self.policy_input_at(self.call_count())
    }

    /// Read-only view for monitoring; relaxed loads only.
    pub fn snapshot(&self) -> CallSiteSnapshot {
        let classes = self.resolver.registry().classes();
        let state = self.state();
        let entries: Vec<Arc<InlineCacheEntry>> = match state {
            SiteState::Frozen => self
                .frozen
                .load_full()
                .map(|target| target.entries.to_vec())
                .unwrap_or_default(),
            _ => self.slots.iter().filter_map(|slot| slot.load_full()).collect(),
        };
        CallSiteSnapshot {
            site: self.id.0,
            kind: self.kind,
            name: self.name.to_string(),
            state,
            capacity: self.capacity(),
            calls: self.call_count(),
            hits: self.hits(),
            misses: self.misses(),
            resolutions: self.resolutions(),
            distinct_shapes: self.distinct_shapes(),
            miss_penalty: self.miss_penalty(),
            freezes: SiteCounters::get(&self.counters.freezes),
            thaws: SiteCounters::get(&self.counters.thaws),
            entries: entries
                .iter()
                .map(|entry| {
                    let (receiver_class, instance) = match entry.shape().receiver {
                        ReceiverKey::Class(class) => (class, None),
                        ReceiverKey::Expando { class, instance } => (class, Some(instance)),
                    };
                    EntrySnapshot {
                        receiver: classes.name_of(receiver_class).to_string(),
                        instance,
                        args: entry
                            .shape()
                            .args
                            .as_slice()
                            .iter()
                            .map(|id| classes.name_of(*id).to_string())
                            .collect(),
                        target: entry.handle().describe(&classes),
                        version: entry.guard().class_version(),
                        stale: !entry.guard().is_current(),
                        hits: entry.hits(),
                    }
                })
                .collect(),
        }
    }

    #[inline]
    fn probe_frozen(&self, shape: &ShapeKey, calls: u64) -> Option<ResolvedHandle> {
        let frozen = self.frozen.load();
        let entry = frozen.as_deref()?.lookup(shape)?;
        if !entry.guard().is_current() {
            return None;
        }
        entry.record_hit(calls);
        Some(entry.handle().clone())
    }

    #[inline]
    fn probe_slots(&self, shape: &ShapeKey, calls: u64, reorder: bool) -> Option<ResolvedHandle> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let guard = slot.load();
            let Some(entry) = guard.as_deref() else {
                continue;
            };
            if entry.is_valid_for(shape) {
                entry.record_hit(calls);
                let handle = entry.handle().clone();
                drop(guard);
                if reorder && idx > 0 {
                    self.promote_to_front(idx);
                }
                return Some(handle);
            }
        }
        None
    }

    // Best effort: skipped when another thread holds the slow path.
    fn promote_to_front(&self, idx: usize) {
        let Ok(_lock) = self.slow_path.try_lock() else {
            return;
        };
        let Some(hit) = self.slots[idx].load_full() else {
            return;
        };
        for pos in (1..=idx).rev() {
            self.slots[pos].store(self.slots[pos - 1].load_full());
        }
        self.slots[0].store(Some(hit));
    }

    fn consider_promotion(&self, calls: u64) {
        if self.policy.decide(&self.policy_input_at(calls)) != PolicyDecision::PromoteToFrozen {
            return;
        }
        let _lock = self.lock();
        if matches!(self.state(), SiteState::Monomorphic | SiteState::Polymorphic) {
            self.freeze(calls);
        }
    }

    fn miss_locked(&self, receiver: &Val, shape: &ShapeKey, calls: u64) -> Result<ResolvedHandle, DispatchError> {
        let mut state = self.state();
        match state {
            SiteState::Frozen => {
                if let Some(handle) = self.probe_frozen(shape, calls) {
                    SiteCounters::bump(&self.counters.hits);
                    return Ok(handle);
                }
                state = self.unfreeze(shape, calls);
            }
            SiteState::Megamorphic => return self.resolve_uncached(receiver, shape),
            SiteState::Monomorphic | SiteState::Polymorphic => {
                if let Some(handle) = self.probe_slots(shape, calls, false) {
                    SiteCounters::bump(&self.counters.hits);
                    return Ok(handle);
                }
            }
            SiteState::Cold => {}
        }

        SiteCounters::bump(&self.counters.misses);
        let stale = self.slots.iter().enumerate().find_map(|(idx, slot)| {
            slot.load_full()
                .filter(|entry| entry.shape() == shape)
                .map(|entry| (idx, entry))
        });
        let resolution = self.resolve(receiver, shape)?;
        let handle = resolution.handle.clone();
        if !self.cacheable(shape, &resolution) {
            return Ok(handle);
        }
        let entry = Arc::new(InlineCacheEntry::new(
            shape.clone(),
            resolution.handle,
            resolution.guard,
            calls,
        ));

        if let Some((idx, previous)) = stale {
            trace!(
                target: "dynsite::site",
                site = %self.id,
                member = %self.name,
                slot = idx,
                retargeted = !previous.handle().same_target(entry.handle()),
                "stale entry rebound"
            );
            self.slots[idx].store(Some(entry));
        } else {
            let distinct = SiteCounters::bump(&self.counters.distinct_shapes);
            self.counters.last_new_shape_at.store(calls, Ordering::Relaxed);
            self.install(entry);
            match state {
                SiteState::Cold => self.transition(SiteState::Monomorphic),
                SiteState::Monomorphic if distinct >= 2 => self.transition(SiteState::Polymorphic),
                _ => {}
            }
        }

        match self.policy.decide(&self.policy_input_at(calls)) {
            PolicyDecision::DemoteToMegamorphic => self.go_megamorphic(),
            PolicyDecision::PromoteToFrozen => self.freeze(calls),
            PolicyDecision::Keep => {}
        }
        Ok(handle)
    }

    // A resolution made while the receiver changed expando status would be keyed
    // under the wrong receiver shape.
    fn cacheable(&self, shape: &ShapeKey, resolution: &Resolution) -> bool {
        matches!(shape.receiver, ReceiverKey::Expando { .. }) == resolution.guard.instance_version().is_some()
    }

    fn resolve(&self, receiver: &Val, shape: &ShapeKey) -> Result<Resolution, DispatchError> {
        SiteCounters::bump(&self.counters.resolutions);
        self.resolver.resolve_for(self.kind, receiver, &self.name, &shape.args)
    }

    fn resolve_uncached(&self, receiver: &Val, shape: &ShapeKey) -> Result<ResolvedHandle, DispatchError> {
        SiteCounters::bump(&self.counters.misses);
        Ok(self.resolve(receiver, shape)?.handle)
    }

    // New entry goes to the front; a stale entry, else the least recently used
    // one, makes room when full.
    fn install(&self, entry: Arc<InlineCacheEntry>) {
        let mut live: Vec<Arc<InlineCacheEntry>> = self.slots.iter().filter_map(|slot| slot.load_full()).collect();
        if live.len() >= self.slots.len() {
            let victim = live
                .iter()
                .position(|e| !e.guard().is_current())
                .or_else(|| {
                    live.iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.last_used())
                        .map(|(idx, _)| idx)
                })
                .unwrap_or(live.len() - 1);
            let evicted = live.remove(victim);
            SiteCounters::bump(&self.counters.miss_penalty);
            trace!(
                target: "dynsite::site",
                site = %self.id,
                member = %self.name,
                evicted = ?evicted.shape(),
                "cache entry evicted"
            );
        }
        live.insert(0, entry);
        for (idx, slot) in self.slots.iter().enumerate() {
            slot.store(live.get(idx).cloned());
        }
    }

    fn freeze(&self, calls: u64) {
        let entries: Vec<Arc<InlineCacheEntry>> = self
            .slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .filter(|entry| entry.guard().is_current())
            .collect();
        if entries.is_empty() {
            return;
        }
        self.frozen.store(Some(Arc::new(FrozenTarget {
            entries: entries.into_boxed_slice(),
        })));
        SiteCounters::bump(&self.counters.freezes);
        debug!(target: "dynsite::site", site = %self.id, member = %self.name, calls, "call site frozen");
        self.transition(SiteState::Frozen);
    }

    // Called with the slow-path lock held. A bound shape whose meta-class moved on
    // demotes to MONOMORPHIC (keeping only that entry so it is rebound in place);
    // an unseen shape thaws to POLYMORPHIC with every entry kept.
    fn unfreeze(&self, shape: &ShapeKey, calls: u64) -> SiteState {
        let bound = self
            .frozen
            .load()
            .as_deref()
            .is_some_and(|target| target.lookup(shape).is_some());
        self.frozen.store(None);
        SiteCounters::bump(&self.counters.thaws);
        self.counters.last_new_shape_at.store(calls, Ordering::Relaxed);
        let next = if bound {
            let kept = self.slots.iter().filter_map(|slot| slot.load_full()).find(|e| e.shape() == shape);
            self.clear_slots();
            self.slots[0].store(kept);
            SiteState::Monomorphic
        } else {
            SiteState::Polymorphic
        };
        self.transition(next);
        next
    }

    fn go_megamorphic(&self) {
        self.clear_slots();
        self.frozen.store(None);
        self.transition(SiteState::Megamorphic);
    }

    fn clear_slots(&self) {
        for slot in self.slots.iter() {
            slot.store(None);
        }
    }

    fn transition(&self, to: SiteState) {
        let from = SiteState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        if from != to {
            debug!(
                target: "dynsite::site",
                site = %self.id,
                member = %self.name,
                from = %from,
                to = %to,
                distinct = self.distinct_shapes(),
                "call site transition"
            );
        }
    }

    fn policy_input_at(&self, calls: u64) -> PolicyInput {
        PolicyInput {
            state: self.state(),
            calls,
            hits: self.hits(),
            distinct_shapes: self.distinct_shapes(),
            last_new_shape_at: SiteCounters::get(&self.counters.last_new_shape_at),
            capacity: self.slots.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // Guards only cache bookkeeping; a poisoned lock leaves nothing torn.
        self.slow_path.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AdaptiveCallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveCallSite")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("calls", &self.call_count())
            .finish()
    }
}

