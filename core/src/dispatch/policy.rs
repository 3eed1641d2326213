use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::DispatchConfig;
use crate::dispatch::{AdaptiveCallSite, SiteState};

/// What a call site should do after the current call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PolicyDecision {
    Keep,
    PromoteToFrozen,
    /// Give up on caching: the site goes MEGAMORPHIC.
    DemoteToMegamorphic,
}

/// Counters a decision is based on. Values may be slightly stale or under-counted
/// under contention; the policy only needs them to be approximately right.
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyInput {
    pub state: SiteState,
    pub calls: u64,
    pub hits: u64,
    pub distinct_shapes: u64,
    pub last_new_shape_at: u64,
    pub capacity: usize,
}

/// Thresholds shared by every call site of a dispatcher. All of them can be
/// changed at runtime; sites read them at each decision point.
#[derive(Debug)]
pub struct OptimizationPolicy {
    optimize_threshold: AtomicU64,
    fallback_threshold: AtomicU64,
    megamorphic_multiplier: AtomicU64,
    stable_window: AtomicU64,
}

impl OptimizationPolicy {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            optimize_threshold: AtomicU64::new(config.optimize_threshold),
            fallback_threshold: AtomicU64::new(config.fallback_threshold),
            megamorphic_multiplier: AtomicU64::new(config.megamorphic_multiplier),
            stable_window: AtomicU64::new(config.stable_window),
        }
    }

    /// Decision for `site` from its current counters.
    pub fn on_call(&self, site: &AdaptiveCallSite) -> PolicyDecision {
        self.decide(&site.policy_input())
    }

    pub fn decide(&self, input: &PolicyInput) -> PolicyDecision {
        if !matches!(input.state, SiteState::Monomorphic | SiteState::Polymorphic) {
            return PolicyDecision::Keep;
        }

        // Polymorphic from the very first calls: never scored a hit and already
        // seen more shapes than the cache holds.
        let fallback = self.fallback_threshold();
        let capacity = input.capacity as u64;
        if fallback > 0 && input.hits == 0 && input.distinct_shapes >= fallback.max(capacity + 1) {
            return PolicyDecision::DemoteToMegamorphic;
        }

        let thrash_limit = (input.capacity as u64).saturating_mul(self.megamorphic_multiplier());
        if input.state == SiteState::Polymorphic && input.distinct_shapes > thrash_limit {
            return PolicyDecision::DemoteToMegamorphic;
        }

        let optimize = self.optimize_threshold();
        if input.calls > optimize {
            let window = self.stable_window().min(optimize);
            if input.calls.saturating_sub(input.last_new_shape_at) >= window {
                return PolicyDecision::PromoteToFrozen;
            }
        }
        PolicyDecision::Keep
    }

    /// Cheap pre-check for the hit path: promotion is the only decision a hit
    /// can change.
    #[inline]
    pub(crate) fn promotion_possible(&self, calls: u64) -> bool {
        calls > self.optimize_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn optimize_threshold(&self) -> u64 {
        self.optimize_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fallback_threshold(&self) -> u64 {
        self.fallback_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn megamorphic_multiplier(&self) -> u64 {
        self.megamorphic_multiplier.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stable_window(&self) -> u64 {
        self.stable_window.load(Ordering::Relaxed)
    }

    pub fn set_optimize_threshold(&self, value: u64) {
        self.optimize_threshold.store(value, Ordering::Relaxed);
    }

    /// `0` disables the early fallback.
    pub fn set_fallback_threshold(&self, value: u64) {
        self.fallback_threshold.store(value, Ordering::Relaxed);
    }

    pub fn set_megamorphic_multiplier(&self, value: u64) {
        self.megamorphic_multiplier.store(value.max(1), Ordering::Relaxed);
    }

    pub fn set_stable_window(&self, value: u64) {
        self.stable_window.store(value, Ordering::Relaxed);
    }
}

impl Default for OptimizationPolicy {
    fn default() -> Self {
        Self::new(&DispatchConfig::default())
    }
}

