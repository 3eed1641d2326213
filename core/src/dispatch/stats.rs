use serde::Serialize;

use crate::dispatch::{CallSiteKind, SiteState};

/// One cache entry as seen by monitoring tools.
#[derive(Clone, Debug, Serialize)]
pub struct EntrySnapshot {
    pub receiver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u64>,
    pub args: Vec<String>,
    pub target: String,
    pub version: u64,
    pub stale: bool,
    pub hits: u64,
}

/// Point-in-time view of one call site.
#[derive(Clone, Debug, Serialize)]
pub struct CallSiteSnapshot {
    pub site: u64,
    pub kind: CallSiteKind,
    pub name: String,
    pub state: SiteState,
    pub capacity: usize,
    pub calls: u64,
    pub hits: u64,
    pub misses: u64,
    pub resolutions: u64,
    pub distinct_shapes: u64,
    pub miss_penalty: u64,
    pub freezes: u64,
    pub thaws: u64,
    pub entries: Vec<EntrySnapshot>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub cold: usize,
    pub monomorphic: usize,
    pub polymorphic: usize,
    pub megamorphic: usize,
    pub frozen: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: SiteState) {
        match state {
            SiteState::Cold => self.cold += 1,
            SiteState::Monomorphic => self.monomorphic += 1,
            SiteState::Polymorphic => self.polymorphic += 1,
            SiteState::Megamorphic => self.megamorphic += 1,
            SiteState::Frozen => self.frozen += 1,
        }
    }
}

/// Aggregate over every site of a dispatcher plus the shared resolver.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DispatchMetrics {
    pub sites: usize,
    pub states: StateCounts,
    pub calls: u64,
    pub hits: u64,
    pub misses: u64,
    pub site_resolutions: u64,
    pub resolver_invocations: u64,
    pub full_resolutions: u64,
    pub memo_hits: u64,
    pub meta_classes: usize,
}

impl DispatchMetrics {
    pub fn hit_ratio(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.hits as f64 / self.calls as f64
        }
    }

    pub(crate) fn absorb(&mut self, site: &CallSiteSnapshot) {
        self.sites += 1;
        self.states.record(site.state);
        self.calls += site.calls;
        self.hits += site.hits;
        self.misses += site.misses;
        self.site_resolutions += site.resolutions;
    }
}
