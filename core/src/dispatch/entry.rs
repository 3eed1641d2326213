use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::dispatch::{ResolvedHandle, ShapeKey};
use crate::meta::VersionCell;

/// Meta-class versions a handle was bound against.
///
/// Holds the version cells themselves so that validating a guard is one or two
/// integer loads, without going back through the registry.
#[derive(Clone, Debug)]
pub struct VersionGuard {
    class_cell: Arc<VersionCell>,
    class_version: u64,
    instance: Option<(Arc<VersionCell>, u64)>,
}

impl VersionGuard {
    /// Snapshot the current versions. Must be taken *before* the meta-class
    /// contents are read, so a racing mutation can only make the guard stale.
    pub(crate) fn capture(class_cell: Arc<VersionCell>, instance_cell: Option<Arc<VersionCell>>) -> Self {
        let class_version = class_cell.current();
        let instance = instance_cell.map(|cell| {
            let version = cell.current();
            (cell, version)
        });
        Self {
            class_cell,
            class_version,
            instance,
        }
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.class_cell.current() == self.class_version
            && self
                .instance
                .as_ref()
                .is_none_or(|(cell, version)| cell.current() == *version)
    }

    #[inline]
    pub fn class_version(&self) -> u64 {
        self.class_version
    }

    pub fn instance_version(&self) -> Option<u64> {
        self.instance.as_ref().map(|(_, version)| *version)
    }
}

/// One cached (shape -> handle) association.
///
/// Entries are immutable apart from their heuristic counters and are replaced
/// as a whole through an atomic pointer swap.
#[derive(Debug)]
pub struct InlineCacheEntry {
    shape: ShapeKey,
    handle: ResolvedHandle,
    guard: VersionGuard,
    hits: AtomicU64,
    last_used: AtomicU64,
}

impl InlineCacheEntry {
    pub(crate) fn new(shape: ShapeKey, handle: ResolvedHandle, guard: VersionGuard, stamp: u64) -> Self {
        Self {
            shape,
            handle,
            guard,
            hits: AtomicU64::new(0),
            last_used: AtomicU64::new(stamp),
        }
    }

    #[inline]
    pub fn shape(&self) -> &ShapeKey {
        &self.shape
    }

    #[inline]
    pub fn handle(&self) -> &ResolvedHandle {
        &self.handle
    }

    #[inline]
    pub fn guard(&self) -> &VersionGuard {
        &self.guard
    }

    /// Shape matches and the bound versions are still current.
    #[inline]
    pub fn is_valid_for(&self, shape: &ShapeKey) -> bool {
        self.shape == *shape && self.guard.is_current()
    }

    #[inline]
    pub(crate) fn record_hit(&self, stamp: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_used.store(stamp, Ordering::Relaxed);
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}
