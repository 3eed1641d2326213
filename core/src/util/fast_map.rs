use std::hash::Hash;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// Single-owner maps: method tables, field slots, class names.
pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// Shared tables (meta-classes, call sites, resolver memo). Keys are small ids
/// and names, so Fx hashing is used here too.
pub type FastDashMap<K, V> = DashMap<K, V, FxBuildHasher>;

#[inline]
pub fn fast_hash_map_new<K, V>() -> FastHashMap<K, V> {
    rustc_hash::FxHashMap::default()
}

#[inline]
pub fn fast_dash_map_new<K: Eq + Hash, V>() -> FastDashMap<K, V> {
    DashMap::with_hasher(FxBuildHasher)
}
