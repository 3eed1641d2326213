use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

use crate::config::DispatchConfig;
use crate::dispatch::{
    AdaptiveCallSite, ArgShape, CallSiteKind, CallSiteSnapshot, DispatchMetrics, MethodResolver, OptimizationPolicy,
    SiteId,
};
use crate::error::DispatchError;
use crate::meta::MetaClassRegistry;
use crate::util::fast_map::{FastDashMap, fast_dash_map_new};
use crate::val::Val;

static GLOBAL: Lazy<Dispatcher> = Lazy::new(|| match DispatchConfig::from_env() {
    Ok(config) => Dispatcher::from_valid(config),
    Err(err) => {
        warn!(target: "dynsite::site", error = %err, "ignoring invalid DYNSITE_* settings");
        Dispatcher::with_defaults()
    }
});

/// Owns the registry, resolver, policy and the table of call sites.
///
/// Code generators ask for a site once per syntactic call location with a stable
/// [`SiteId`] and then call through it repeatedly.
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<MetaClassRegistry>,
    resolver: Arc<MethodResolver>,
    policy: Arc<OptimizationPolicy>,
    sites: FastDashMap<SiteId, Arc<AdaptiveCallSite>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    pub fn with_defaults() -> Self {
        Self::from_valid(DispatchConfig::default())
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::from_valid(DispatchConfig::from_env()?))
    }

    /// Process-wide dispatcher configured from the environment on first use.
    pub fn global() -> &'static Dispatcher {
        &GLOBAL
    }

    fn from_valid(config: DispatchConfig) -> Self {
        let registry = Arc::new(MetaClassRegistry::new());
        let resolver = Arc::new(MethodResolver::new(registry.clone(), &config));
        let policy = Arc::new(OptimizationPolicy::new(&config));
        Self {
            config,
            registry,
            resolver,
            policy,
            sites: fast_dash_map_new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<MetaClassRegistry> {
        &self.registry
    }

    #[inline]
    pub fn resolver(&self) -> &Arc<MethodResolver> {
        &self.resolver
    }

    #[inline]
    pub fn policy(&self) -> &Arc<OptimizationPolicy> {
        &self.policy
    }

    /// The site for `id`, created on first request. Reusing an id for a different
    /// call expression is rejected.
    pub fn call_site(&self, id: SiteId, kind: CallSiteKind, name: &str) -> Result<Arc<AdaptiveCallSite>, DispatchError> {
        let site = self
            .sites
            .entry(id)
            .or_insert_with(|| {
                Arc::new(AdaptiveCallSite::new(
                    id,
                    kind,
                    name,
                    self.config.cache_capacity,
                    self.resolver.clone(),
                    self.policy.clone(),
                ))
            })
            .value()
            .clone();
        if site.kind() != kind || site.name() != name {
            return Err(DispatchError::SiteIdConflict {
                site: id.0,
                existing: format!("{} {}", site.kind(), site.name()),
                requested: format!("{kind} {name}"),
            });
        }
        Ok(site)
    }

    pub fn method_site(&self, id: SiteId, name: &str) -> Result<Arc<AdaptiveCallSite>, DispatchError> {
        self.call_site(id, CallSiteKind::Method, name)
    }

    pub fn site(&self, id: SiteId) -> Option<Arc<AdaptiveCallSite>> {
        self.sites.get(&id).map(|site| site.value().clone())
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Uncached dispatch: resolve then invoke, exactly what a call site computes
    /// on a miss.
    pub fn invoke_method(&self, receiver: &Val, name: &str, args: &[Val]) -> Result<Val> {
        self.invoke_uncached(CallSiteKind::Method, receiver, name, args)
    }

    pub fn get_property(&self, receiver: &Val, name: &str) -> Result<Val> {
        self.invoke_uncached(CallSiteKind::GetProperty, receiver, name, &[])
    }

    pub fn set_property(&self, receiver: &Val, name: &str, value: Val) -> Result<Val> {
        self.invoke_uncached(CallSiteKind::SetProperty, receiver, name, std::slice::from_ref(&value))
    }

    fn invoke_uncached(&self, kind: CallSiteKind, receiver: &Val, name: &str, args: &[Val]) -> Result<Val> {
        let resolution = self.resolver.resolve_for(kind, receiver, name, &ArgShape::of(args))?;
        resolution.handle.invoke(receiver, args)
    }

    /// Snapshots of every site, ordered by id.
    pub fn snapshots(&self) -> Vec<CallSiteSnapshot> {
        let mut sites: Vec<Arc<AdaptiveCallSite>> = self.sites.iter().map(|site| site.value().clone()).collect();
        sites.sort_by_key(|site| site.id());
        sites.iter().map(|site| site.snapshot()).collect()
    }

    pub fn metrics(&self) -> DispatchMetrics {
        let mut metrics = DispatchMetrics {
            resolver_invocations: self.resolver.invocations(),
            full_resolutions: self.resolver.full_resolutions(),
            memo_hits: self.resolver.memo_hits(),
            meta_classes: self.registry.meta_class_count(),
            ..DispatchMetrics::default()
        };
        for snapshot in self.snapshots() {
            metrics.absorb(&snapshot);
        }
        metrics
    }

    /// Reset every site back to COLD.
    pub fn reset_sites(&self) {
        for site in self.sites.iter() {
            site.value().reset();
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("sites", &self.sites.len())
            .finish()
    }
}
