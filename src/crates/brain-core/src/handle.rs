//! A narrow, non-owning facade handed to each DLC instead of a
//! reference to the full kernel.
//!
//! Grounded on `orchestrator::pattern::registry::PatternRegistry`'s
//! "query the registry by name" pattern: a bundle that needs another
//! bundle's computational unit looks it up through this handle rather
//! than holding a reference to its sibling or to `Kernel` itself,
//! breaking the ownership cycle the registry would otherwise have with
//! the bundles it owns.

use crate::cache::{Cache, CacheStats};
use crate::manifest::Manifest;
use crate::registry::{ComputationalUnit, Registry};
use std::sync::Arc;

/// Handed to a DLC's `initialize` and `on_monitor_tick` hooks. Cheap to
/// clone; every clone shares the same underlying registry and cache.
#[derive(Clone)]
pub struct KernelHandle {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
}

impl KernelHandle {
    pub fn new(registry: Arc<Registry>, cache: Arc<Cache>) -> Self {
        Self { registry, cache }
    }

    /// Look up a computational unit exposed by any registered bundle.
    pub fn computational_unit(&self, name: &str) -> Option<ComputationalUnit> {
        self.registry.computational_unit(name)
    }

    pub fn manifest_of(&self, name: &str) -> Option<Manifest> {
        self.registry.manifest_of(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Read-only view of cache occupancy and hit/miss counters; a
    /// bundle never gets a handle that lets it mutate cache entries
    /// directly.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
