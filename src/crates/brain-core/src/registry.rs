//! DLC registry: lifecycle of loaded bundles.
//!
//! The thread-safe storage shape (`Arc<RwLock<HashMap<...>>>`, a
//! scan-directory-then-load-best-effort walk that logs and continues
//! past individual failures) is grounded on
//! `orchestrator::pattern::registry::PatternRegistry`. The
//! priority-then-fixed-point dependency resolution loop has no donor
//! counterpart and is ported directly from `BrainCore.load_all_dlcs`
//! in the original kernel.

use crate::handle::KernelHandle;
use crate::manifest::{validate_dependency, Manifest};
use crate::observability::Observability;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("dlc {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("dlc {0:?} is not registered")]
    NotRegistered(String),

    #[error("dependency validation failed for {0:?}: {1}")]
    DependencyError(String, #[source] crate::manifest::ManifestError),

    #[error(transparent)]
    Signature(#[from] crate::signature::SignatureError),

    #[error("bundle loading failed: {0}")]
    LoadFailed(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A named, versioned computational function a DLC exposes to the rest
/// of the kernel once registered.
pub type ComputationalUnit = Arc<dyn Fn(serde_json::Value) -> crate::Result<serde_json::Value> + Send + Sync>;

/// Implemented by every DLC bundle. Bundles are discovered as dynamic
/// libraries; each exposes an `extern "C" fn brain_dlc_entry() -> *mut
/// dyn Dlc` that the loader resolves before registering the returned
/// instance.
pub trait Dlc: Send + Sync {
    fn manifest(&self) -> Manifest;

    /// Called exactly once, after dependency validation succeeds.
    /// `handle` is a narrow facade over the registry — never the full
    /// kernel — so a bundle can look up a sibling's computational unit
    /// without holding a reference back to its owner.
    fn initialize(&self, _handle: &KernelHandle) -> crate::Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    /// Computational units this DLC contributes, keyed by unit name.
    fn computational_units(&self) -> HashMap<String, ComputationalUnit> {
        HashMap::new()
    }

    /// Optional periodic hook invoked by the kernel's performance
    /// monitor. Errors are logged and swallowed, never propagated.
    fn on_monitor_tick(&self, _handle: &KernelHandle) {}
}

struct BundleRecord {
    manifest: Manifest,
    instance: Arc<dyn Dlc>,
    initialized: bool,
}

/// Thread-safe registry of loaded DLC bundles.
pub struct Registry {
    bundles: RwLock<HashMap<String, BundleRecord>>,
    kernel_name: String,
    kernel_version: String,
    kernel_aliases: Vec<String>,
    /// Gates dependency validation in `register`. Read from
    /// `KernelConfig.dlc_strict_dependency_check` at construction and
    /// kept in sync across config hot-reloads via
    /// `set_strict_dependency_check`.
    strict_dependency_check: AtomicBool,
    observability: Arc<Observability>,
    /// Memoizes `computational_unit` lookups by name, populated on
    /// first hit, matching the original registry's
    /// `self.computational_units` cache dict.
    unit_cache: RwLock<HashMap<String, ComputationalUnit>>,
}

impl Registry {
    pub fn new(
        kernel_name: impl Into<String>,
        kernel_version: impl Into<String>,
        observability: Arc<Observability>,
        strict_dependency_check: bool,
    ) -> Self {
        let kernel_name = kernel_name.into();
        Self {
            kernel_aliases: vec![kernel_name.clone(), "core".to_string()],
            kernel_name,
            kernel_version: kernel_version.into(),
            bundles: RwLock::new(HashMap::new()),
            strict_dependency_check: AtomicBool::new(strict_dependency_check),
            observability,
            unit_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_strict_dependency_check(&self, strict: bool) {
        self.strict_dependency_check.store(strict, Ordering::Relaxed);
    }

    pub fn strict_dependency_check_enabled(&self) -> bool {
        self.strict_dependency_check.load(Ordering::Relaxed)
    }

    /// In strict mode (the default), validate `instance`'s declared
    /// dependencies against already registered peers before storing it
    /// and calling `initialize(handle)`. Outside strict mode,
    /// dependency validation is skipped and a bundle registers
    /// unconditionally — matching spec's "if strict mode, validate
    /// every dependency" gate.
    pub fn register(&self, instance: Arc<dyn Dlc>, handle: &KernelHandle) -> Result<()> {
        let manifest = instance.manifest();

        if self.bundles.read().contains_key(&manifest.name) {
            return Err(RegistryError::AlreadyRegistered(manifest.name));
        }

        if self.strict_dependency_check.load(Ordering::Relaxed) {
            let bundles = self.bundles.read();
            for dep in &manifest.dependencies {
                let aliases: Vec<&str> = self.kernel_aliases.iter().map(String::as_str).collect();
                validate_dependency(dep, &self.kernel_name, &self.kernel_version, &aliases, |name| {
                    bundles.get(name).map(|b| b.manifest.version.clone())
                })
                .map_err(|e| RegistryError::DependencyError(manifest.name.clone(), e))?;
            }
        }

        instance.initialize(handle)?;

        self.bundles.write().insert(
            manifest.name.clone(),
            BundleRecord {
                manifest,
                instance,
                initialized: true,
            },
        );
        self.observability.record_dlc_loaded();
        self.unit_cache.write().clear();
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let record = self
            .bundles
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        record.instance.shutdown();
        self.unit_cache.write().clear();
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bundles.read().contains_key(name)
    }

    pub fn manifest_of(&self, name: &str) -> Option<Manifest> {
        self.bundles.read().get(name).map(|b| b.manifest.clone())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.bundles.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First-hit lookup of a named computational unit across every
    /// loaded bundle, in no particular order — callers that care about
    /// precedence should register bundles so only one provides a given
    /// unit name. Memoized thereafter; the cache is invalidated on the
    /// next `register`/`unregister` so a later-loaded bundle's units
    /// are still found.
    pub fn computational_unit(&self, unit_name: &str) -> Option<ComputationalUnit> {
        if let Some(unit) = self.unit_cache.read().get(unit_name) {
            return Some(unit.clone());
        }

        let unit = self
            .bundles
            .read()
            .values()
            .find_map(|b| b.instance.computational_units().remove(unit_name))?;

        self.unit_cache.write().insert(unit_name.to_string(), unit.clone());
        Some(unit)
    }

    pub fn tick_monitors(&self, handle: &KernelHandle) {
        for bundle in self.bundles.read().values() {
            bundle.instance.on_monitor_tick(handle);
        }
    }

    pub fn shutdown_all(&self) {
        let mut bundles = self.bundles.write();
        for (_, record) in bundles.drain() {
            record.instance.shutdown();
        }
    }

    /// Run a fixed-point registration loop over already-verified,
    /// already-instantiated candidates: keep attempting registration of
    /// the still-pending candidates, ordered by declared priority, until
    /// a full pass makes no progress. Individual bundle failures are
    /// collected rather than aborting the whole load, matching the
    /// donor registry's per-file `warn!`-and-continue directory scan.
    ///
    /// Signature verification is the caller's responsibility and must
    /// have already happened during bundle discovery, before each
    /// candidate was ever instantiated — see `Kernel::load_all_dlcs`.
    pub fn load_all(&self, candidates: Vec<Arc<dyn Dlc>>, handle: &KernelHandle) -> Vec<(String, RegistryError)> {
        let mut pending: Vec<Arc<dyn Dlc>> = candidates;
        pending.sort_by_key(|d| d.manifest().priority);

        let mut failures = HashMap::new();
        let mut progressed = true;

        while !pending.is_empty() && progressed {
            progressed = false;
            let mut next_pending = Vec::new();

            for candidate in pending {
                let name = candidate.manifest().name.clone();
                match self.register(candidate.clone(), handle) {
                    Ok(()) => {
                        progressed = true;
                        failures.remove(&name);
                    }
                    Err(e) => {
                        failures.insert(name, e);
                        next_pending.push(candidate);
                    }
                }
            }

            pending = next_pending;
        }

        for candidate in &pending {
            let manifest = candidate.manifest();
            tracing::warn!(
                dlc = %manifest.name,
                dependencies = ?manifest.dependencies,
                "dlc could not be registered after dependency resolution converged"
            );
        }

        failures.into_iter().collect()
    }
}

/// Load a single DLC bundle's entry point from a dynamic library and
/// return the boxed instance. Signature verification must have
/// already succeeded for `path` before this is called.
///
/// # Safety
///
/// The bundle must export a correctly-typed `brain_dlc_entry` symbol
/// returning an owned, heap-allocated trait object; calling this on an
/// untrusted or mismatched library is undefined behavior.
pub unsafe fn load_bundle_entry(path: &Path) -> Result<Arc<dyn Dlc>> {
    type EntryFn = unsafe extern "C" fn() -> *mut (dyn Dlc + 'static);

    let library = libloading::Library::new(path)
        .map_err(|e| RegistryError::LoadFailed(format!("{}: {e}", path.display())))?;
    let entry: libloading::Symbol<EntryFn> = library
        .get(b"brain_dlc_entry")
        .map_err(|e| RegistryError::LoadFailed(format!("{}: {e}", path.display())))?;

    let raw = entry();
    if raw.is_null() {
        return Err(RegistryError::LoadFailed(format!(
            "{}: brain_dlc_entry returned null",
            path.display()
        )));
    }

    // Leak the library so its symbols remain valid for the boxed
    // instance's lifetime; bundles live for the kernel process.
    std::mem::forget(library);
    Ok(Arc::from(Box::from_raw(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DlcKind;

    struct TestDlc {
        name: &'static str,
        dependencies: Vec<String>,
        priority: i32,
    }

    impl Dlc for TestDlc {
        fn manifest(&self) -> Manifest {
            Manifest {
                name: self.name.to_string(),
                version: "1.0.0".to_string(),
                author: "test".to_string(),
                description: String::new(),
                kind: DlcKind::Processor,
                dependencies: self.dependencies.clone(),
                priority: self.priority,
                enabled: true,
            }
        }
    }

    fn test_handle(registry: &Arc<Registry>) -> KernelHandle {
        let cache = Arc::new(crate::cache::Cache::new(16, std::time::Duration::from_secs(60)).unwrap());
        KernelHandle::new(registry.clone(), cache)
    }

    fn test_registry(kernel_name: &str, kernel_version: &str) -> Arc<Registry> {
        Arc::new(Registry::new(
            kernel_name,
            kernel_version,
            Arc::new(Observability::disabled()),
            true,
        ))
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);
        registry
            .register(
                Arc::new(TestDlc {
                    name: "alpha",
                    dependencies: vec![],
                    priority: 0,
                }),
                &handle,
            )
            .unwrap();

        assert!(registry.contains("alpha"));
        registry.unregister("alpha").unwrap();
        assert!(!registry.contains("alpha"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);
        let dlc = Arc::new(TestDlc {
            name: "alpha",
            dependencies: vec![],
            priority: 0,
        });
        registry.register(dlc.clone(), &handle).unwrap();
        assert!(matches!(
            registry.register(dlc, &handle),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_register_rejects_unresolved_dependency() {
        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);
        let result = registry.register(
            Arc::new(TestDlc {
                name: "beta",
                dependencies: vec!["alpha>=1.0.0".to_string()],
                priority: 0,
            }),
            &handle,
        );
        assert!(matches!(result, Err(RegistryError::DependencyError(_, _))));
    }

    #[test]
    fn test_register_accepts_kernel_dependency() {
        let registry = test_registry("brain", "1.2.0");
        let handle = test_handle(&registry);
        let result = registry.register(
            Arc::new(TestDlc {
                name: "alpha",
                dependencies: vec!["brain>=1.0.0".to_string()],
                priority: 0,
            }),
            &handle,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_fixed_point_resolves_out_of_order_dependencies() {
        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);

        // "beta" depends on "alpha", but is listed first — the loader
        // must converge via repeated passes, not a single ordered pass.
        let candidates: Vec<Arc<dyn Dlc>> = vec![
            Arc::new(TestDlc {
                name: "beta",
                dependencies: vec!["alpha>=1.0.0".to_string()],
                priority: 0,
            }),
            Arc::new(TestDlc {
                name: "alpha",
                dependencies: vec![],
                priority: 0,
            }),
        ];

        let failures = registry.load_all(candidates, &handle);

        assert!(failures.is_empty(), "expected both dlcs to register: {failures:?}");
        assert!(registry.contains("alpha"));
        assert!(registry.contains("beta"));
    }

    #[test]
    fn test_fixed_point_reports_unresolvable_dependency() {
        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);
        let candidates: Vec<Arc<dyn Dlc>> = vec![Arc::new(TestDlc {
            name: "beta",
            dependencies: vec!["missing>=1.0.0".to_string()],
            priority: 0,
        })];

        let failures = registry.load_all(candidates, &handle);
        assert_eq!(failures.len(), 1);
        assert!(!registry.contains("beta"));
    }

    #[test]
    fn test_computational_unit_lookup() {
        struct UnitDlc;
        impl Dlc for UnitDlc {
            fn manifest(&self) -> Manifest {
                Manifest {
                    name: "units".to_string(),
                    version: "1.0.0".to_string(),
                    author: "test".to_string(),
                    description: String::new(),
                    kind: DlcKind::Processor,
                    dependencies: vec![],
                    priority: 0,
                    enabled: true,
                }
            }

            fn computational_units(&self) -> HashMap<String, ComputationalUnit> {
                let mut map = HashMap::new();
                map.insert(
                    "double".to_string(),
                    Arc::new(|v: serde_json::Value| {
                        let n = v.as_i64().unwrap_or(0) * 2;
                        Ok(serde_json::json!(n))
                    }) as ComputationalUnit,
                );
                map
            }
        }

        let registry = test_registry("brain", "1.0.0");
        let handle = test_handle(&registry);
        registry.register(Arc::new(UnitDlc), &handle).unwrap();

        let unit = registry.computational_unit("double").unwrap();
        assert_eq!(unit(serde_json::json!(21)).unwrap(), serde_json::json!(42));

        // Second lookup must come back out of the memoized cache and
        // still resolve to the same behavior.
        let cached = registry.computational_unit("double").unwrap();
        assert_eq!(cached(serde_json::json!(10)).unwrap(), serde_json::json!(20));
    }

    #[test]
    fn test_non_strict_mode_skips_dependency_validation() {
        let registry = test_registry("brain", "1.0.0");
        registry.set_strict_dependency_check(false);
        let handle = test_handle(&registry);

        let result = registry.register(
            Arc::new(TestDlc {
                name: "beta",
                dependencies: vec!["missing>=1.0.0".to_string()],
                priority: 0,
            }),
            &handle,
        );
        assert!(result.is_ok(), "non-strict mode must not validate dependencies");
        assert!(registry.contains("beta"));
    }

    #[test]
    fn test_register_increments_dlc_loaded_counter() {
        let observability = Arc::new(Observability::new(true, false));
        let registry = Arc::new(Registry::new("brain", "1.0.0", observability.clone(), true));
        let handle = test_handle(&registry);

        registry
            .register(
                Arc::new(TestDlc {
                    name: "alpha",
                    dependencies: vec![],
                    priority: 0,
                }),
                &handle,
            )
            .unwrap();

        assert_eq!(observability.snapshot_counters()["dlc_loaded"], 1);
    }
}
