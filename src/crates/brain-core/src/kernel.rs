//! The scheduler: submit task -> cache lookup -> pool routing -> retry
//! -> span -> cache store -> stats.
//!
//! `Kernel::compute` is a direct port of `BrainCore.compute` in the
//! original kernel: cache-key lookup, conditional retry wrapping,
//! CPU-prefix pool routing, and the rolling-average latency update.
//! Pool routing follows the spec's CPU/IO split using `tokio`'s
//! blocking-thread pool for IO-bound work and a small dedicated
//! `std::thread` pool (sized to `process_pool_size`) for CPU-bound work
//! — Rust has no GIL forcing true OS-process isolation, but the
//! separately-sized pool still preserves the routing contract.

use crate::cache::{Cache, CacheKey};
use crate::config_source::ConfigSource;
use crate::handle::KernelHandle;
use crate::leader::{LeaderElectionConfig, LeaderElector, LockBackend};
use crate::observability::Observability;
use crate::registry::Registry;
use crate::retry::{self, RetryPolicy};
use crate::{KernelError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The full set of tunables the kernel recognizes, with defaults
/// mirroring the original kernel's config-merge table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub name: String,
    pub version: String,
    pub thread_pool_size: usize,
    pub process_pool_size: usize,
    pub cpu_task_prefixes: Vec<String>,
    pub enable_disk_cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub cache_size_mb: u64,
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: u64,
    pub retry_max_attempts: usize,
    pub retry_initial_delay_seconds: f64,
    pub retry_max_delay_seconds: f64,
    pub retry_backoff_multiplier: f64,
    pub retry_jitter_ratio: f64,
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    pub log_level: String,
    pub log_json: bool,
    pub service_name: String,
    pub monitoring_interval_secs: f64,
    pub auto_load_dlcs: bool,
    pub dlc_search_paths: Vec<PathBuf>,
    pub dlc_strict_dependency_check: bool,
    pub dlc_signature_required: bool,
    pub dlc_signature_verify_if_present: bool,
    pub dlc_public_key_pem_files: Vec<PathBuf>,
    pub enable_config_watch: bool,
    pub config_source: Option<PathBuf>,
    pub config_poll_seconds: f64,
    pub leader_election_enabled: bool,
    pub leader_lock_key: String,
    pub leader_ttl_seconds: u64,
    pub leader_renew_interval_seconds: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "brain".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            thread_pool_size: 50,
            process_pool_size: num_cpus(),
            cpu_task_prefixes: vec!["cpu_".to_string(), "cpu_task".to_string()],
            enable_disk_cache: true,
            cache_dir: None,
            cache_size_mb: 256,
            cache_max_entries: 10_000,
            cache_ttl_seconds: 300,
            retry_max_attempts: 1,
            retry_initial_delay_seconds: 0.2,
            retry_max_delay_seconds: 5.0,
            retry_backoff_multiplier: 2.0,
            retry_jitter_ratio: 0.2,
            enable_metrics: false,
            enable_tracing: false,
            log_level: "info".to_string(),
            log_json: false,
            service_name: "brain".to_string(),
            monitoring_interval_secs: 5.0,
            auto_load_dlcs: true,
            dlc_search_paths: vec![PathBuf::from("./dlcs")],
            dlc_strict_dependency_check: true,
            dlc_signature_required: false,
            dlc_signature_verify_if_present: true,
            dlc_public_key_pem_files: Vec::new(),
            enable_config_watch: false,
            config_source: None,
            config_poll_seconds: 5.0,
            leader_election_enabled: false,
            leader_lock_key: "brain:leader".to_string(),
            leader_ttl_seconds: 10,
            leader_renew_interval_seconds: 3.0,
        }
    }
}

/// The platform dynamic-library suffix a DLC bundle file must carry.
#[cfg(target_os = "macos")]
const DLC_EXTENSION: &str = "dylib";
#[cfg(target_os = "windows")]
const DLC_EXTENSION: &str = "dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const DLC_EXTENSION: &str = "so";

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Default retriable-error classification, matching the original
/// kernel's `is_retriable_exception` default of
/// `(TimeoutError, ConnectionError, OSError)`: only transient I/O
/// conditions are retried, everything else (task logic failures,
/// signature/manifest/registry errors, serialization errors) is
/// treated as terminal.
fn is_retriable(err: &KernelError) -> bool {
    match err {
        KernelError::Io(e) => retry::is_transient_io(e),
        _ => false,
    }
}

/// Monotonic task counters plus a rolling mean of completed-task
/// latency, matching the original kernel's `Stats`.
#[derive(Debug, Default)]
pub struct Stats {
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    avg_latency_micros: AtomicU64,
}

impl Stats {
    pub fn total_tasks(&self) -> u64 {
        self.total_tasks.load(Ordering::Relaxed)
    }

    pub fn completed_tasks(&self) -> u64 {
        self.completed_tasks.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.avg_latency_micros.load(Ordering::Relaxed))
    }

    fn record_completion(&self, elapsed: Duration) {
        let n = self.completed_tasks.fetch_add(1, Ordering::Relaxed) + 1;
        let prev_avg = self.avg_latency_micros.load(Ordering::Relaxed) as f64;
        let new_avg = (prev_avg * (n - 1) as f64 + elapsed.as_micros() as f64) / n as f64;
        self.avg_latency_micros.store(new_avg as u64, Ordering::Relaxed);
    }
}

/// A small fixed worker pool standing in for the original's
/// `ProcessPoolExecutor`, used for task IDs matching a configured CPU
/// prefix.
struct CpuPool {
    tx: Option<std::sync::mpsc::Sender<Box<dyn FnOnce() + Send>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl CpuPool {
    fn new(size: usize) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let rx = Arc::new(parking_lot::Mutex::new(rx));
        let handles = (0..size.max(1))
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || loop {
                    let job = {
                        let rx = rx.lock();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();

        Self { tx: Some(tx), handles }
    }

    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| KernelError::General("cpu pool is shut down".to_string()))?;

        tx.send(Box::new(move || {
            let _ = result_tx.send(f());
        }))
        .map_err(|_| KernelError::General("cpu pool worker threads have exited".to_string()))?;

        result_rx
            .await
            .map_err(|_| KernelError::General("cpu pool task dropped before completion".to_string()))
    }

    fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The wired-together kernel: cache, registry, retry policy,
/// observability, and pools, behind a single `compute` entry point.
pub struct Kernel {
    config: parking_lot::RwLock<KernelConfig>,
    cache: Arc<Cache>,
    registry: Arc<Registry>,
    observability: Arc<Observability>,
    stats: Stats,
    cpu_pool: CpuPool,
    monitor_stop: tokio_util::sync::CancellationToken,
    leader: parking_lot::Mutex<Option<Arc<LeaderElector>>>,
    config_watch_stop: parking_lot::Mutex<Option<tokio_util::sync::CancellationToken>>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self> {
        let cache = Arc::new(
            Cache::new(config.cache_max_entries, Duration::from_secs(config.cache_ttl_seconds))
                .map_err(|e| KernelError::General(e.to_string()))?
                .with_max_bytes((config.cache_size_mb * 1024 * 1024) as usize),
        );

        let observability = Arc::new(Observability::new(config.enable_metrics, config.enable_tracing));
        let registry = Arc::new(Registry::new(
            config.name.clone(),
            config.version.clone(),
            observability.clone(),
            config.dlc_strict_dependency_check,
        ));
        let cpu_pool = CpuPool::new(config.process_pool_size);

        Ok(Self {
            cpu_pool,
            cache,
            registry,
            observability,
            stats: Stats::default(),
            monitor_stop: tokio_util::sync::CancellationToken::new(),
            leader: parking_lot::Mutex::new(None),
            config_watch_stop: parking_lot::Mutex::new(None),
            config: parking_lot::RwLock::new(config),
        })
    }

    /// Start the leader-election background loop against `backend` if
    /// `leader_election_enabled` is set; a no-op otherwise. Mirrors the
    /// original kernel's behavior of only requiring a lock backend when
    /// HA mode is actually turned on.
    pub fn start_leader_election(&self, backend: Arc<dyn LockBackend>) -> Option<tokio::task::JoinHandle<()>> {
        let cfg = self.config.read();
        if !cfg.leader_election_enabled {
            return None;
        }
        let elector = Arc::new(LeaderElector::new(
            LeaderElectionConfig {
                enabled: true,
                lock_key: cfg.leader_lock_key.clone(),
                ttl: Duration::from_secs(cfg.leader_ttl_seconds),
                renew_interval: Duration::from_secs_f64(cfg.leader_renew_interval_seconds.max(0.01)),
            },
            backend,
        ));
        let handle = elector.spawn();
        *self.leader.lock() = Some(elector);
        Some(handle)
    }

    /// Whether this kernel currently holds leadership. When leader
    /// election is disabled, every instance is trivially a leader.
    pub fn is_leader(&self) -> bool {
        match self.leader.lock().as_ref() {
            Some(elector) => elector.state().is_leader(),
            None => true,
        }
    }

    /// Start watching the configured [`ConfigSource`] for changes,
    /// hot-applying each new snapshot via [`Kernel::apply_config_update`].
    /// A no-op when `enable_config_watch` is unset or no source is
    /// configured.
    pub fn start_config_watch(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let (enabled, path, poll_seconds) = {
            let cfg = self.config.read();
            (cfg.enable_config_watch, cfg.config_source.clone(), cfg.config_poll_seconds)
        };
        if !enabled {
            return None;
        }
        let Some(path) = path else { return None };

        let source = Arc::new(crate::config_source::FileConfigSource::new(path));
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let stop = source.start_watch(tx, Duration::from_secs_f64(poll_seconds.max(0.1)));
        *self.config_watch_stop.lock() = Some(stop);

        let kernel = self.clone();
        Some(tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                match serde_yaml::from_slice::<KernelConfig>(&bytes) {
                    Ok(new_config) => kernel.apply_config_update(new_config),
                    Err(e) => tracing::warn!(error = %e, "ignoring unparseable config update"),
                }
            }
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn handle(&self) -> KernelHandle {
        KernelHandle::new(self.registry.clone(), self.cache.clone())
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Build the retry policy in effect for the current config, wiring
    /// the jitter/backoff knobs through instead of leaving them at
    /// `RetryPolicy::default()`.
    fn retry_policy(&self) -> RetryPolicy {
        let cfg = self.config.read();
        RetryPolicy::new(cfg.retry_max_attempts)
            .with_initial_delay(Duration::from_secs_f64(cfg.retry_initial_delay_seconds.max(0.0)))
            .with_max_delay(Duration::from_secs_f64(cfg.retry_max_delay_seconds.max(0.0)))
            .with_multiplier(cfg.retry_backoff_multiplier)
            .with_jitter_ratio(cfg.retry_jitter_ratio)
    }

    fn is_cpu_task(&self, task_id: &str) -> bool {
        self.config
            .read()
            .cpu_task_prefixes
            .iter()
            .any(|prefix| task_id.starts_with(prefix.as_str()))
    }

    /// Submit a unit of work for execution: cache lookup, pool
    /// routing, optional retry, span, and cache store, in that order.
    pub async fn compute<F>(&self, task_id: &str, cache_key: CacheKey, func: F) -> Result<Value>
    where
        F: Fn() -> Result<Value> + Send + Sync + Clone + 'static,
    {
        self.stats.total_tasks.fetch_add(1, Ordering::Relaxed);

        if let Some(cached) = self.cache.get(&cache_key) {
            self.observability.record_cache_hit();
            return Ok(cached);
        }
        self.observability.record_cache_miss();

        let _span = self.observability.start_span(&format!("compute:{task_id}"));
        let started = Instant::now();

        let retry_policy = self.retry_policy();
        let is_cpu = self.is_cpu_task(task_id);

        // `run` below is `Fn() -> T` and `func` is already `Result<Value>`,
        // so both pools hand back a doubly-wrapped result; `.and_then(|r| r)`
        // flattens it without using `?` (which would skip the bookkeeping
        // in the match below on the non-retried paths).
        let result = if is_cpu {
            if retry_policy.max_attempts > 1 {
                retry::retry(&retry_policy, is_retriable, || {
                    let func = func.clone();
                    Box::pin(async move { self.cpu_pool.run(move || func()).await? })
                })
                .await
            } else {
                let func = func.clone();
                self.cpu_pool.run(move || func()).await.and_then(|r| r)
            }
        } else if retry_policy.max_attempts > 1 {
            retry::retry(&retry_policy, is_retriable, || {
                let func = func.clone();
                Box::pin(async move {
                    tokio::task::spawn_blocking(func)
                        .await
                        .map_err(|e| KernelError::General(format!("blocking task panicked: {e}")))?
                })
            })
            .await
        } else {
            let func = func.clone();
            tokio::task::spawn_blocking(func)
                .await
                .map_err(|e| KernelError::General(format!("blocking task panicked: {e}")))
                .and_then(|r| r)
        };

        match result {
            Ok(value) => {
                self.cache.set(cache_key, value.clone());
                let elapsed = started.elapsed();
                self.observability.record_task_seconds(task_id, elapsed);
                self.stats.record_completion(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.observability.record_task_error(task_id);
                Err(e)
            }
        }
    }

    /// Apply a hot configuration update: cache limits and retry policy
    /// are the two subsets the original kernel re-applies without a
    /// restart. Each field update is independent so one bad value
    /// doesn't block the rest.
    pub fn apply_config_update(&self, new_config: KernelConfig) {
        self.cache.set_limits(
            new_config.cache_max_entries,
            Duration::from_secs(new_config.cache_ttl_seconds),
            Some((new_config.cache_size_mb * 1024 * 1024) as usize),
        );
        self.registry.set_strict_dependency_check(new_config.dlc_strict_dependency_check);
        *self.config.write() = new_config;
    }

    /// Spawn the periodic performance monitor: ticks every loaded
    /// DLC's `on_monitor_tick` hook, swallowing any panics at the call
    /// site the way the original swallows hook exceptions at debug
    /// level.
    pub fn start_performance_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let kernel = self.clone();
        let stop = self.monitor_stop.clone();
        let interval = Duration::from_secs_f64(self.config.read().monitoring_interval_secs.max(0.1));
        let handle = self.handle();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                kernel.registry.tick_monitors(&handle);
            }
        })
    }

    /// Discover DLC bundles under the configured search paths, verify
    /// each one's detached signature before it is ever `dlopen`'d, and
    /// hand the successfully-verified, now-instantiated candidates to
    /// the registry's fixed-point resolution loop.
    ///
    /// A bundle that fails signature verification or fails to load is
    /// logged and skipped — one bad bundle must not block the rest of
    /// the directory scan, matching the registry's own per-candidate
    /// failure tolerance.
    pub async fn load_all_dlcs(&self) -> Result<Vec<(String, crate::registry::RegistryError)>> {
        let (search_paths, sig_policy, key_files) = {
            let cfg = self.config.read();
            (
                cfg.dlc_search_paths.clone(),
                crate::signature::SignaturePolicy {
                    required: cfg.dlc_signature_required,
                    verify_if_present: cfg.dlc_signature_verify_if_present,
                },
                cfg.dlc_public_key_pem_files.clone(),
            )
        };

        let trusted_keys = crate::signature::load_public_keys_from_files(&key_files)
            .map_err(|e| KernelError::General(format!("failed to load dlc trust store: {e}")))?;

        let mut candidates = Vec::new();

        for dir in &search_paths {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to scan dlc search path");
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await.transpose() {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DLC_EXTENSION) {
                    continue;
                }

                match crate::signature::verify_bundle_signature(&path, &trusted_keys, sig_policy) {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(bundle = %path.display(), error = %e, "dlc signature verification failed, skipping");
                        continue;
                    }
                }

                // SAFETY: signature verification above already confirmed
                // this bundle is trusted; `load_bundle_entry` is the only
                // call site that `dlopen`s a DLC.
                // `dlc_loaded` is incremented on successful registration
                // (`Registry::register`), not here — a bundle that loads
                // but never resolves its dependencies never registers.
                match unsafe { crate::registry::load_bundle_entry(&path) } {
                    Ok(instance) => candidates.push(instance),
                    Err(e) => {
                        tracing::warn!(bundle = %path.display(), error = %e, "failed to load dlc bundle");
                    }
                }
            }
        }

        Ok(self.registry.load_all(candidates, &self.handle()))
    }

    /// Serialize the live cache to disk, if disk caching is enabled.
    /// Writes via a `.tmp` file then renames, so a crash mid-write
    /// never corrupts the previous snapshot.
    pub async fn save_cache_snapshot(&self) -> Result<()> {
        let (enabled, dir) = {
            let cfg = self.config.read();
            (cfg.enable_disk_cache, cfg.cache_dir.clone())
        };
        if !enabled {
            return Ok(());
        }
        let Some(dir) = dir else { return Ok(()) };

        tokio::fs::create_dir_all(&dir).await?;
        let snapshot = self.cache.snapshot().map_err(|e| KernelError::General(e.to_string()))?;

        let tmp_path = dir.join("result_cache.json.tmp");
        let final_path = dir.join("result_cache.json");
        tokio::fs::write(&tmp_path, snapshot).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    pub async fn load_cache_snapshot(&self) -> Result<usize> {
        let (enabled, dir) = {
            let cfg = self.config.read();
            (cfg.enable_disk_cache, cfg.cache_dir.clone())
        };
        if !enabled {
            return Ok(0);
        }
        let Some(dir) = dir else { return Ok(0) };

        let path = dir.join("result_cache.json");
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        self.cache.restore(&contents).map_err(|e| KernelError::General(e.to_string()))
    }

    /// Tear everything down in reverse construction order: stop the
    /// monitor, shut down every DLC (swallowing individual errors), shut
    /// down the CPU pool, and persist the cache.
    pub async fn shutdown(&self) -> Result<()> {
        self.monitor_stop.cancel();
        if let Some(stop) = self.config_watch_stop.lock().take() {
            stop.cancel();
        }
        if let Some(elector) = self.leader.lock().take() {
            elector.stop();
        }
        self.registry.shutdown_all();
        self.save_cache_snapshot().await?;
        Ok(())
    }
}
