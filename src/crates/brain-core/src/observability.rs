//! Metrics and tracing hooks that are safe no-ops when disabled.
//!
//! Ported from `brain_system/observability.py`'s `Observability`
//! dataclass and `NullSpan`/`start_span` pattern: every counter and
//! histogram is an `Option`, and recording through a disabled
//! `Observability` is simply a no-op rather than a branch the caller
//! has to remember to take.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// A monotonic counter, present only when metrics are enabled.
#[derive(Default)]
struct Counter(Mutex<u64>);

impl Counter {
    fn incr(&self) {
        *self.0.lock() += 1;
    }

    fn get(&self) -> u64 {
        *self.0.lock()
    }
}

/// A minimal latency histogram: count, sum, and a running max, enough
/// to support the kernel's rolling-average stat without pulling in a
/// full metrics crate the donor doesn't already depend on.
#[derive(Default)]
struct Histogram {
    count: Mutex<u64>,
    sum: Mutex<Duration>,
}

impl Histogram {
    fn observe(&self, value: Duration) {
        *self.count.lock() += 1;
        *self.sum.lock() += value;
    }

    fn mean(&self) -> Duration {
        let count = *self.count.lock();
        if count == 0 {
            Duration::ZERO
        } else {
            *self.sum.lock() / count as u32
        }
    }
}

/// Observability sinks wired into the kernel. Disabled fields are
/// simply absent; every recording method below degrades to a no-op
/// when its backing sink is `None`.
///
/// `task_seconds`/`task_errors` are keyed by task id, matching the
/// `task_seconds{task_id}` / `task_errors_total{task_id}` metric
/// contract — every other counter here is a single process-wide total.
pub struct Observability {
    metrics_enabled: bool,
    tracing_enabled: bool,
    task_seconds: Option<Mutex<HashMap<String, Histogram>>>,
    task_errors: Option<Mutex<HashMap<String, Counter>>>,
    cache_hits: Option<Counter>,
    cache_misses: Option<Counter>,
    dlc_loaded: Option<Counter>,
}

impl Observability {
    pub fn new(metrics_enabled: bool, tracing_enabled: bool) -> Self {
        Self {
            metrics_enabled,
            tracing_enabled,
            task_seconds: metrics_enabled.then(|| Mutex::new(HashMap::new())),
            task_errors: metrics_enabled.then(|| Mutex::new(HashMap::new())),
            cache_hits: metrics_enabled.then(Counter::default),
            cache_misses: metrics_enabled.then(Counter::default),
            dlc_loaded: metrics_enabled.then(Counter::default),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, false)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    pub fn tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    pub fn record_task_seconds(&self, task_id: &str, elapsed: Duration) {
        if let Some(map) = &self.task_seconds {
            map.lock().entry(task_id.to_string()).or_default().observe(elapsed);
        }
    }

    pub fn record_task_error(&self, task_id: &str) {
        if let Some(map) = &self.task_errors {
            map.lock().entry(task_id.to_string()).or_default().incr();
        }
    }

    pub fn record_cache_hit(&self) {
        if let Some(counter) = &self.cache_hits {
            counter.incr();
        }
    }

    pub fn record_cache_miss(&self) {
        if let Some(counter) = &self.cache_misses {
            counter.incr();
        }
    }

    pub fn record_dlc_loaded(&self) {
        if let Some(counter) = &self.dlc_loaded {
            counter.incr();
        }
    }

    pub fn mean_task_seconds(&self, task_id: &str) -> Duration {
        self.task_seconds
            .as_ref()
            .and_then(|map| map.lock().get(task_id).map(Histogram::mean))
            .unwrap_or_default()
    }

    pub fn task_error_count(&self, task_id: &str) -> u64 {
        self.task_errors
            .as_ref()
            .and_then(|map| map.lock().get(task_id).map(Counter::get))
            .unwrap_or(0)
    }

    pub fn snapshot_counters(&self) -> HashMap<&'static str, u64> {
        let mut out = HashMap::new();
        if let Some(c) = &self.task_errors {
            out.insert("task_errors", c.get());
        }
        if let Some(c) = &self.cache_hits {
            out.insert("cache_hits", c.get());
        }
        if let Some(c) = &self.cache_misses {
            out.insert("cache_misses", c.get());
        }
        if let Some(c) = &self.dlc_loaded {
            out.insert("dlc_loaded", c.get());
        }
        out
    }

    /// Start a tracing span for `name` if tracing is enabled; returns a
    /// guard that is a harmless no-op to drop either way.
    pub fn start_span(&self, name: &str) -> tracing::span::EnteredSpan {
        if self.tracing_enabled {
            tracing::info_span!("brain_task", task = %name).entered()
        } else {
            tracing::Span::none().entered()
        }
    }
}

impl Default for Observability {
    fn default() -> Self {
        Self::disabled()
    }
}
