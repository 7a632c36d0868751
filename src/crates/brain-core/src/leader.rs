//! Optional leader-election lease with TTL renewal.
//!
//! Ported from `brain_system/ha.py`'s `LeaderElector`: a background
//! loop that tries to acquire a lock when not leader, extends it when
//! already leader, and demotes to non-leader on any failure rather
//! than propagating an error — a stuck lock service should degrade the
//! kernel to a passive replica, not crash it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, LeaderError>;

/// Abstraction over a distributed lock service (e.g. Redis `SET NX
/// PX` / `redlock`). Implementations are expected to be cheap to
/// clone (an `Arc` handle to a connection pool).
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Attempt to acquire the lock without blocking. Returns `true` on
    /// success.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Extend an already-held lock's TTL. Returns `true` if the lock
    /// was still held by us.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock if held by us.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Configuration for the leader election background task.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lock_key: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_key: "brain:leader".to_string(),
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs_f64(3.0),
        }
    }
}

/// Current leadership status, read concurrently by the scheduler and
/// written only by the elector's background task.
pub struct LeaderState {
    is_leader: AtomicBool,
}

impl LeaderState {
    fn new() -> Self {
        Self {
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn set(&self, value: bool) {
        self.is_leader.store(value, Ordering::SeqCst);
    }
}

/// Runs the acquire-or-renew loop against a [`LockBackend`] until
/// stopped.
pub struct LeaderElector {
    config: LeaderElectionConfig,
    backend: Arc<dyn LockBackend>,
    state: Arc<LeaderState>,
    stop: CancellationToken,
}

impl LeaderElector {
    pub fn new(config: LeaderElectionConfig, backend: Arc<dyn LockBackend>) -> Self {
        Self {
            config,
            backend,
            state: Arc::new(LeaderState::new()),
            stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> Arc<LeaderState> {
        self.state.clone()
    }

    /// Spawn the background acquire/renew loop. Returns a join handle;
    /// call [`LeaderElector::stop`] to end it.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let backend = self.backend.clone();
        let state = self.state.clone();
        let stop = self.stop.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(config.renew_interval) => {}
                }

                let outcome = if state.is_leader() {
                    backend.renew(&config.lock_key, config.ttl).await
                } else {
                    backend.try_acquire(&config.lock_key, config.ttl).await
                };

                match outcome {
                    Ok(holds_lock) => state.set(holds_lock),
                    Err(e) => {
                        tracing::warn!(error = %e, "leader election backend failed, demoting");
                        state.set(false);
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}
