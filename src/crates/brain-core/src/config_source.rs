//! Hot-reloadable configuration sources.
//!
//! Mirrors `brain_system/config.py`'s `ConfigSource` abstraction: a
//! `FileConfigSource` polls a file's mtime on a background task and
//! fires a listener on change, while a `KvConfigSource` stands in for
//! the original's Consul long-poll source behind the same trait, so
//! the kernel's hot-reconfiguration path (`Kernel::apply_config_update`)
//! doesn't care which backend is in play.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A source of configuration bytes that can optionally be watched for
/// changes.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load the current configuration as raw bytes (YAML, by
    /// convention, to match the kernel's on-disk config format).
    async fn load(&self) -> Result<Vec<u8>>;

    /// Start a background watch, sending each new snapshot to `tx`
    /// whenever the source changes. Returns a token the caller can
    /// cancel to stop the watch.
    fn start_watch(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>, poll_interval: Duration) -> CancellationToken;
}

/// Polls a file's mtime on an interval and re-reads it on change.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    fn start_watch(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>, poll_interval: Duration) -> CancellationToken {
        let stop = CancellationToken::new();
        let stop_clone = stop.clone();

        tokio::spawn(async move {
            let mut last_mtime: Option<SystemTime> = None;

            loop {
                tokio::select! {
                    _ = stop_clone.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let mtime = match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(error = %e, "config file stat failed, skipping poll");
                        continue;
                    }
                };

                if last_mtime == Some(mtime) {
                    continue;
                }
                last_mtime = Some(mtime);

                match self.load().await {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to reload changed config file"),
                }
            }
        });

        stop
    }
}

/// A long-poll key-value backend (e.g. Consul), abstracted the way the
/// original `ConsulConfigSource` wraps a blocking-index HTTP wait.
#[async_trait]
pub trait KvLongPoll: Send + Sync {
    /// Block (up to an implementation-defined timeout) for the next
    /// change after `since_index`, returning the new value and index.
    async fn wait_for_change(&self, since_index: u64) -> Result<(Vec<u8>, u64)>;

    async fn get(&self) -> Result<(Vec<u8>, u64)>;
}

pub struct KvConfigSource<B: KvLongPoll> {
    backend: Arc<B>,
}

impl<B: KvLongPoll> KvConfigSource<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: KvLongPoll + 'static> ConfigSource for KvConfigSource<B> {
    async fn load(&self) -> Result<Vec<u8>> {
        Ok(self.backend.get().await?.0)
    }

    fn start_watch(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>, _poll_interval: Duration) -> CancellationToken {
        let stop = CancellationToken::new();
        let stop_clone = stop.clone();

        tokio::spawn(async move {
            let mut index = match self.backend.get().await {
                Ok((_, idx)) => idx,
                Err(_) => 0,
            };

            loop {
                if stop_clone.is_cancelled() {
                    break;
                }

                match self.backend.wait_for_change(index).await {
                    Ok((bytes, new_index)) => {
                        index = new_index;
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "kv long-poll failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_config_source_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, b"a: 1\n").await.unwrap();

        let source = Arc::new(FileConfigSource::new(&path));
        let (tx, mut rx) = mpsc::channel(4);
        let stop = source.clone().start_watch(tx, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::fs::write(&path, b"a: 2\n").await.unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("should receive an update before timing out")
            .expect("channel should not be closed");

        assert_eq!(update, b"a: 2\n");
        stop.cancel();
    }

    #[tokio::test]
    async fn test_file_config_source_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, b"x: true\n").await.unwrap();

        let source = FileConfigSource::new(&path);
        assert_eq!(source.load().await.unwrap(), b"x: true\n");
    }

    struct CountingKv {
        index: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl KvLongPoll for CountingKv {
        async fn wait_for_change(&self, since_index: u64) -> Result<(Vec<u8>, u64)> {
            let next = since_index + 1;
            self.index.store(next, std::sync::atomic::Ordering::SeqCst);
            Ok((format!("v{next}").into_bytes(), next))
        }

        async fn get(&self) -> Result<(Vec<u8>, u64)> {
            let idx = self.index.load(std::sync::atomic::Ordering::SeqCst);
            Ok((format!("v{idx}").into_bytes(), idx))
        }
    }

    #[tokio::test]
    async fn test_kv_config_source_watch_fires_on_change() {
        let backend = Arc::new(CountingKv {
            index: std::sync::atomic::AtomicU64::new(0),
        });
        let source = Arc::new(KvConfigSource::new(backend));
        let (tx, mut rx) = mpsc::channel(4);
        let stop = source.start_watch(tx, Duration::from_millis(1));

        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("should receive an update")
            .expect("channel open");

        assert_eq!(update, b"v1");
        stop.cancel();
    }
}
