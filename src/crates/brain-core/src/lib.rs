//! Compute kernel for the Brain pluggable task-execution runtime
//!
//! `brain-core` owns the pieces a single kernel process wires together:
//! a bounded result [`cache`], a backoff [`retry`] engine, bundle
//! [`signature`] verification, [`manifest`] parsing and dependency
//! resolution, the [`registry`] of loaded DLC bundles (each handed a
//! narrow [`handle`] rather than a reference to the kernel), a
//! hot-reloadable [`config_source`], optional [`observability`] hooks,
//! an optional [`leader`] election lease, and the [`kernel`] scheduler
//! that ties them together behind `Kernel::compute`.

pub mod cache;
pub mod config_source;
pub mod handle;
pub mod kernel;
pub mod leader;
pub mod manifest;
pub mod observability;
pub mod registry;
pub mod retry;
pub mod signature;

use thiserror::Error;

/// Errors that can occur anywhere in the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error(transparent)]
    Retry(#[from] retry::RetryError),

    #[error(transparent)]
    Signature(#[from] signature::SignatureError),

    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),

    #[error(transparent)]
    Registry(#[from] registry::RegistryError),

    #[error(transparent)]
    Config(#[from] config_source::ConfigError),

    #[error(transparent)]
    Leader(#[from] leader::LeaderError),

    #[error("task execution failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kernel error: {0}")]
    General(String),
}

/// Result type used throughout the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Get version information.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
