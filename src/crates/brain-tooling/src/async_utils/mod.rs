//! Async utilities for common async patterns
//!
//! Retry policy construction lives in `brain-core` (it is a kernel domain
//! concept with its own error taxonomy); this module only carries the
//! generic timeout wrapper shared by every crate in the workspace.
//!
//! # Example
//!
//! ```rust,ignore
//! use brain_tooling::async_utils::timeout::with_timeout;
//! use std::time::Duration;
//!
//! async fn call_with_timeout() -> Result<String, String> {
//!     with_timeout(
//!         Duration::from_secs(30),
//!         async {
//!             // Slow operation
//!             Ok("done".to_string())
//!         }
//!     ).await
//!     .map_err(|e| e.to_string())
//! }
//! ```

pub mod timeout;
