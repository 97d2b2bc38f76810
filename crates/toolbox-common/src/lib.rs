//! # Toolbox Common
//!
//! Shared plumbing for the toolbox workspace: logging configuration and
//! retry/backoff utilities.
//!
//! Each crate in the workspace carries its own error enum; this crate only
//! holds the pieces that are genuinely cross-cutting.

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryConfig};
