//! Throttler - Adaptive Admission Rate Control
//!
//! This crate decides, per logical key (for example a remote host), how many
//! operations per second may proceed. Each key owns a token bucket whose rate
//! is raised or lowered by caller feedback via `incr` and `decr`, always kept
//! within the configured bounds.

pub mod config;
pub mod error;
pub mod throttle;

pub use config::RateConfig;
pub use error::{Result, ThrottleError};
pub use throttle::{Manager, Throttler, TokenBucket, WaitState};
