//! Per-key throttling state and the registry that owns it.

mod bucket;
mod manager;
mod throttler;

pub use bucket::TokenBucket;
pub use manager::Manager;
pub use throttler::{Throttler, WaitState};
