//! Single-key adaptive throttler.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use super::bucket::TokenBucket;
use crate::config::RateConfig;

/// Whether blocking waits on a throttler are still honoured.
///
/// The only transition is `Active` to `Cancelled`, and it is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Waits block until a token is available
    Active,
    /// Waits return immediately without consuming a token
    Cancelled,
}

/// Admission control for a single key.
///
/// The rate starts at `starting_rate` and moves between `lower_bound` and
/// `upper_bound` in steps of `increment` and `decrement`. Adjustments are
/// serialized by a per-throttler lock that blocked waiters never hold, so
/// `incr` and `decr` make progress while other tasks sit in `wait`.
#[derive(Debug)]
pub struct Throttler {
    /// Admission state; safe to use without the adjustment lock
    bucket: TokenBucket,
    lower_bound: u64,
    upper_bound: u64,
    increment: u64,
    decrement: u64,
    /// Live rate, guarded for the duration of each adjustment
    current_limit: Mutex<u64>,
    wait_state: watch::Sender<WaitState>,
}

impl Throttler {
    /// Create a throttler from a rate template.
    pub fn new(config: &RateConfig) -> Self {
        let (wait_state, _) = watch::channel(WaitState::Active);

        Self {
            bucket: TokenBucket::new(config.starting_rate, config.burst),
            lower_bound: config.lower_bound,
            upper_bound: config.upper_bound,
            increment: config.increment,
            decrement: config.decrement,
            current_limit: Mutex::new(config.starting_rate),
            wait_state,
        }
    }

    /// Wait until an event may proceed.
    ///
    /// Returns once a token has been consumed, or immediately without one if
    /// waits on this throttler have been cancelled. The two outcomes are not
    /// distinguished.
    pub async fn wait(&self) {
        let mut state = self.wait_state.subscribe();

        tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == WaitState::Cancelled) => {}
            _ = self.bucket.acquire() => {}
        }
    }

    /// Release all current and future waits. Calling it again does nothing.
    pub fn cancel_wait(&self) {
        self.cancel();
    }

    /// Move to `Cancelled`. Returns `true` only for the call that made the transition.
    pub(crate) fn cancel(&self) -> bool {
        self.wait_state.send_if_modified(|state| match *state {
            WaitState::Cancelled => false,
            WaitState::Active => {
                *state = WaitState::Cancelled;
                true
            }
        })
    }

    /// Whether waits on this throttler have been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.wait_state.borrow() == WaitState::Cancelled
    }

    /// Try to admit one event without blocking.
    ///
    /// Returns `false` and consumes a token when the event may proceed, so
    /// every call that returns `false` counts against the rate.
    pub fn is_throttled(&self) -> bool {
        let throttled = !self.bucket.try_acquire();
        if throttled {
            trace!(limit = self.bucket.limit(), "Admission throttled");
        }
        throttled
    }

    /// Raise the rate by `increment`, capped at `upper_bound`.
    pub fn incr(&self) {
        let mut current = self.current_limit.lock();
        if *current == self.upper_bound {
            return;
        }

        let previous = *current;
        *current = current.saturating_add(self.increment);
        if *current >= self.upper_bound {
            *current = self.upper_bound;
        }

        self.bucket.set_limit(*current);
        trace!(previous, current = *current, "Rate increased");
    }

    /// Lower the rate by `decrement`.
    ///
    /// Once the result is at or below `decrement` the rate snaps to
    /// `lower_bound`, even if the plain subtraction would have stayed above it.
    pub fn decr(&self) {
        let mut current = self.current_limit.lock();
        if *current == self.lower_bound {
            return;
        }

        let previous = *current;
        *current = current.saturating_sub(self.decrement);
        if *current <= self.decrement {
            *current = self.lower_bound;
        }

        self.bucket.set_limit(*current);
        trace!(previous, current = *current, "Rate decreased");
    }

    /// The live rate in events per second.
    pub fn current_limit(&self) -> u64 {
        *self.current_limit.lock()
    }

    /// The rate the token bucket is refilling at.
    pub fn limit(&self) -> u64 {
        self.bucket.limit()
    }

    pub fn burst(&self) -> u64 {
        self.bucket.burst()
    }
}
