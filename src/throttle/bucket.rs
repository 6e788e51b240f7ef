//! Token bucket implementation.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Slack for float drift when a waiter wakes exactly at its refill deadline.
const TOKEN_EPSILON: f64 = 1e-6;

/// A token bucket whose rate can be changed while it is in use.
///
/// Tokens accrue at `limit` per second up to `burst`, and the bucket starts
/// full. A limit or burst of zero admits nothing.
///
/// Blocking acquisitions are served one at a time in arrival order. The
/// waiter at the head of the queue reserves its token up front, driving the
/// balance negative, so non-blocking checks stay throttled until that
/// reservation has been paid off by refills. The head waiter is woken early
/// whenever the rate changes so it can re-time its reservation.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill state, held only for short non-async sections
    state: Mutex<BucketState>,
    /// Fair queue of blocked acquirers
    queue: tokio::sync::Mutex<()>,
    /// Signalled on every rate change
    rate_changed: Notify,
}

#[derive(Debug)]
struct BucketState {
    limit: u64,
    burst: u64,
    /// Negative while a reservation is outstanding
    tokens: f64,
    last: Instant,
}

/// Where the head waiter stands after inspecting the bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Turn {
    /// The reservation is paid off
    Ready,
    /// The reservation is paid off after this delay at the current rate
    After(Duration),
    /// No token accrues at the current settings
    Parked,
}

impl BucketState {
    /// Credit tokens earned since the last refill at the current rate.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last);
        if now > self.last {
            self.last = now;
        }

        let earned = elapsed.as_secs_f64() * self.limit as f64;
        self.tokens = f64::min(self.burst as f64, self.tokens + earned);
    }

    fn admits(&self) -> bool {
        self.limit > 0 && self.burst > 0
    }

    /// Take one token if a whole one is available now.
    fn take(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.admits() && self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Claim the next token, even if it has not accrued yet.
    fn reserve(&mut self, now: Instant) -> bool {
        self.refill(now);

        if !self.admits() {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    /// Return an unpaid reservation.
    fn unreserve(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = f64::min(self.burst as f64, self.tokens + 1.0);
    }

    /// How far an outstanding reservation is from being paid off.
    fn turn(&mut self, now: Instant) -> Turn {
        self.refill(now);

        if self.tokens + TOKEN_EPSILON >= 0.0 {
            Turn::Ready
        } else if self.limit == 0 {
            Turn::Parked
        } else {
            Turn::After(Duration::from_secs_f64(-self.tokens / self.limit as f64))
        }
    }
}

/// A token claimed by the head waiter. Handed back if dropped before it is paid off.
struct Reservation<'a> {
    bucket: &'a TokenBucket,
    outstanding: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.outstanding {
            self.bucket.state.lock().unreserve(Instant::now());
        }
    }
}

impl TokenBucket {
    /// Create a full bucket refilling at `limit` tokens per second.
    pub fn new(limit: u64, burst: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                limit,
                burst,
                tokens: burst as f64,
                last: Instant::now(),
            }),
            queue: tokio::sync::Mutex::new(()),
            rate_changed: Notify::new(),
        }
    }

    /// Consume a token if one is available right now.
    ///
    /// Returns `true` if a token was consumed. Tokens reserved by a blocked
    /// acquirer are not available.
    pub fn try_acquire(&self) -> bool {
        self.state.lock().take(Instant::now())
    }

    /// Wait until a token has been consumed.
    ///
    /// Dropping the future before it completes consumes nothing; a token
    /// already reserved for it is returned to the bucket.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        let mut reservation = Reservation {
            bucket: self,
            outstanding: false,
        };

        loop {
            let changed = self.rate_changed.notified();
            tokio::pin!(changed);
            // Register before inspecting the state so a concurrent rate change is not missed.
            changed.as_mut().enable();

            let turn = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if !reservation.outstanding {
                    reservation.outstanding = state.reserve(now);
                }
                if reservation.outstanding {
                    state.turn(now)
                } else {
                    Turn::Parked
                }
            };

            match turn {
                Turn::Ready => {
                    reservation.outstanding = false;
                    return;
                }
                Turn::After(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = changed.as_mut() => {}
                    }
                }
                Turn::Parked => changed.await,
            }
        }
    }

    /// Replace the refill rate. Tokens earned so far are kept, and an
    /// outstanding reservation is re-timed at the new rate.
    pub fn set_limit(&self, limit: u64) {
        {
            let mut state = self.state.lock();
            state.refill(Instant::now());
            state.limit = limit;
        }
        self.rate_changed.notify_waiters();
    }

    /// Current refill rate in tokens per second.
    pub fn limit(&self) -> u64 {
        self.state.lock().limit
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u64 {
        self.state.lock().burst
    }
}
