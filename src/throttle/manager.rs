//! Multi-key throttler registry.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::throttler::Throttler;
use crate::config::RateConfig;

/// Keeps one [`Throttler`] per key, all built from the same [`RateConfig`].
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Throttlers are created on first use of a key and live as long as the
/// manager. Distinct keys never contend on a common lock.
///
/// Every per-key operation accepts a borrowed key, so a `Manager<String>`
/// is driven with `&str`.
#[derive(Debug)]
pub struct Manager<K = String>
where
    K: Eq + Hash,
{
    /// Template for every new throttler
    config: RateConfig,
    /// Throttlers indexed by key; entries are never removed
    throttlers: DashMap<K, Arc<Throttler>>,
}

impl<K> Manager<K>
where
    K: Eq + Hash,
{
    /// Create a manager. No throttler exists until a key is first used.
    pub fn new(config: RateConfig) -> Self {
        if !config.has_valid_bounds() {
            debug!(
                starting_rate = config.starting_rate,
                lower_bound = config.lower_bound,
                upper_bound = config.upper_bound,
                "Starting rate is outside its bounds"
            );
        }

        Self {
            config,
            throttlers: DashMap::new(),
        }
    }

    /// The template new throttlers are built from.
    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Wait until an event for `key` may proceed, or until waits on `key`
    /// are cancelled.
    pub async fn wait<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.throttler(key).wait().await
    }

    /// Release the current wait for `key` and make every later wait on it
    /// return immediately. Usually called during shutdown.
    pub fn cancel_wait<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        if self.throttler(key).cancel() {
            debug!(key = ?key, "Cancelled waits for key");
        }
    }

    /// Check whether `key` is throttled right now.
    ///
    /// A `false` result uses up one event of the key's rate: with a limit of
    /// 2 per second, one unthrottled check leaves room for one more event
    /// until tokens refill.
    pub fn is_throttled<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.throttler(key).is_throttled()
    }

    /// Raise the rate of `key` by the configured increment. Typically called
    /// after a successful operation.
    pub fn incr<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.throttler(key).incr()
    }

    /// Lower the rate of `key` by the configured decrement. Typically called
    /// after a failed operation.
    pub fn decr<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.throttler(key).decr()
    }

    /// Get the throttler for `key`, creating it if this is the first use.
    ///
    /// Concurrent first uses of the same key all receive the same instance.
    pub fn throttler<Q>(&self, key: &Q) -> Arc<Throttler>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(throttler) = self.throttlers.get(key) {
            return Arc::clone(throttler.value());
        }

        let entry = self.throttlers.entry(key.to_owned()).or_insert_with(|| {
            debug!(
                key = ?key,
                starting_rate = self.config.starting_rate,
                burst = self.config.burst,
                "Creating new throttler"
            );
            Arc::new(Throttler::new(&self.config))
        });
        Arc::clone(entry.value())
    }

    /// The live rate of `key`, or `None` if the key has not been used.
    pub fn current_limit<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.throttlers.get(key).map(|t| t.current_limit())
    }

    /// Whether a throttler exists for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.throttlers.contains_key(key)
    }

    /// Get the number of keys with a throttler.
    pub fn len(&self) -> usize {
        self.throttlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttlers.is_empty()
    }
}

impl<K> Default for Manager<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new(RateConfig::default())
    }
}

impl<K> From<RateConfig> for Manager<K>
where
    K: Eq + Hash,
{
    fn from(config: RateConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manager_creation() {
        let manager: Manager = Manager::new(RateConfig::default());
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_is_throttled_allows_requests_up_to_starting_rate_per_key() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 1,
            burst: 1,
            ..Default::default()
        });

        assert!(!manager.is_throttled("key"));
        assert!(manager.is_throttled("key"));

        assert!(!manager.is_throttled("new key"));
    }

    #[test]
    fn test_incr_increments_limit_per_key() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 0,
            burst: 1,
            increment: 1,
            upper_bound: 3,
            ..Default::default()
        });

        for expected in [0, 1, 2, 3, 3, 3] {
            assert_eq!(manager.throttler("key").limit(), expected);
            manager.incr("key");
        }
    }

    #[test]
    fn test_decr_decrements_limit_per_key() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 3,
            burst: 1,
            decrement: 1,
            lower_bound: 1,
            ..Default::default()
        });

        for expected in [3, 2, 1, 1, 1] {
            assert_eq!(manager.throttler("key").limit(), expected);
            manager.decr("key");
        }
    }

    #[tokio::test]
    async fn test_cancel_wait_per_key() {
        // Allows no request.
        let manager: Arc<Manager> = Arc::new(Manager::new(RateConfig::default()));

        tokio::spawn({
            let manager = manager.clone();
            async move { manager.cancel_wait("key") }
        });

        tokio::time::timeout(Duration::from_secs(5), manager.wait("key"))
            .await
            .expect("wait should return once the key is cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wait_does_not_affect_other_keys() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 0,
            burst: 1,
            increment: 1,
            upper_bound: 1,
            ..Default::default()
        });

        manager.cancel_wait("stopped");
        manager.wait("stopped").await;

        assert!(!manager.throttler("running").is_cancelled());
        let blocked = tokio::time::timeout(Duration::from_secs(1), manager.wait("running")).await;
        assert!(blocked.is_err(), "an uncancelled key at zero rate should block");
    }

    #[test]
    fn test_different_keys_have_separate_rates() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 5,
            burst: 1,
            lower_bound: 1,
            upper_bound: 10,
            increment: 2,
            decrement: 1,
        });

        manager.incr("a");
        manager.decr("b");

        assert_eq!(manager.current_limit("a"), Some(7));
        assert_eq!(manager.current_limit("b"), Some(4));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_observers_do_not_create_throttlers() {
        let manager: Manager = Manager::default();

        assert_eq!(manager.current_limit("unseen"), None);
        assert!(!manager.contains_key("unseen"));
        assert!(manager.is_empty());

        manager.is_throttled("seen");
        assert!(manager.contains_key("seen"));
        assert_eq!(manager.current_limit("seen"), Some(0));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_throttler_is_reused_for_a_key() {
        let manager: Manager = Manager::from(RateConfig::default());

        let first = manager.throttler("key");
        let second = manager.throttler("key");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_throttler() {
        let manager: Manager = Manager::new(RateConfig {
            starting_rate: 0,
            burst: 1,
            increment: 1,
            upper_bound: 100,
            ..Default::default()
        });
        let barrier = std::sync::Barrier::new(16);

        let throttlers: Vec<Arc<Throttler>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        manager.incr("fresh");
                        manager.throttler("fresh")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(manager.len(), 1);
        assert!(throttlers.iter().all(|t| Arc::ptr_eq(t, &throttlers[0])));
        // Every incr landed on the same instance.
        assert_eq!(manager.current_limit("fresh"), Some(16));
    }

    #[test]
    fn test_generic_keys() {
        let manager: Manager<u32> = Manager::new(RateConfig {
            starting_rate: 1,
            burst: 1,
            ..Default::default()
        });

        assert!(!manager.is_throttled(&7u32));
        assert!(manager.is_throttled(&7u32));
        assert!(!manager.is_throttled(&8u32));
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn capture<F: FnOnce()>(level: tracing::Level, f: F) -> CapturedLogs {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        logs
    }

    #[test]
    fn test_cancel_wait_logs_once_with_key() {
        let manager: Manager = Manager::default();

        let logs = capture(tracing::Level::DEBUG, || {
            manager.cancel_wait("host-a");
            manager.cancel_wait("host-a");
        });

        let cancelled: Vec<_> = logs
            .lines()
            .into_iter()
            .filter(|line| line.contains("ancelled"))
            .collect();
        assert_eq!(cancelled.len(), 1, "{:?}", cancelled);
        assert!(cancelled[0].contains("host-a"));
    }

    #[test]
    fn test_out_of_bounds_config_is_not_reported_as_warning() {
        let logs = capture(tracing::Level::INFO, || {
            let manager: Manager = Manager::new(RateConfig {
                starting_rate: 3,
                burst: 1,
                decrement: 1,
                lower_bound: 1,
                ..Default::default()
            });
            manager.decr("key");
        });

        assert!(logs.lines().is_empty(), "{:?}", logs.lines());
    }

    #[test]
    fn test_config_accessor() {
        let config = RateConfig {
            starting_rate: 4,
            upper_bound: 8,
            ..Default::default()
        };
        let manager: Manager = Manager::new(config.clone());
        assert_eq!(manager.config(), &config);
    }
}
