//! Cross-process task debouncing
//!
//! A [`TaskCoordinator`] answers "should this periodic task run now?" for
//! every worker consuming the same change stream. Exactly one caller wins
//! per interval window, no matter how many processes ask.
//!
//! ## Two tiers
//!
//! - **Local**: last-run timestamps observed by this process. Checked first
//!   so that a call per incoming document never reaches the shared cache
//!   while the window is known to be closed. Expired entries are pruned on
//!   every access.
//! - **Shared**: a [`SharedCache`] entry per task holding the winner's run
//!   time, created with an atomic add-if-absent whose TTL is the interval.
//!
//! ```rust,ignore
//! let coordinator = TaskCoordinator::new("ucr-bootstrap", Duration::from_secs(3600), cache);
//! if coordinator.should_run("cases").await? {
//!     manager.bootstrap(None).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{chrono_duration, Clock, SystemClock};
use crate::error::Result;
use crate::store::SharedCache;

/// Default slack added when judging whether a shared record is stale,
/// covering TTL rounding in the backing cache
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(1);

/// Rate limiter for periodic tasks shared by many workers
pub struct TaskCoordinator {
    name: String,
    interval: Duration,
    buffer: Duration,
    local: Mutex<HashMap<String, DateTime<Utc>>>,
    shared: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
}

impl TaskCoordinator {
    /// Create a coordinator; `name` namespaces its keys in the shared cache
    pub fn new(name: impl Into<String>, interval: Duration, shared: Arc<dyn SharedCache>) -> Self {
        Self {
            name: name.into(),
            interval,
            buffer: DEFAULT_EXPIRY_BUFFER,
            local: Mutex::new(HashMap::new()),
            shared,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a custom clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the staleness buffer
    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Coordinator name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Shared cache key for a task
    pub fn cache_key(&self, task_key: &str) -> String {
        format!("last-task-run:{}:{}", self.name, task_key)
    }

    /// Decide whether `task_key` should run now.
    ///
    /// Returns `true` for exactly one caller per interval window across all
    /// coordinators sharing the cache.
    ///
    /// # Panics
    ///
    /// Panics if the shared cache still holds an expired record after it was
    /// deleted and the add retried. That means the cache broke its
    /// add-if-absent contract.
    pub async fn should_run(&self, task_key: &str) -> Result<bool> {
        if self.interval.is_zero() {
            return Ok(true);
        }

        let now = self.clock.now();
        if let Some(last_run) = self.local_last_run(task_key, now) {
            debug!(coordinator = %self.name, task = task_key, %last_run, "window closed locally");
            return Ok(false);
        }

        let key = self.cache_key(task_key);
        let mut retried = false;
        loop {
            let now = self.clock.now();
            if self.shared.add(&key, &now.to_rfc3339(), self.interval).await? {
                self.local.lock().insert(task_key.to_string(), now);
                debug!(coordinator = %self.name, task = task_key, "won run slot");
                return Ok(true);
            }

            let recorded = self
                .shared
                .get(&key)
                .await?
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|ts| ts.with_timezone(&Utc));

            if let Some(last_run) = recorded {
                let window_end = last_run
                    .checked_add_signed(chrono_duration(self.interval + self.buffer))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                if window_end > now {
                    self.local.lock().insert(task_key.to_string(), last_run);
                    return Ok(false);
                }
            }

            // Either the record vanished between add and get, or it outlived
            // its interval (the interval was shortened after it was written).
            assert!(
                !retried,
                "shared cache kept an expired run record for {} after delete",
                key
            );
            warn!(coordinator = %self.name, task = task_key, "clearing stale run record");
            self.shared.delete(&key).await?;
            retried = true;
        }
    }

    /// Forget the last run so the next `should_run` call may win immediately
    pub async fn reset(&self, task_key: &str) -> Result<()> {
        self.local.lock().remove(task_key);
        self.shared.delete(&self.cache_key(task_key)).await
    }

    fn local_last_run(&self, task_key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = chrono_duration(self.interval);
        let mut local = self.local.lock();
        local.retain(|_, last_run| {
            last_run
                .checked_add_signed(interval)
                .map_or(false, |end| end > now)
        });
        local.get(task_key).copied()
    }
}

impl std::fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinator")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn setup(interval: u64) -> (Arc<ManualClock>, Arc<MemoryStore>, TaskCoordinator) {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let coordinator = TaskCoordinator::new("test", Duration::from_secs(interval), store.clone())
            .with_clock(clock.clone());
        (clock, store, coordinator)
    }

    #[tokio::test]
    async fn test_local_fast_path_skips_shared_cache() {
        let (_clock, store, coordinator) = setup(5);
        assert!(coordinator.should_run("job").await.unwrap());

        // Even with the shared record gone, the local tier keeps the window closed
        SharedCache::delete(store.as_ref(), &coordinator.cache_key("job"))
            .await
            .unwrap();
        assert!(!coordinator.should_run("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_shared_record_is_replaced() {
        let (clock, store, coordinator) = setup(5);

        // Record written long ago without a TTL, as if the interval were longer then
        store
            .add(&coordinator.cache_key("job"), &clock.now().to_rfc3339(), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        assert!(coordinator.should_run("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_interval_always_runs() {
        let (_clock, _store, coordinator) = setup(0);
        assert!(coordinator.should_run("job").await.unwrap());
        assert!(coordinator.should_run("job").await.unwrap());
    }

    #[test]
    fn test_cache_key_format() {
        let (_clock, _store, coordinator) = setup(5);
        assert_eq!(coordinator.cache_key("job-A"), "last-task-run:test:job-A");
    }
}
