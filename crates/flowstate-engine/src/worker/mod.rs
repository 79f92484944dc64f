//! Worker: the three periodic loops that drive executions
//!
//! - **dispatch** drains the queue and runs one state per claimed row
//! - **wake** releases Wait steps whose deadline has passed
//! - **reap** rescues steps whose worker died mid-flight
//!
//! Any number of [`Worker`] instances may run against the same store across
//! processes; coordination happens entirely through the store's row locks.

pub mod dispatch;
pub mod reap;
pub mod wake;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::store::ExecutionStore;
use crate::task::TaskRegistry;

pub use dispatch::run_dispatch_once;
pub use reap::run_reap_once;
pub use wake::run_wake_once;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Claim limit per dispatch poll
    pub batch_size: i64,

    /// Dispatch poll interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Wake loop interval
    #[serde(with = "duration_millis")]
    pub wake_interval: Duration,

    /// Reap loop interval
    #[serde(with = "duration_millis")]
    pub reap_interval: Duration,

    /// How long a RUNNING step may go untouched before it is reaped
    #[serde(with = "duration_millis")]
    pub stuck_step_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(1000),
            wake_interval: Duration::from_millis(10_000),
            reap_interval: Duration::from_millis(300_000),
            stuck_step_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_stuck_step_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_step_timeout = timeout;
        self
    }

    /// Read overrides from `FLOWSTATE_WORKER_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok()?.parse().ok()
        }

        let defaults = Self::default();
        Self {
            batch_size: env_u64("FLOWSTATE_WORKER_BATCH_SIZE")
                .map(|v| v as i64)
                .unwrap_or(defaults.batch_size),
            poll_interval: env_u64("FLOWSTATE_WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            wake_interval: env_u64("FLOWSTATE_WORKER_WAKE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.wake_interval),
            reap_interval: env_u64("FLOWSTATE_WORKER_REAP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reap_interval),
            stuck_step_timeout: env_u64("FLOWSTATE_WORKER_STUCK_TIMEOUT_MINUTES")
                .map(|minutes| Duration::from_secs(minutes * 60))
                .unwrap_or(defaults.stuck_step_timeout),
        }
    }
}

/// Owns the background loops for one process
pub struct Worker {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            registry,
            clock,
            config,
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatch, wake and reap loops.
    pub fn start(&self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting workflow worker"
        );
        let mut handles = self.handles.lock().unwrap();
        handles.push(self.spawn_dispatch_loop());
        handles.push(self.spawn_wake_loop());
        handles.push(self.spawn_reap_loop());
    }

    /// Signal the loops to stop and wait for them to exit.
    pub async fn shutdown(&self) {
        info!("stopping workflow worker");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let clock = Arc::clone(&self.clock);
        let batch_size = self.config.batch_size;
        let interval = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match run_dispatch_once(store.as_ref(), &registry, clock.as_ref(), batch_size).await {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "dispatch poll consumed queue items"),
                            // Loops never die: the transaction rolled back,
                            // the rows stay claimable, we try again next tick.
                            Err(e) => error!("dispatch poll failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("dispatch loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_wake_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let batch_size = self.config.batch_size;
        let interval = self.config.wake_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = run_wake_once(store.as_ref(), clock.as_ref(), batch_size).await {
                            error!("wake poll failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("wake loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reap_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let batch_size = self.config.batch_size;
        let interval = self.config.reap_interval;
        let stuck_timeout = chrono::Duration::from_std(self.config.stuck_step_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = run_reap_once(store.as_ref(), clock.as_ref(), stuck_timeout, batch_size).await {
                            error!("reap poll failed: {e}");
                        }
                        // Idempotency-key expiry rides on the reap cadence.
                        if let Err(e) = store.purge_expired_idempotency_keys(clock.now()).await {
                            error!("idempotency key purge failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reap loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.wake_interval, Duration::from_millis(10_000));
        assert_eq!(config.reap_interval, Duration::from_millis(300_000));
        assert_eq!(config.stuck_step_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn config_builders() {
        let config = WorkerConfig::new()
            .with_batch_size(25)
            .with_poll_interval(Duration::from_millis(250))
            .with_wake_interval(Duration::from_secs(2))
            .with_reap_interval(Duration::from_secs(60))
            .with_stuck_step_timeout(Duration::from_secs(120));

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.wake_interval, Duration::from_secs(2));
        assert_eq!(config.reap_interval, Duration::from_secs(60));
        assert_eq!(config.stuck_step_timeout, Duration::from_secs(120));
    }

    #[test]
    fn batch_size_is_clamped_to_at_least_one() {
        let config = WorkerConfig::new().with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = WorkerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: WorkerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
