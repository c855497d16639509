//! Periodic release of abandoned claims.
//!
//! A worker that dies mid-job leaves its claim behind. The reaper treats any
//! claim older than `lock_timeout` as abandoned, counts the attempt and makes
//! the job claimable again. A slow but live worker can therefore lose its
//! claim, and the job may run twice: handlers should be safe to repeat.

use crate::error::{QueueError, QueueResult};
use crate::job::JobId;
use crate::queue::Queue;
use belay_log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

/// Reaper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Time between sweeps
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Claims older than this are presumed abandoned
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl ReaperConfig {
    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// Background task releasing expired claims.
pub struct Reaper {
    queue: Queue,
    config: ReaperConfig,
    running: Arc<RwLock<bool>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Create a reaper with default configuration.
    pub fn new(queue: Queue) -> Self {
        Self::with_config(queue, ReaperConfig::default())
    }

    /// Create a reaper with custom configuration.
    pub fn with_config(queue: Queue, config: ReaperConfig) -> Self {
        Self {
            queue,
            config,
            running: Arc::new(RwLock::new(false)),
            shutdown: None,
            handle: None,
        }
    }

    /// Reaper configuration.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Release every claim older than the lock timeout, once.
    pub async fn reap_once(&self) -> QueueResult<Vec<JobId>> {
        self.queue.reap_expired(self.config.lock_timeout).await
    }

    /// Start sweeping every `interval`.
    ///
    /// Refuses a lock timeout shorter than the queue's `max_run_time`, which
    /// would release jobs that are still legitimately running.
    pub async fn start(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::WorkerAlreadyRunning);
        }

        let max_run_time = self.queue.config().max_run_time;
        if self.config.lock_timeout < max_run_time {
            return Err(QueueError::Config(format!(
                "lock timeout {:?} is shorter than max run time {:?}",
                self.config.lock_timeout, max_run_time
            )));
        }
        *running = true;
        drop(running);

        info!(
            "Reaper started - interval: {:?}, lock timeout: {:?}",
            self.config.interval, self.config.lock_timeout
        );

        let (tx, mut shutdown) = watch::channel(false);
        self.shutdown = Some(tx);

        let queue = self.queue.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            while !*shutdown.borrow() {
                match queue.reap_expired(config.lock_timeout).await {
                    Ok(released) if !released.is_empty() => {
                        warn!("Reaper released {} abandoned job(s)", released.len());
                    }
                    Ok(_) => debug!("Reaper found no expired claims"),
                    Err(e) => error!("Reaper sweep failed: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop sweeping and wait for the current sweep to finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::WorkerNotRunning);
        }
        *running = false;
        drop(running);

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("Reaper task ended abnormally: {}", e);
        }

        info!("Reaper stopped");
        Ok(())
    }

    /// Check if the reaper is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
