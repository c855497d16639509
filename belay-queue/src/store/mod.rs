//! Job record stores.
//!
//! A [`JobStore`] is the only coordination point between workers: every
//! method is a single atomic step against the persisted state, and no store
//! lock is held while a job executes. The claim itself lives in the record's
//! `locked_at` / `locked_by` fields.

use crate::error::QueueResult;
use crate::job::{Job, JobId, JobUpdate, Owner, UpdateOutcome};
use crate::retry::Disposition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Which queues a worker serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    queues: Vec<String>,
}

impl QueueFilter {
    /// Serve every queue.
    pub fn any() -> Self {
        Self::default()
    }

    /// Serve only the named queues. An empty list serves every queue.
    pub fn only<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether jobs on `queue` pass the filter.
    pub fn matches(&self, queue: &str) -> bool {
        self.queues.is_empty() || self.queues.iter().any(|q| q == queue)
    }

    /// The named queues; empty means all.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }
}

/// Counts of records by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Neither claimed nor failed
    pub pending: u64,
    /// Pending and runnable now
    pub due: u64,
    /// Claimed by a worker
    pub locked: u64,
    /// Permanently failed
    pub failed: u64,
}

/// Persistence contract for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new, unclaimed job.
    async fn insert(&self, job: Job) -> QueueResult<JobId>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Every job referencing exactly `owner`, oldest first. Empty when none match.
    async fn find_by_owner(&self, owner: &Owner) -> QueueResult<Vec<Job>>;

    /// Apply `update` if the job is still pending.
    ///
    /// Fails with `NotFound` if the id no longer exists. Returns
    /// [`UpdateOutcome::Skipped`] without writing if the job is claimed or
    /// failed; the check and the write are one atomic step.
    async fn update(&self, id: JobId, update: &JobUpdate, now: DateTime<Utc>)
    -> QueueResult<UpdateOutcome>;

    /// Remove a job. Removing a missing id is not an error.
    async fn delete(&self, id: JobId) -> QueueResult<()>;

    /// Remove a job only if it is pending. Returns whether it was removed.
    async fn delete_unclaimed(&self, id: JobId) -> QueueResult<bool>;

    /// Select the best claimable job on `filter` and lock it for `worker`.
    ///
    /// Candidates satisfy `run_at <= now`, unlocked, not failed, queue in
    /// `filter`; the lowest `(priority, run_at)` wins, insertion order breaks
    /// remaining ties. Selection and locking are one atomic step, and the
    /// returned record carries a fresh `lock_token`. Returns `None` without
    /// blocking when nothing is claimable.
    async fn claim_next(
        &self,
        filter: &QueueFilter,
        worker: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>>;

    /// Record a failed attempt by the worker holding the claim.
    ///
    /// Increments `attempts`, sets `last_error`, clears the lock, then either
    /// moves `run_at` ([`Disposition::Retry`]) or sets `failed_at`
    /// ([`Disposition::Fail`]). Fails with `NotFound` if the job is gone and
    /// `ClaimConflict` unless both `worker` and `lock_token` match the
    /// current claim. A worker whose claim was reaped and that later claims
    /// the same job again under the same name holds a new token.
    async fn record_failure(
        &self,
        id: JobId,
        worker: &str,
        lock_token: Option<Uuid>,
        error: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Release claims taken at or before `locked_before`.
    ///
    /// Each released job has the abandoned attempt counted and `error`
    /// recorded; a job whose budget is spent becomes failed instead.
    /// Returns the released ids.
    async fn unlock_expired(
        &self,
        locked_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>>;

    /// Failed jobs, most recently failed first.
    async fn failed(&self, limit: usize) -> QueueResult<Vec<Job>>;

    /// Counts by state.
    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats>;

    /// Remove every record.
    async fn clear(&self) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = QueueFilter::any();
        assert!(filter.matches("default"));
        assert!(filter.matches("sms"));

        let filter = QueueFilter::only(Vec::<String>::new());
        assert!(filter.matches("anything"));
    }

    #[test]
    fn test_named_filter() {
        let filter = QueueFilter::only(["sms", "mail"]);
        assert!(filter.matches("sms"));
        assert!(filter.matches("mail"));
        assert!(!filter.matches("default"));
        assert_eq!(filter.queues().len(), 2);
    }
}
