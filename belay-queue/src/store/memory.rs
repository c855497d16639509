//! In-process job store (for tests, development and single-process apps).

use super::{JobStore, QueueFilter, QueueStats};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobUpdate, Owner, UpdateOutcome};
use crate::retry::Disposition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    owners: HashMap<Owner, Vec<JobId>>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, id: JobId) -> Option<Job> {
        let entry = self.jobs.remove(&id)?;
        if let Some(owner) = &entry.job.owner
            && let Some(ids) = self.owners.get_mut(owner)
        {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.owners.remove(owner);
            }
        }
        Some(entry.job)
    }
}

/// Job store held in memory behind a single async lock.
///
/// Every operation runs inside one write (or read) section, which makes
/// `claim_next` and the conditional mutations atomic across all tasks in the
/// process. Records do not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of any state.
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: Job) -> QueueResult<JobId> {
        let mut inner = self.inner.write().await;
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some(owner) = &job.owner {
            inner.owners.entry(owner.clone()).or_default().push(id);
        }
        inner.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&id).map(|entry| entry.job.clone()))
    }

    async fn find_by_owner(&self, owner: &Owner) -> QueueResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let jobs = inner
            .owners
            .get(owner)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.jobs.get(id))
                    .map(|entry| entry.job.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(jobs)
    }

    async fn update(
        &self,
        id: JobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> QueueResult<UpdateOutcome> {
        let mut inner = self.inner.write().await;
        let entry = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if !entry.job.is_pending() {
            return Ok(UpdateOutcome::Skipped);
        }
        update.apply(&mut entry.job, now);
        Ok(UpdateOutcome::Applied)
    }

    async fn delete(&self, id: JobId) -> QueueResult<()> {
        self.inner.write().await.remove(id);
        Ok(())
    }

    async fn delete_unclaimed(&self, id: JobId) -> QueueResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get(&id) {
            Some(entry) if entry.job.is_pending() => Ok(inner.remove(id).is_some()),
            _ => Ok(false),
        }
    }

    async fn claim_next(
        &self,
        filter: &QueueFilter,
        worker: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let mut inner = self.inner.write().await;

        let Some(entry) = inner
            .jobs
            .values_mut()
            .filter(|entry| entry.job.is_claimable(now) && filter.matches(&entry.job.queue))
            .min_by_key(|entry| (entry.job.priority, entry.job.run_at, entry.seq))
        else {
            return Ok(None);
        };

        entry.job.locked_at = Some(now);
        entry.job.locked_by = Some(worker.to_string());
        entry.job.lock_token = Some(Uuid::new_v4());
        entry.job.updated_at = now;
        Ok(Some(entry.job.clone()))
    }

    async fn record_failure(
        &self,
        id: JobId,
        worker: &str,
        lock_token: Option<Uuid>,
        error: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        let job = &mut inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?.job;

        if !job.is_held_by(worker, lock_token) {
            return Err(QueueError::ClaimConflict(id));
        }

        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        job.lock_token = None;
        job.updated_at = now;
        match disposition {
            Disposition::Retry { run_at } => job.run_at = run_at,
            Disposition::Fail => job.failed_at = Some(now),
        }
        Ok(())
    }

    async fn unlock_expired(
        &self,
        locked_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<JobId>> {
        let mut inner = self.inner.write().await;
        let mut released = Vec::new();

        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if !job.is_lock_expired(locked_before) {
                continue;
            }

            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.locked_at = None;
            job.locked_by = None;
            job.lock_token = None;
            job.updated_at = now;
            if job.attempts >= job.max_attempts {
                job.failed_at = Some(now);
            }
            released.push(job.id);
        }

        Ok(released)
    }

    async fn failed(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut failed: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|entry| entry.job.is_failed())
            .collect();
        failed.sort_by(|a, b| {
            b.job
                .failed_at
                .cmp(&a.job.failed_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        Ok(failed
            .into_iter()
            .take(limit)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn stats(&self, now: DateTime<Utc>) -> QueueResult<QueueStats> {
        let inner = self.inner.read().await;
        let stats = inner
            .jobs
            .values()
            .fold(QueueStats::default(), |mut stats, entry| {
                let job = &entry.job;
                if job.is_failed() {
                    stats.failed += 1;
                } else if job.is_locked() {
                    stats.locked += 1;
                } else {
                    stats.pending += 1;
                    if job.run_at <= now {
                        stats.due += 1;
                    }
                }
                stats
            });
        Ok(stats)
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        inner.jobs.clear();
        inner.owners.clear();
        Ok(())
    }
}
