//! Finding and changing jobs through the entity that created them.
//!
//! These operations race freely with workers: a job may be claimed between
//! the owner lookup and the write. The write itself re-checks the lock state
//! inside the store, so a job that a worker has taken is simply skipped.

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobUpdate, NewJob, Owner, UpdateOutcome};
use crate::queue::Queue;
use belay_log::debug;
use chrono::{DateTime, Utc};

/// Result of [`Queue::schedule_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// This many pending jobs were moved to the new time.
    Rescheduled(usize),
    /// Nothing pending was found, so a new job was enqueued.
    Enqueued(JobId),
}

impl Queue {
    /// Every job of `owner`, in insertion order.
    pub async fn jobs_for(&self, owner: &Owner) -> QueueResult<Vec<Job>> {
        let mut jobs = self.store().find_by_owner(owner).await?;
        jobs.retain(|job| job.is_owned_by(owner));
        Ok(jobs)
    }

    /// Move every pending job of `owner` to `run_at`.
    ///
    /// Claimed and failed jobs are left untouched. Returns how many jobs
    /// were changed.
    pub async fn reschedule(&self, owner: &Owner, run_at: DateTime<Utc>) -> QueueResult<usize> {
        let update = JobUpdate::run_at(run_at);
        let mut updated = 0;

        for job in self.jobs_for(owner).await? {
            if !job.is_pending() {
                continue;
            }

            match self.store().update(job.id, &update, self.now()).await {
                Ok(UpdateOutcome::Applied) => updated += 1,
                Ok(UpdateOutcome::Skipped) => {
                    debug!("Job {} was claimed before it could be rescheduled", job.id);
                }
                Err(QueueError::NotFound(id)) => {
                    debug!("Job {} vanished before it could be rescheduled", id);
                }
                Err(e) => return Err(e),
            }
        }

        debug!("Rescheduled {} job(s) of {} to {}", updated, owner, run_at);
        Ok(updated)
    }

    /// Delete every pending job of `owner`.
    ///
    /// Jobs already executing are not interrupted. Returns how many jobs were
    /// removed.
    pub async fn cancel(&self, owner: &Owner) -> QueueResult<usize> {
        let mut removed = 0;

        for job in self.jobs_for(owner).await? {
            if job.is_pending() && self.store().delete_unclaimed(job.id).await? {
                removed += 1;
            }
        }

        debug!("Cancelled {} job(s) of {}", removed, owner);
        Ok(removed)
    }

    /// Move the pending jobs of `owner` to `run_at`, or enqueue `job` there
    /// if none were moved.
    pub async fn schedule_for(
        &self,
        owner: &Owner,
        run_at: DateTime<Utc>,
        job: NewJob,
    ) -> QueueResult<Scheduled> {
        let updated = self.reschedule(owner, run_at).await?;
        if updated > 0 {
            return Ok(Scheduled::Rescheduled(updated));
        }

        let id = self
            .enqueue(job.owned_by(owner.clone()).schedule_at(run_at))
            .await?;
        Ok(Scheduled::Enqueued(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::QueueFilter;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn queue() -> Queue {
        Queue::in_memory().with_clock(Arc::new(ManualClock::new(t0())))
    }

    fn reminder(owner: &Owner) -> NewJob {
        NewJob::new("remind", json!({"phone": "+15550100"}))
            .owned_by(owner.clone())
            .schedule_after(Duration::hours(2))
    }

    #[tokio::test]
    async fn test_reschedule_moves_only_run_at() {
        let queue = queue();
        let owner = Owner::new("Appointment", 1);
        let id = queue.enqueue(reminder(&owner).with_priority(3)).await.unwrap();
        let before = queue.get(id).await.unwrap().unwrap();

        let count = queue.reschedule(&owner, t0() + Duration::hours(5)).await.unwrap();
        assert_eq!(count, 1);

        let after = queue.get(id).await.unwrap().unwrap();
        assert_eq!(after.run_at, t0() + Duration::hours(5));
        assert_eq!(after.priority, before.priority);
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.queue, before.queue);
        assert_eq!(after.attempts, before.attempts);
        assert_eq!(after.owner, before.owner);
    }

    #[tokio::test]
    async fn test_reschedule_skips_claimed_job() {
        let queue = queue();
        let owner = Owner::new("Appointment", 1);
        let id = queue
            .enqueue(NewJob::new("remind", json!({})).owned_by(owner.clone()))
            .await
            .unwrap();
        queue.claim("w1", &QueueFilter::any()).await.unwrap().unwrap();

        let count = queue.reschedule(&owner, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(queue.get(id).await.unwrap().unwrap().run_at, t0());
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_jobs_only() {
        let queue = queue();
        let owner = Owner::new("Appointment", 1);
        let running = queue
            .enqueue(NewJob::new("remind", json!({})).owned_by(owner.clone()))
            .await
            .unwrap();
        queue.claim("w1", &QueueFilter::any()).await.unwrap().unwrap();
        queue.enqueue(reminder(&owner)).await.unwrap();
        queue.enqueue(reminder(&owner)).await.unwrap();

        assert_eq!(queue.cancel(&owner).await.unwrap(), 2);

        let left = queue.jobs_for(&owner).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, running);
    }

    #[tokio::test]
    async fn test_owners_with_shared_separator_are_distinct() {
        let queue = queue();
        let left = Owner::new("A:B", "C");
        let right = Owner::new("A", "B:C");
        let left_id = queue.enqueue(reminder(&left)).await.unwrap();
        let right_id = queue.enqueue(reminder(&right)).await.unwrap();

        assert_eq!(queue.reschedule(&left, t0() + Duration::hours(9)).await.unwrap(), 1);
        assert_eq!(queue.get(right_id).await.unwrap().unwrap().run_at, t0() + Duration::hours(2));

        assert_eq!(queue.cancel(&right).await.unwrap(), 1);
        assert!(queue.get(left_id).await.unwrap().is_some());
        assert!(queue.jobs_for(&right).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_without_jobs() {
        let queue = queue();
        let owner = Owner::new("Appointment", 404);
        assert!(queue.jobs_for(&owner).await.unwrap().is_empty());
        assert_eq!(queue.reschedule(&owner, t0()).await.unwrap(), 0);
        assert_eq!(queue.cancel(&owner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schedule_for_creates_then_moves() {
        let queue = queue();
        let owner = Owner::new("Appointment", 7);
        let job = NewJob::new("remind", json!({}));

        let first = queue
            .schedule_for(&owner, t0() + Duration::hours(1), job.clone())
            .await
            .unwrap();
        let Scheduled::Enqueued(id) = first else {
            panic!("expected a new job, got {:?}", first);
        };

        let second = queue
            .schedule_for(&owner, t0() + Duration::hours(3), job)
            .await
            .unwrap();
        assert_eq!(second, Scheduled::Rescheduled(1));

        let jobs = queue.jobs_for(&owner).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].run_at, t0() + Duration::hours(3));
    }
}
