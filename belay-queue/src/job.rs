//! Job records and the builders that create and change them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Serialized job arguments.
pub type JobData = serde_json::Value;

/// Queue used when neither the job nor the configuration names one.
pub const DEFAULT_QUEUE: &str = "default";

/// Polymorphic reference to the entity that created a job.
///
/// A type tag plus an opaque identifier. The engine never dereferences it;
/// it only stores it and matches on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Entity kind, e.g. `"Appointment"`
    pub owner_type: String,
    /// Entity identifier within its kind
    pub owner_id: String,
}

impl Owner {
    /// Create an owner reference.
    pub fn new(owner_type: impl Into<String>, owner_id: impl ToString) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id: owner_id.to_string(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner_type, self.owner_id)
    }
}

/// What to run: a registered job kind and its serialized arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Registered handler name
    pub kind: String,
    /// Arguments handed to the handler
    pub args: JobData,
}

impl Payload {
    /// Create a payload.
    pub fn new(kind: impl Into<String>, args: JobData) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

/// A stored unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Work to perform
    pub payload: Payload,

    /// Entity that created the job, if any
    pub owner: Option<Owner>,

    /// Queue name used for worker routing
    pub queue: String,

    /// Lower values are claimed first
    pub priority: i32,

    /// The job must not be claimed before this instant
    pub run_at: DateTime<Utc>,

    /// When a worker claimed the job
    pub locked_at: Option<DateTime<Utc>>,

    /// Name of the worker holding the claim
    pub locked_by: Option<String>,

    /// Unique to one claim; a failure report must present it
    pub lock_token: Option<Uuid>,

    /// Execution attempts recorded so far
    pub attempts: u32,

    /// Attempt budget before the job is marked failed
    pub max_attempts: u32,

    /// Most recent failure detail
    pub last_error: Option<String>,

    /// Set once the job is permanently abandoned
    pub failed_at: Option<DateTime<Utc>>,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a worker currently holds the job.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the job was permanently abandoned.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Neither claimed nor failed: owner operations may still change it.
    pub fn is_pending(&self) -> bool {
        !self.is_locked() && !self.is_failed()
    }

    /// Whether a worker may claim the job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.run_at <= now
    }

    /// Whether the job belongs to `owner`.
    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    /// Whether `worker` holds the claim identified by `token`.
    pub fn is_held_by(&self, worker: &str, token: Option<Uuid>) -> bool {
        token.is_some() && self.locked_by.as_deref() == Some(worker) && self.lock_token == token
    }

    /// Whether the claim was taken at or before `cutoff`.
    pub fn is_lock_expired(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(self.locked_at, Some(locked_at) if locked_at <= cutoff)
    }

    /// Whether another attempt fits in the budget once the current one is counted.
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum When {
    Now,
    At(DateTime<Utc>),
    After(Duration),
}

/// Builder for a job that has not been enqueued yet.
///
/// Fields left unset are filled from the queue configuration at enqueue time.
///
/// ```
/// use belay_queue::{NewJob, Owner};
/// use chrono::Duration;
/// use serde_json::json;
///
/// let job = NewJob::new("send_reminder", json!({"phone": "+15550100"}))
///     .owned_by(Owner::new("Appointment", 42))
///     .on_queue("sms")
///     .with_priority(-5)
///     .schedule_after(Duration::hours(2));
///
/// assert_eq!(job.payload().kind, "send_reminder");
/// assert_eq!(job.owner(), Some(&Owner::new("Appointment", 42)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    payload: Payload,
    owner: Option<Owner>,
    queue: Option<String>,
    priority: Option<i32>,
    when: When,
    max_attempts: Option<u32>,
}

impl NewJob {
    /// Create a job of `kind` with `args`.
    pub fn new(kind: impl Into<String>, args: JobData) -> Self {
        Self::from_payload(Payload::new(kind, args))
    }

    /// Create a job from an existing payload.
    pub fn from_payload(payload: Payload) -> Self {
        Self {
            payload,
            owner: None,
            queue: None,
            priority: None,
            when: When::Now,
            max_attempts: None,
        }
    }

    /// Attach the owning entity.
    pub fn owned_by(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Route to a named queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the priority (lower runs first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Do not run before `time`.
    pub fn schedule_at(mut self, time: DateTime<Utc>) -> Self {
        self.when = When::At(time);
        self
    }

    /// Do not run before `delay` has passed, measured on the queue clock at enqueue.
    pub fn schedule_after(mut self, delay: Duration) -> Self {
        self.when = When::After(delay);
        self
    }

    /// The work to perform.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The owning entity, if set.
    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    /// Materialize the record, filling defaults.
    pub(crate) fn build(
        self,
        default_queue: &str,
        default_priority: i32,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Job {
        let run_at = match self.when {
            When::Now => now,
            When::At(time) => time,
            When::After(delay) => now + delay,
        };

        Job {
            id: Uuid::new_v4(),
            payload: self.payload,
            owner: self.owner,
            queue: self.queue.unwrap_or_else(|| default_queue.to_string()),
            priority: self.priority.unwrap_or(default_priority),
            run_at,
            locked_at: None,
            locked_by: None,
            lock_token: None,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            last_error: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a pending job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// New earliest run time
    pub run_at: Option<DateTime<Utc>>,
    /// New priority
    pub priority: Option<i32>,
    /// New queue
    pub queue: Option<String>,
}

impl JobUpdate {
    /// Update that only moves the run time.
    pub fn run_at(time: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(time),
            ..Self::default()
        }
    }

    /// Also change the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Also move to another queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.run_at.is_none() && self.priority.is_none() && self.queue.is_none()
    }

    pub(crate) fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(run_at) = self.run_at {
            job.run_at = run_at;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(queue) = &self.queue {
            job.queue = queue.clone();
        }
        job.updated_at = now;
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The pending job was changed.
    Applied,
    /// The job is claimed or failed and was left untouched.
    Skipped,
}
