//! Durable delayed-job engine.
//!
//! Provides a job queue with:
//! - ⏰ Jobs scheduled to run no earlier than a given time
//! - 🔗 Polymorphic owners, so the entity that created a job can find,
//!   reschedule or cancel it later
//! - 🔒 Atomic claims: each job runs on at most one worker at a time
//! - 🔄 Retries with pluggable backoff and a per-job attempt budget
//! - 💀 A reaper that releases claims left behind by crashed workers
//! - 📦 In-memory and Redis-backed stores
//!
//! ## Quick Start - Enqueueing
//!
//! ```
//! use belay_queue::{NewJob, Owner, Queue};
//! use chrono::Duration;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> belay_queue::QueueResult<()> {
//! let queue = Queue::in_memory();
//! let owner = Owner::new("Appointment", 42);
//!
//! let id = queue
//!     .enqueue(
//!         NewJob::new("send_reminder", json!({"phone": "+15550100"}))
//!             .owned_by(owner.clone())
//!             .schedule_after(Duration::hours(2)),
//!     )
//!     .await?;
//!
//! let jobs = queue.jobs_for(&owner).await?;
//! assert_eq!(jobs[0].id, id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Rescheduling and Cancelling
//!
//! Only jobs that no worker has claimed are touched; a job already running
//! is left alone.
//!
//! ```
//! use belay_queue::{NewJob, Owner, Queue};
//! use chrono::{Duration, Utc};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> belay_queue::QueueResult<()> {
//! let queue = Queue::in_memory();
//! let owner = Owner::new("Appointment", 42);
//! queue
//!     .enqueue(NewJob::new("send_reminder", json!({})).owned_by(owner.clone()))
//!     .await?;
//!
//! let moved = queue.reschedule(&owner, Utc::now() + Duration::days(1)).await?;
//! assert_eq!(moved, 1);
//!
//! let removed = queue.cancel(&owner).await?;
//! assert_eq!(removed, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Processing
//!
//! ```no_run
//! use belay_queue::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let queue = Queue::redis("redis://localhost:6379").await?;
//!
//!     let mut registry = Registry::new();
//!     registry.register_fn("send_reminder", |job| async move {
//!         println!("reminding {:?}", job.owner);
//!         Ok(())
//!     });
//!
//!     let mut worker = Worker::with_config(
//!         queue.clone(),
//!         registry,
//!         WorkerConfig::default().with_queues(["default"]),
//!     );
//!     worker.start().await?;
//!
//!     let mut reaper = Reaper::new(queue);
//!     reaper.start().await?;
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     worker.stop().await?;
//!     reaper.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod error;
pub mod job;
pub mod notify;
pub mod owner;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, QueueError, QueueResult};
pub use job::{DEFAULT_QUEUE, Job, JobData, JobId, JobUpdate, NewJob, Owner, Payload, UpdateOutcome};
pub use notify::{LogNotifier, MemoryNotifier, Notifier, NotifyError, NotifyResult, SmsMessage};
pub use owner::Scheduled;
pub use queue::{FailureOutcome, Queue, QueueConfig};
pub use reaper::{Reaper, ReaperConfig};
pub use registry::{JobHandler, Perform, Registry};
pub use retry::{Backoff, Disposition, RetryPolicy};
pub use settings::{Settings, SettingsError, StoreSettings};
pub use store::{JobStore, MemoryStore, QueueFilter, QueueStats};
#[cfg(feature = "redis")]
pub use store::{RedisStore, RedisStoreConfig};
pub use worker::{WorkOffReport, Worker, WorkerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{JobError, QueueError, QueueResult};
    pub use crate::job::{Job, JobId, NewJob, Owner};
    pub use crate::owner::Scheduled;
    pub use crate::queue::{Queue, QueueConfig};
    pub use crate::reaper::{Reaper, ReaperConfig};
    pub use crate::registry::{Perform, Registry};
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::worker::{Worker, WorkerConfig};
}
