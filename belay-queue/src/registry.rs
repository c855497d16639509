//! Registered job kinds and their handlers.
//!
//! A stored job names its kind and carries serialized arguments; workers
//! only run kinds registered here at startup.

use crate::error::JobError;
use crate::job::{DEFAULT_QUEUE, Job, NewJob};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>> + Send + Sync>;

/// A typed unit of work.
///
/// The value itself is the job's arguments: it is serialized at enqueue and
/// deserialized by the worker before `perform` runs. Handlers may run more
/// than once for the same job (after a reaped claim), so `perform` should be
/// safe to repeat.
///
/// ```
/// use async_trait::async_trait;
/// use belay_queue::{JobError, Perform};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Cleanup {
///     older_than_days: u32,
/// }
///
/// #[async_trait]
/// impl Perform for Cleanup {
///     const KIND: &'static str = "cleanup";
///     type Context = ();
///
///     async fn perform(&self, _ctx: &()) -> Result<(), JobError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Perform: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registered kind name
    const KIND: &'static str;

    /// Shared state handed to every execution (clients, pools, settings)
    type Context: Send + Sync + 'static;

    /// Queue the job is routed to.
    fn queue_name(&self) -> &str {
        DEFAULT_QUEUE
    }

    /// Priority override; `None` uses the queue default.
    fn priority(&self) -> Option<i32> {
        None
    }

    /// Attempt budget override; `None` uses the retry policy.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Do the work.
    async fn perform(&self, ctx: &Self::Context) -> Result<(), JobError>;
}

impl NewJob {
    /// Describe a typed unit of work as a new job.
    pub fn from_perform<J: Perform>(work: &J) -> Result<Self, serde_json::Error> {
        let mut job = NewJob::new(J::KIND, serde_json::to_value(work)?).on_queue(work.queue_name());
        if let Some(priority) = work.priority() {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = work.max_attempts() {
            job = job.with_max_attempts(max_attempts);
        }
        Ok(job)
    }
}

/// Maps job kinds to handlers.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, JobHandler>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed unit of work with its context.
    pub fn register<J: Perform>(&mut self, ctx: J::Context) -> &mut Self {
        let ctx = Arc::new(ctx);
        let handler: JobHandler = Arc::new(
            move |job: Job| -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>> {
                let ctx = Arc::clone(&ctx);
                Box::pin(async move {
                    let work: J = serde_json::from_value(job.payload.args)?;
                    work.perform(ctx.as_ref()).await
                })
            },
        );

        self.handlers.insert(J::KIND.to_string(), handler);
        self
    }

    /// Register a closure for `kind`.
    ///
    /// ```
    /// use belay_queue::Registry;
    ///
    /// let mut registry = Registry::new();
    /// registry.register_fn("ping", |job| async move {
    ///     println!("ping {}", job.id);
    ///     Ok(())
    /// });
    /// assert!(registry.contains("ping"));
    /// ```
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let wrapped: JobHandler = Arc::new(
            move |job: Job| -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>> {
                Box::pin(handler(job))
            },
        );

        self.handlers.insert(kind.into(), wrapped);
        self
    }

    /// Handler for `kind`.
    pub fn get(&self, kind: &str) -> Option<JobHandler> {
        self.handlers.get(kind).cloned()
    }

    /// Whether `kind` has a handler.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `job`'s kind.
    ///
    /// An unregistered kind is a permanent failure.
    pub async fn dispatch(&self, job: Job) -> Result<(), JobError> {
        match self.get(&job.payload.kind) {
            Some(handler) => handler(job).await,
            None => Err(JobError::permanent(format!(
                "no handler registered for job kind '{}'",
                job.payload.kind
            ))),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
