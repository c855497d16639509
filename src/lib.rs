// Belay - a durable delayed-job queue for Rust
//
// This library schedules work to run later, lets the entity that created a
// job find and change it, and guarantees each job runs on one worker at a time.

// Re-export the engine
pub use belay_queue::*;

// Re-export logging
pub use belay_log;

/// Prelude for common imports.
///
/// ```
/// use belay::prelude::*;
/// ```
pub mod prelude {
    pub use belay_log::{debug, error, info, trace, warn};
    pub use belay_queue::prelude::*;
    pub use belay_queue::{Notifier, QueueFilter, SmsMessage};
}
