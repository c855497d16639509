//! Outbound notifications sent from inside jobs.
//!
//! Delivery providers fail transiently all the time. A [`NotifyError`]
//! converts into a [`JobError`] that keeps that distinction, so a handler
//! can write `notifier.send(&msg).await?` and let the retry policy decide.

use crate::error::JobError;
use async_trait::async_trait;
use belay_log::info;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Result type for notification delivery.
pub type NotifyResult<T> = Result<T, NotifyError>;

/// A text message to a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    /// Recipient in E.164 form
    pub to: String,
    /// Message body
    pub body: String,
}

impl SmsMessage {
    /// Create a message.
    pub fn new(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: body.into(),
        }
    }
}

/// Delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// Rate limited.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// The recipient cannot receive messages.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Authentication error.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider rejected the message.
    #[error("Provider error: {0}")]
    Provider(String),
}

impl NotifyError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::RateLimited(_))
    }
}

impl From<NotifyError> for JobError {
    fn from(err: NotifyError) -> Self {
        if err.is_retryable() {
            JobError::Retryable(err.to_string())
        } else {
            JobError::Permanent(err.to_string())
        }
    }
}

/// Message delivery provider.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message.
    async fn send(&self, message: &SmsMessage) -> NotifyResult<()>;
}

/// Notifier that only writes messages to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &SmsMessage) -> NotifyResult<()> {
        info!("SMS to {}: {}", message.to, message.body);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sent: Vec<SmsMessage>,
    failures: Vec<NotifyError>,
}

/// Notifier that records messages, for tests.
///
/// Queued failures are returned (oldest first) before anything is recorded.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    state: Mutex<MemoryState>,
}

impl MemoryNotifier {
    /// Create a notifier that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` sends fail with `error`.
    pub fn fail_next(&self, times: usize, error: NotifyError) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .failures
            .extend(std::iter::repeat_n(error, times));
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<SmsMessage> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sent
            .clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, message: &SmsMessage) -> NotifyResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        state.sent.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(NotifyError::Network("reset".into()).is_retryable());
        assert!(NotifyError::Timeout.is_retryable());
        assert!(NotifyError::RateLimited(30).is_retryable());
        assert!(!NotifyError::InvalidRecipient("+1".into()).is_retryable());
        assert!(!NotifyError::Auth("bad token".into()).is_retryable());
    }

    #[test]
    fn test_conversion_to_job_error() {
        let err: JobError = NotifyError::Timeout.into();
        assert_eq!(err, JobError::retryable("Operation timed out"));

        let err: JobError = NotifyError::InvalidRecipient("+1".into()).into();
        assert!(!err.is_retryable());
        assert!(err.detail().contains("+1"));
    }

    #[tokio::test]
    async fn test_memory_notifier_fails_then_records() {
        let notifier = MemoryNotifier::new();
        notifier.fail_next(2, NotifyError::Network("connection reset".into()));
        let message = SmsMessage::new("+15550100", "See you at 3pm");

        assert!(notifier.send(&message).await.is_err());
        assert!(notifier.send(&message).await.is_err());
        assert!(notifier.sent().is_empty());

        notifier.send(&message).await.unwrap();
        assert_eq!(notifier.sent(), vec![message]);
    }

    #[tokio::test]
    async fn test_log_notifier() {
        let message = SmsMessage::new("+15550100", "hello");
        assert!(LogNotifier.send(&message).await.is_ok());
    }
}
