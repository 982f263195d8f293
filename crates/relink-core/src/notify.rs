//! User-visible notifications.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// A notification could not be delivered.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The notification backend is unavailable.
    #[error("Notification backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the notification.
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Destination for user-facing notifications.
///
/// Callers never wait on delivery; implementations may be slow.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification.
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        info!(title, body, "Notification");
        Ok(())
    }
}

/// Records notifications in memory.
#[cfg(any(test, feature = "mock-radio"))]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(any(test, feature = "mock-radio"))]
impl RecordingNotifier {
    /// Every `(title, body)` delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(any(test, feature = "mock-radio"))]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}
