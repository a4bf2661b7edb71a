//! Log Notifier - notifications written to the structured log.
//!
//! Useful in development, where no mail relay or webhook is available.

use super::{Notification, Notifier, NotifyError};
use async_trait::async_trait;
use tracing::info;

/// A notifier that logs each notification with `tracing`.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    /// Prefix for log messages
    prefix: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            prefix: "notify".to_string(),
        }
    }

    /// Create a LogNotifier with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            prefix = %self.prefix,
            recipient = %notification.recipient,
            sender = %notification.sender,
            subject = %notification.subject,
            body_len = notification.body_html.len(),
            "[{}] {} -> {}",
            self.prefix,
            notification.subject,
            notification.recipient
        );
        Ok(())
    }
}
