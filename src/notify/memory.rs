//! In-memory notifier that records what it was asked to send.

use super::{Notification, Notifier, NotifyError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Records every successfully sent notification.
///
/// Sends whose subject or body contains one of the configured failure
/// patterns fail with [`NotifyError::Failed`] and are not recorded.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    fail_patterns: Vec<String>,
    attempts: AtomicUsize,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any notification whose subject or body contains `pattern`.
    pub fn failing_on(mut self, pattern: impl Into<String>) -> Self {
        self.fail_patterns.push(pattern.into());
        self
    }

    /// Notifications delivered so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Send attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(pattern) = self
            .fail_patterns
            .iter()
            .find(|p| {
                notification.subject.contains(p.as_str())
                    || notification.body_html.contains(p.as_str())
            })
        {
            return Err(NotifyError::Failed(format!("simulated failure for '{}'", pattern)));
        }

        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(body: &str) -> Notification {
        Notification {
            recipient: "owner@example.com".to_string(),
            sender: "album@example.com".to_string(),
            subject: "New image upload".to_string(),
            body_html: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_and_fails() {
        let notifier = MemoryNotifier::new().failing_on("broken.png");

        notifier.send(&notification("ok.png")).await.unwrap();
        assert!(notifier.send(&notification("broken.png")).await.is_err());

        assert_eq!(notifier.attempts(), 2);
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(notifier.sent()[0].body_html, "ok.png");
    }
}
