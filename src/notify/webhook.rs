//! Webhook Notifier - HTTP POST of notifications to a mail relay.
//!
//! The [`WebhookNotifier`] sends each notification as JSON to an HTTP
//! endpoint, typically a small relay in front of the mail provider.
//!
//! # Payload
//!
//! ```json
//! {
//!   "recipient": "owner@example.com",
//!   "sender": "album@example.com",
//!   "subject": "New image upload",
//!   "bodyHtml": "<html>…</html>"
//! }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use shutter::notify::WebhookNotifier;
//! use std::time::Duration;
//!
//! let notifier = WebhookNotifier::new("https://relay.internal/send")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use super::{Notification, Notifier, NotifyError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for webhook requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

/// Delay before the first retry; doubles on every further retry
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Exponential backoff before retry number `retry` (1-based), capped at 32x.
fn backoff(base: Duration, retry: u32) -> Duration {
    base * (1u32 << retry.saturating_sub(1).min(5))
}

/// A notifier that POSTs notifications to an HTTP endpoint.
///
/// Server errors and transport errors are retried; client errors are not.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    /// Target URL for the webhook
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Number of retries on 5xx errors
    retries: u32,

    /// Base delay between attempts
    retry_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = backoff(self.retry_delay, attempt);
                debug!(
                    attempt = attempt,
                    max_retries = self.retries,
                    backoff_ms = delay.as_millis() as u64,
                    "Retrying webhook notification"
                );
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(notification)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        info!(
                            url = %self.url,
                            status = %status,
                            recipient = %notification.recipient,
                            subject = %notification.subject,
                            "Notification delivered"
                        );
                        return Ok(());
                    }

                    if status.is_client_error() {
                        warn!(status = %status, url = %self.url, "Webhook refused notification");
                        return Err(NotifyError::Rejected(status.as_u16()));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempt,
                        "Webhook returned server error"
                    );
                    last_error = Some(NotifyError::Rejected(status.as_u16()));
                }
                Err(e) if e.is_timeout() => {
                    warn!(url = %self.url, attempt = attempt, "Webhook request timed out");
                    last_error = Some(NotifyError::Timeout(self.timeout.as_millis() as u64));
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt = attempt, "Webhook request failed");
                    last_error = Some(NotifyError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NotifyError::Failed("no attempt made".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_builder() {
        let notifier = WebhookNotifier::new("https://relay.example.com/send")
            .with_timeout(Duration::from_secs(3))
            .with_retries(4);

        assert_eq!(notifier.url(), "https://relay.example.com/send");
        assert_eq!(notifier.timeout, Duration::from_secs(3));
        assert_eq!(notifier.retries, 4);
        assert_eq!(notifier.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(notifier.name(), "webhook");
    }

    #[test]
    fn test_payload_shape() {
        let notification = Notification {
            recipient: "owner@example.com".to_string(),
            sender: "album@example.com".to_string(),
            subject: "New image upload".to_string(),
            body_html: "<p>hi</p>".to_string(),
        };

        let payload = serde_json::to_value(&notification).unwrap();
        assert_eq!(payload["recipient"], "owner@example.com");
        assert_eq!(payload["bodyHtml"], "<p>hi</p>");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/send")
            .with_timeout(Duration::from_millis(500))
            .with_retries(0);
        let notification = Notification {
            recipient: "a@example.com".to_string(),
            sender: "b@example.com".to_string(),
            subject: "s".to_string(),
            body_html: String::new(),
        };

        assert!(notifier.send(&notification).await.is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(200);
        assert_eq!(backoff(base, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 2), Duration::from_millis(400));
        assert_eq!(backoff(base, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 6), Duration::from_millis(6400));
        assert_eq!(backoff(base, 20), Duration::from_millis(6400));
    }

    #[tokio::test]
    async fn test_retries_wait_between_attempts() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/send")
            .with_timeout(Duration::from_millis(500))
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(50));
        let notification = Notification {
            recipient: "a@example.com".to_string(),
            sender: "b@example.com".to_string(),
            subject: "s".to_string(),
            body_html: String::new(),
        };

        let started = std::time::Instant::now();
        assert!(notifier.send(&notification).await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
