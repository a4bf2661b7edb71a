//! Notifiers deliver best-effort messages about uploads.
//!
//! A [`Notifier`] takes a rendered [`Notification`] and hands it to some
//! transport. The pipeline never retries or redelivers because a notifier
//! failed: handlers log the [`NotifyError`] and move on.
//!
//! ## Built-in Notifiers
//!
//! - [`LogNotifier`]: writes the notification to the log
//! - [`WebhookNotifier`]: HTTP POST of the notification as JSON
//! - [`MemoryNotifier`]: records notifications in memory (tests, demo mode)
//!
//! ## Custom Notifiers
//!
//! ```rust,ignore
//! use shutter::notify::{Notification, Notifier, NotifyError};
//! use async_trait::async_trait;
//!
//! struct SmtpNotifier;
//!
//! #[async_trait]
//! impl Notifier for SmtpNotifier {
//!     fn name(&self) -> &str {
//!         "smtp"
//!     }
//!
//!     async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
//!         // hand the message to the mail relay
//!         Ok(())
//!     }
//! }
//! ```

pub mod log;
pub mod memory;
pub mod template;
pub mod webhook;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use log::LogNotifier;
pub use memory::MemoryNotifier;
pub use template::Addressing;
pub use webhook::WebhookNotifier;

/// Errors that can occur while sending a notification.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The transport did not answer in time
    #[error("notification timed out after {0}ms")]
    Timeout(u64),

    /// HTTP request failed (webhook transport)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport refused the notification
    #[error("notification rejected with status {0}")]
    Rejected(u16),

    /// Generic failure
    #[error("notification failed: {0}")]
    Failed(String),
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub body_html: String,
}

/// Transport for notifications.
///
/// Implementations must be `Send + Sync` to be shared across workers.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs (e.g. "log", "webhook")
    fn name(&self) -> &str;

    /// Deliver one notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}
