//! Rendering of confirmation and rejection notifications.

use super::Notification;
use serde::{Deserialize, Serialize};

pub const CONFIRMATION_SUBJECT: &str = "New image upload";
pub const REJECTION_SUBJECT: &str = "Image upload rejected";

/// Display name shown as the sender in every notification body.
pub const SENDER_NAME: &str = "The Photo Album";

/// Who notifications go to, who they come from, and the bucket uploads live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub recipient: String,
    pub sender: String,
    pub source_bucket: String,
}

impl Addressing {
    pub fn new(
        recipient: impl Into<String>,
        sender: impl Into<String>,
        source_bucket: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            sender: sender.into(),
            source_bucket: source_bucket.into(),
        }
    }

    /// `s3://<bucket>/<key>`
    pub fn object_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.source_bucket, key)
    }
}

/// Notification telling the owner an image was accepted.
pub fn confirmation(addressing: &Addressing, key: &str) -> Notification {
    let message = format!(
        "We received your Image. Its URL is {}",
        addressing.object_url(key)
    );
    render(addressing, CONFIRMATION_SUBJECT, &message)
}

/// Notification telling the owner an upload was turned away.
pub fn rejection(addressing: &Addressing, key: &str, reason: &str) -> Notification {
    let message = format!(
        "Your upload {} was rejected: {}",
        addressing.object_url(key),
        reason
    );
    render(addressing, REJECTION_SUBJECT, &message)
}

fn render(addressing: &Addressing, subject: &str, message: &str) -> Notification {
    let body_html = format!(
        r#"<html>
  <body>
    <h2>Sent from: </h2>
    <ul>
      <li style="font-size:18px">👤 <b>{name}</b></li>
      <li style="font-size:18px">✉️ <b>{email}</b></li>
    </ul>
    <p style="font-size:18px">{message}</p>
  </body>
</html>
"#,
        name = escape_html(SENDER_NAME),
        email = escape_html(&addressing.sender),
        message = escape_html(message),
    );

    Notification {
        recipient: addressing.recipient.clone(),
        sender: addressing.sender.clone(),
        subject: subject.to_string(),
        body_html,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
