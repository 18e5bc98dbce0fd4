use std::path::PathBuf;

use tracing::info;

use crate::error::{DrpError, Result};

/// Sender and recipients of summary emails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailSettings {
    pub sender: String,
    pub recipients: Vec<String>,
}

impl EmailSettings {
    /// Both a sender and at least one recipient, or neither.
    pub fn from_parts(sender: Option<&str>, recipients: &[String]) -> Result<Option<Self>> {
        let recipients: Vec<String> = recipients
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        match (sender.map(str::trim).filter(|s| !s.is_empty()), recipients.is_empty()) {
            (None, true) => Ok(None),
            (Some(sender), false) => Ok(Some(Self {
                sender: sender.to_string(),
                recipients,
            })),
            (sender, _) => Err(DrpError::Config(format!(
                "To send emails both a sender and a recipient are required \
                 (sender: {sender:?}, recipients: {recipients:?})"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

/// Delivers summary emails.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            from = %message.sender,
            to = %message.recipients.join(", "),
            subject = %message.subject,
            attachments = message.attachments.len(),
            "{}",
            message.body
        );
        Ok(())
    }
}
