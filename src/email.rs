//! Out-of-band email delivery.
//!
//! Messages are handed to an `EmailSender` only after the transaction that
//! produced them has committed. Delivery runs on the blocking pool and its
//! failures are logged, never returned to the request that triggered them.
//!
//! The default sender for local dev is `LogEmailSender`, which logs the
//! recipient and template but not the payload, since payloads carry codes.
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload: Value,
}

impl std::fmt::Debug for EmailMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailMessage")
            .field("to_email", &self.to_email)
            .field("template", &self.template)
            .field("payload", &"***")
            .finish()
    }
}

/// Email delivery abstraction (SMTP, API, broker).
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            "email send stub"
        );
        Ok(())
    }
}

/// Fire-and-forget delivery on the blocking pool.
pub fn dispatch(sender: Arc<dyn EmailSender>, message: EmailMessage) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = sender.send(&message) {
            error!(
                to_email = %message.to_email,
                template = %message.template,
                "Failed to send email: {err:#}"
            );
        }
    });
}
