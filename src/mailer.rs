//! Mail seam used by the email OTP driver.
//!
//! The core never talks to a transport directly; it builds an [`Email`] and
//! hands it to the injected [`Mailer`]. A send failure propagates as an error
//! and is never swallowed; the user must not be left waiting for a code that
//! was never dispatched.

use crate::error::{MfaError, Result};
use async_trait::async_trait;

/// An email message to be sent.
#[derive(Debug, Clone)]
pub struct Email {
    /// Sender address, e.g. "no-reply@example.com".
    pub from: String,
    /// Sender display name.
    pub from_name: Option<String>,
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain text body (optional if html is provided).
    pub text: Option<String>,
    /// HTML body (optional if text is provided).
    pub html: Option<String>,
}

impl Email {
    /// Create a new email with the required fields.
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_name: None,
            to: to.into(),
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    /// Set the sender display name.
    #[must_use]
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    /// Set the plain text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    /// Set the HTML body.
    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    /// Validate that the message has the required fields.
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(MfaError::internal("email 'from' is required"));
        }
        if self.to.is_empty() {
            return Err(MfaError::internal("email 'to' is required"));
        }
        if self.subject.is_empty() {
            return Err(MfaError::internal("email 'subject' is required"));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(MfaError::internal("email must have a text or html body"));
        }
        Ok(())
    }
}

/// Sends emails. Implement over SMTP, an API service, or a queue.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send an email. An error means the message was not dispatched.
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Development mailer that prints messages to stdout instead of sending.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleMailer;

impl ConsoleMailer {
    /// Create a console mailer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        println!("=== Email ===");
        println!("From: {}", email.from);
        println!("To: {}", email.to);
        println!("Subject: {}", email.subject);
        if let Some(text) = &email.text {
            println!("{text}");
        }
        println!("=============");
        tracing::debug!(
            target: "mfa.mail.console",
            to = %email.to,
            subject = %email.subject,
            "Email written to console"
        );
        Ok(())
    }
}
