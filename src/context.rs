//! Per-operation context passed into every driver method.
//!
//! The drivers never reach into ambient request or session state; the caller
//! (typically an HTTP handler) assembles a [`RequestContext`] from whatever
//! transport it sits on and hands it down explicitly.

use crate::session::SessionState;
use std::sync::Arc;

/// Read view of the already-authenticated principal being challenged.
///
/// Holds identifiers only, never secret material.
#[derive(Clone, Debug)]
pub struct MfaUser {
    /// Stable unique identifier.
    pub id: String,
    /// Email address, required for the email OTP driver.
    pub email: Option<String>,
    /// Human-readable name used in WebAuthn user entities and mail greetings.
    pub display_name: Option<String>,
}

impl MfaUser {
    /// Create a user view with just an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
        }
    }

    /// Set the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The label shown in authenticator apps and WebAuthn prompts:
    /// email when present, otherwise the identifier.
    #[must_use]
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.id)
    }
}

/// Explicit per-request context: the session handle plus request metadata.
#[derive(Clone)]
pub struct RequestContext {
    /// Handle scoped to the current authenticated session.
    pub session: Arc<dyn SessionState>,
    /// Source IP of the request, used in rate-limit keys and OTP audit rows.
    pub ip: Option<String>,
    /// User agent of the request, recorded on OTP rows.
    pub user_agent: Option<String>,
    /// Whether the session was established via a trusted "remember me"
    /// mechanism. Feeds the single automatic verification bypass.
    pub via_remember: bool,
}

impl RequestContext {
    /// Create a context around a session handle.
    #[must_use]
    pub fn new(session: Arc<dyn SessionState>) -> Self {
        Self {
            session,
            ip: None,
            user_agent: None,
            via_remember: false,
        }
    }

    /// Set the source IP.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Mark the session as established via "remember me".
    #[must_use]
    pub fn via_remember(mut self, remembered: bool) -> Self {
        self.via_remember = remembered;
        self
    }

    /// IP for rate-limit keys; requests without one share a bucket.
    pub(crate) fn rate_limit_ip(&self) -> &str {
        self.ip.as_deref().unwrap_or("-")
    }
}
