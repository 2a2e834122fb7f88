//! Lifecycle event notifications for audit and logging.
//!
//! The coordinator and drivers report every noteworthy transition through an
//! injected [`EventSink`]; the call is synchronous fire-and-forget, so sinks
//! that need to do real work should hand the event off to their own queue.

use crate::driver::DriverName;
use std::time::SystemTime;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfaEventKind {
    /// A method's setup flow was initiated.
    SetupStarted,
    /// A method became enabled for the user.
    MethodEnabled,
    /// A method was disabled for the user.
    MethodDisabled,
    /// A challenge was issued (email sent, WebAuthn options produced).
    ChallengeIssued,
    /// A verification attempt succeeded.
    Verified,
    /// A verification attempt failed.
    VerificationFailed,
    /// A TOTP backup code was consumed.
    BackupCodeUsed,
    /// The user's backup codes were replaced with a fresh batch.
    BackupCodesRegenerated,
    /// An attempt was blocked by rate limiting or throttling.
    RateLimitExceeded,
    /// The user's primary method changed.
    PrimaryMethodChanged,
    /// All methods were bulk-disabled via the emergency escape hatch.
    EmergencyDisabled,
    /// A WebAuthn credential was registered.
    KeyRegistered,
    /// A WebAuthn credential was deleted.
    KeyDeleted,
}

impl MfaEventKind {
    /// Stable snake_case name for log lines and downstream consumers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupStarted => "setup_started",
            Self::MethodEnabled => "method_enabled",
            Self::MethodDisabled => "method_disabled",
            Self::ChallengeIssued => "challenge_issued",
            Self::Verified => "verified",
            Self::VerificationFailed => "verification_failed",
            Self::BackupCodeUsed => "backup_code_used",
            Self::BackupCodesRegenerated => "backup_codes_regenerated",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::PrimaryMethodChanged => "primary_method_changed",
            Self::EmergencyDisabled => "emergency_disabled",
            Self::KeyRegistered => "key_registered",
            Self::KeyDeleted => "key_deleted",
        }
    }
}

/// A lifecycle notification.
#[derive(Clone, Debug)]
pub struct MfaEvent {
    pub kind: MfaEventKind,
    pub user_id: String,
    /// The driver involved; absent for coordinator-level events.
    pub driver: Option<DriverName>,
    pub timestamp: SystemTime,
    /// Free-form detail (key name, failure reason), never secret material.
    pub detail: Option<String>,
}

impl MfaEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(kind: MfaEventKind, user_id: impl Into<String>, driver: Option<DriverName>) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            driver,
            timestamp: SystemTime::now(),
            detail: None,
        }
    }

    /// Attach free-form detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives lifecycle notifications. Fire-and-forget.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MfaEvent);
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &MfaEvent) {}
}

/// Sink that writes one structured log line per event under the
/// `mfa.event` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &MfaEvent) {
        tracing::info!(
            target: "mfa.event",
            kind = event.kind.as_str(),
            user_id = %event.user_id,
            driver = event.driver.map(|d| d.as_str()),
            detail = event.detail.as_deref(),
            "MFA event"
        );
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records events for assertions.
    #[derive(Default)]
    pub struct RecordingEventSink {
        pub events: Mutex<Vec<MfaEvent>>,
    }

    impl RecordingEventSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn kinds(&self) -> Vec<MfaEventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    impl EventSink for RecordingEventSink {
        fn emit(&self, event: &MfaEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
