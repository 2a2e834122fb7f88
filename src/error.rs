//! Error types for the MFA core.
//!
//! Every failure a caller can act on has its own variant; unexpected
//! lower-level failures (mail transport, WebAuthn library, store backends)
//! are caught at the driver boundary, logged with context, and re-surfaced
//! as the closest typed variant. Raw internal errors never cross the driver
//! boundary.

/// The main error type for MFA operations.
#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    #[error("MFA driver [{0}] not found")]
    DriverNotFound(String),

    #[error("MFA driver [{0}] is not enabled")]
    DriverNotEnabled(String),

    #[error("MFA method [{0}] is not configured for this user")]
    MethodNotConfigured(String),

    #[error("The verification code is invalid or has expired")]
    InvalidCode,

    /// Carries the caller-usable remaining time, computed from a stored
    /// absolute expiry rather than re-derived from the decay window.
    #[error("Too many attempts. Please try again in {seconds_remaining} seconds")]
    RateLimitExceeded { seconds_remaining: u64 },

    #[error("The MFA challenge has timed out. Please try again")]
    ChallengeTimeout,

    #[error("Failed to set up MFA method: {0}")]
    SetupFailed(String),

    #[error("MFA verification failed: {0}")]
    VerificationFailed(String),

    #[error("No backup codes available. Please generate new backup codes")]
    NoBackupCodes,

    #[error("The backup code is invalid or has already been used")]
    InvalidBackupCode,

    #[error("No MFA methods are enabled for this user")]
    NoMethodsEnabled,

    #[error("Cannot disable the last MFA method. Please add another method first")]
    CannotDisableLastMethod,

    #[error("WebAuthn error: {0}")]
    WebAuthn(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl MfaError {
    /// Shorthand for an internal error from any displayable cause.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should be shown to the end user as-is.
    ///
    /// Internal errors carry backend detail and should be replaced with a
    /// generic message by the presentation layer.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::Anyhow(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MfaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_message_carries_seconds() {
        let err = MfaError::RateLimitExceeded {
            seconds_remaining: 42,
        };
        assert!(err.to_string().contains("42 seconds"));
    }

    #[test]
    fn internal_errors_are_not_user_facing() {
        assert!(!MfaError::internal("db down").is_user_facing());
        assert!(MfaError::InvalidCode.is_user_facing());
        assert!(MfaError::CannotDisableLastMethod.is_user_facing());
    }
}
