//! Typed configuration for the MFA core.
//!
//! Every tunable the drivers consume lives here, validated once at
//! construction time and passed into the driver constructors. Defaults match
//! the values documented on each field.

use std::time::Duration;
use totp_rs::Algorithm;

/// Top-level MFA configuration.
#[derive(Clone, Debug)]
pub struct MfaConfig {
    /// Global kill switch. When false, `requires_mfa` is always false.
    pub enabled: bool,
    /// Session key under which the verification timestamp is stored.
    pub session_key: String,
    /// How long a session-level verification stays valid. Zero means the
    /// verification never expires within the session.
    pub challenge_timeout: Duration,
    /// Automatically mark sessions established via a trusted "remember me"
    /// mechanism as verified. This is the single automatic bypass path.
    pub auto_verify_remembered: bool,
    /// Failed-attempt rate limiting shared by all drivers.
    pub rate_limit: RateLimitConfig,
    /// TOTP driver tunables.
    pub totp: TotpDriverConfig,
    /// Email OTP driver tunables.
    pub email_otp: EmailOtpConfig,
    /// WebAuthn driver tunables.
    pub webauthn: WebAuthnConfig,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_key: "mfa_verified_at".to_string(),
            challenge_timeout: Duration::from_secs(900),
            auto_verify_remembered: false,
            rate_limit: RateLimitConfig::default(),
            totp: TotpDriverConfig::default(),
            email_otp: EmailOtpConfig::default(),
            webauthn: WebAuthnConfig::default(),
        }
    }
}

impl MfaConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable MFA globally.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the session key for the verification timestamp.
    #[must_use]
    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    /// Set how long a verification stays valid (zero = never expires).
    #[must_use]
    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    /// Auto-verify sessions established via "remember me".
    #[must_use]
    pub fn auto_verify_remembered(mut self, auto: bool) -> Self {
        self.auto_verify_remembered = auto;
        self
    }

    /// Set the rate limiting configuration.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Set the TOTP driver configuration.
    #[must_use]
    pub fn totp(mut self, config: TotpDriverConfig) -> Self {
        self.totp = config;
        self
    }

    /// Set the email OTP driver configuration.
    #[must_use]
    pub fn email_otp(mut self, config: EmailOtpConfig) -> Self {
        self.email_otp = config;
        self
    }

    /// Set the WebAuthn driver configuration.
    #[must_use]
    pub fn webauthn(mut self, config: WebAuthnConfig) -> Self {
        self.webauthn = config;
        self
    }
}

/// Fixed-window rate limiting for failed verification attempts,
/// keyed by (driver, user, source IP).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Whether rate limiting is active.
    pub enabled: bool,
    /// Maximum failed attempts before lockout (default: 5).
    pub max_attempts: u32,
    /// Window within which attempts are counted (default: 15 minutes).
    pub decay_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            decay_window: Duration::from_secs(900),
        }
    }
}

impl RateLimitConfig {
    /// Create a config with explicit limits.
    #[must_use]
    pub fn new(max_attempts: u32, decay_window: Duration) -> Self {
        Self {
            enabled: true,
            max_attempts,
            decay_window,
        }
    }

    /// Disable rate limiting entirely (tests, trusted environments).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// TOTP driver configuration.
#[derive(Clone, Debug)]
pub struct TotpDriverConfig {
    /// Whether the driver is offered at all.
    pub enabled: bool,
    /// Display name shown in method lists.
    pub display_name: String,
    /// Short description for management UIs.
    pub description: String,
    /// Issuer shown in authenticator apps.
    pub issuer: String,
    /// HMAC algorithm (default: SHA1 for authenticator-app compatibility).
    pub algorithm: Algorithm,
    /// Number of digits in a code (default: 6).
    pub digits: usize,
    /// Time step in seconds (default: 30).
    pub period: u64,
    /// Accepted clock-drift window in time steps (default: 1, i.e. ±30 s).
    pub window: u8,
    /// Number of backup codes issued at setup (default: 8).
    pub backup_code_count: usize,
    /// Length of each backup code, excluding separators (default: 10).
    pub backup_code_length: usize,
}

impl Default for TotpDriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            display_name: "Authenticator App".to_string(),
            description: "Use an authenticator app like Google Authenticator or Authy"
                .to_string(),
            issuer: "Breakwater".to_string(),
            algorithm: Algorithm::SHA1,
            digits: 6,
            period: 30,
            window: 1,
            backup_code_count: 8,
            backup_code_length: 10,
        }
    }
}

impl TotpDriverConfig {
    /// Create a new TOTP config with the given issuer.
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Self::default()
        }
    }

    /// Set the number of digits.
    #[must_use]
    pub fn digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }

    /// Set the time step in seconds.
    #[must_use]
    pub fn period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    /// Set the accepted drift window in time steps.
    #[must_use]
    pub fn window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    /// Set the HMAC algorithm.
    #[must_use]
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// Email OTP driver configuration.
#[derive(Clone, Debug)]
pub struct EmailOtpConfig {
    /// Whether the driver is offered at all.
    pub enabled: bool,
    /// Display name shown in method lists.
    pub display_name: String,
    /// Short description for management UIs.
    pub description: String,
    /// Number of digits in a code (default: 6).
    pub code_length: usize,
    /// How long an issued code stays valid (default: 10 minutes).
    pub expires_in: Duration,
    /// Minimum interval between sends per user (default: 60 s).
    pub throttle: Duration,
    /// Sender address for the code email.
    pub from_address: String,
    /// Sender display name.
    pub from_name: String,
    /// Subject line for the code email.
    pub subject: String,
}

impl Default for EmailOtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            display_name: "Email Code".to_string(),
            description: "Receive a verification code via email".to_string(),
            code_length: 6,
            expires_in: Duration::from_secs(600),
            throttle: Duration::from_secs(60),
            from_address: "no-reply@example.com".to_string(),
            from_name: "Breakwater".to_string(),
            subject: "Your Verification Code".to_string(),
        }
    }
}

impl EmailOtpConfig {
    /// Create a config with the given sender address.
    #[must_use]
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
            ..Self::default()
        }
    }

    /// Set the code length.
    #[must_use]
    pub fn code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    /// Set how long an issued code stays valid.
    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = ttl;
        self
    }

    /// Set the minimum interval between sends.
    #[must_use]
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = interval;
        self
    }
}

/// User-verification requirement presented to a WebAuthn authenticator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    Required,
    Preferred,
    Discouraged,
}

/// Attestation conveyance preference for registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Attestation {
    None,
    Indirect,
    Direct,
}

/// Authenticator attachment restriction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticatorAttachment {
    Platform,
    CrossPlatform,
}

/// WebAuthn driver configuration.
#[derive(Clone, Debug)]
pub struct WebAuthnConfig {
    /// Whether the driver is offered at all.
    pub enabled: bool,
    /// Display name shown in method lists.
    pub display_name: String,
    /// Short description for management UIs.
    pub description: String,
    /// Relying-party identifier (usually the effective domain).
    pub rp_id: String,
    /// Relying-party display name.
    pub rp_name: String,
    /// Challenge length in bytes (default: 32).
    pub challenge_length: usize,
    /// Client-side ceremony timeout in milliseconds (default: 60 000).
    pub timeout_ms: u64,
    /// User-verification preference (default: preferred).
    pub user_verification: UserVerification,
    /// Attestation preference (default: none).
    pub attestation: Attestation,
    /// Attachment restriction; `None` accepts both platform and roaming.
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    /// Whether a discoverable (resident) credential is required.
    pub require_resident_key: bool,
}

impl Default for WebAuthnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            display_name: "Security Key".to_string(),
            description: "Use a hardware security key or biometric authentication"
                .to_string(),
            rp_id: "localhost".to_string(),
            rp_name: "Breakwater".to_string(),
            challenge_length: 32,
            timeout_ms: 60_000,
            user_verification: UserVerification::Preferred,
            attestation: Attestation::None,
            authenticator_attachment: None,
            require_resident_key: false,
        }
    }
}

impl WebAuthnConfig {
    /// Create a config for the given relying party.
    #[must_use]
    pub fn new(rp_id: impl Into<String>, rp_name: impl Into<String>) -> Self {
        Self {
            rp_id: rp_id.into(),
            rp_name: rp_name.into(),
            ..Self::default()
        }
    }

    /// Set the challenge length in bytes.
    #[must_use]
    pub fn challenge_length(mut self, bytes: usize) -> Self {
        self.challenge_length = bytes;
        self
    }

    /// Set the user-verification preference.
    #[must_use]
    pub fn user_verification(mut self, uv: UserVerification) -> Self {
        self.user_verification = uv;
        self
    }

    /// Set the attestation preference.
    #[must_use]
    pub fn attestation(mut self, attestation: Attestation) -> Self {
        self.attestation = attestation;
        self
    }
}
