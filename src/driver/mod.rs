//! The method driver contract and its three implementations.
//!
//! Each second factor is a [`MethodDriver`]: it owns its setup, challenge and
//! verification flows and shares the cross-cutting mechanics (method registry
//! upkeep, primary promotion, rate limiting, event emission) through an
//! embedded [`DriverCore`].
//!
//! # Tracing Events
//!
//! - `mfa.method.enabled` - a method became enabled for a user
//! - `mfa.method.disabled` - a method was disabled for a user
//! - `mfa.method.primary_changed` - the primary method changed

use crate::context::{MfaUser, RequestContext};
use crate::error::{MfaError, Result};
use crate::events::{EventSink, MfaEvent, MfaEventKind};
use crate::ratelimit::AttemptLimiter;
use crate::store::CredentialStore;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub mod backup;
pub mod email_otp;
pub mod totp;
pub mod webauthn;

pub use email_otp::EmailOtpDriver;
pub use totp::TotpDriver;
pub use webauthn::{
    AssertionResult, CreationOptions, ExpectedAssertion, ExpectedRegistration,
    RegisteredCredential, RequestOptions, WebAuthnDriver, WebAuthnVerifier,
};

/// Identifies one of the supported second-factor methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverName {
    Totp,
    EmailOtp,
    WebAuthn,
}

impl DriverName {
    /// All drivers, in registry order.
    pub const ALL: [DriverName; 3] = [Self::Totp, Self::EmailOtp, Self::WebAuthn];

    /// Stable snake_case identifier used in storage and rate-limit keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::EmailOtp => "email_otp",
            Self::WebAuthn => "webauthn",
        }
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverName {
    type Err = MfaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "totp" => Ok(Self::Totp),
            "email_otp" => Ok(Self::EmailOtp),
            "webauthn" => Ok(Self::WebAuthn),
            other => Err(MfaError::DriverNotFound(other.to_string())),
        }
    }
}

/// What a completed setup call hands back to the caller.
#[derive(Clone, Debug)]
pub enum SetupOutcome {
    /// TOTP enrolment material. The secret and backup codes are shown to the
    /// user exactly once; they are not retrievable later.
    Totp {
        secret: String,
        provisioning_uri: String,
        backup_codes: Vec<String>,
    },
    /// Email OTP needs no enrolment beyond the address it will send to.
    EmailOtp { email: String },
    /// WebAuthn registration options to feed `navigator.credentials.create`.
    WebAuthn { options: CreationOptions },
}

/// What issuing a challenge hands back to the caller.
#[derive(Clone, Debug)]
pub enum ChallengeOutcome {
    /// Nothing was sent; prompt the user for a code they already have.
    Prompt { message: String },
    /// A code was emailed.
    EmailSent {
        masked_email: String,
        expires_in: Duration,
        otp_id: Uuid,
    },
    /// WebAuthn request options to feed `navigator.credentials.get`.
    WebAuthn { options: RequestOptions },
}

/// Summary of one registered WebAuthn key, safe to show in management UIs.
#[derive(Clone, Debug)]
pub struct KeySummary {
    pub id: Uuid,
    pub name: String,
    pub created_at: SystemTime,
    pub last_used_at: Option<SystemTime>,
}

/// Per-method state exposed to management UIs.
#[derive(Clone, Debug)]
pub enum DriverView {
    Totp {
        verified_at: Option<SystemTime>,
        remaining_backup_codes: usize,
    },
    EmailOtp {
        email: Option<String>,
        last_sent_at: Option<SystemTime>,
        can_resend: bool,
    },
    WebAuthn { keys: Vec<KeySummary> },
}

/// A fallback path the user can take when the main flow is unavailable.
#[derive(Clone, Debug)]
pub struct RecoveryOption {
    /// Stable identifier ("backup_code").
    pub id: String,
    /// How many uses remain.
    pub remaining: usize,
    pub description: String,
}

/// A second-factor method: setup, challenge and verification flows.
#[async_trait]
pub trait MethodDriver: Send + Sync {
    /// The driver's identity.
    fn name(&self) -> DriverName;

    /// Display name for method lists.
    fn display_name(&self) -> &str;

    /// Short description for management UIs.
    fn description(&self) -> &str;

    /// Whether the driver is offered at all (configuration flag).
    fn is_enabled(&self) -> bool;

    /// Whether the user has completed enrolment for this method.
    async fn is_configured(&self, user: &MfaUser) -> Result<bool>;

    /// Begin (or complete, for methods without secret material) enrolment.
    async fn setup(&self, user: &MfaUser, ctx: &RequestContext) -> Result<SetupOutcome>;

    /// Issue a challenge for an already-enrolled user.
    async fn challenge(&self, user: &MfaUser, ctx: &RequestContext) -> Result<ChallengeOutcome>;

    /// Check a credential. `Ok(false)` is a plain failed attempt; errors are
    /// reserved for rate limiting, missing enrolment and timeouts.
    async fn verify(&self, user: &MfaUser, credential: &str, ctx: &RequestContext)
        -> Result<bool>;

    /// Disable the method and remove its stored material.
    async fn disable(&self, user: &MfaUser) -> Result<()>;

    /// Current per-method state, `None` when the user has nothing enrolled.
    async fn data(&self, user: &MfaUser) -> Result<Option<DriverView>>;

    /// Validate the shape of setup input before acting on it.
    fn validate_setup(&self, input: &str) -> Result<()> {
        if input.trim().is_empty() {
            return Err(MfaError::SetupFailed("input must not be empty".to_string()));
        }
        Ok(())
    }

    /// Validate the shape of a verification credential before acting on it.
    fn validate_verification(&self, credential: &str) -> Result<()> {
        if credential.trim().is_empty() {
            return Err(MfaError::InvalidCode);
        }
        Ok(())
    }

    /// Fallback paths available to the user. Empty by default.
    async fn recovery_options(&self, _user: &MfaUser) -> Result<Vec<RecoveryOption>> {
        Ok(Vec::new())
    }
}

/// Shared mechanics embedded in every driver.
#[derive(Clone)]
pub struct DriverCore {
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) limiter: AttemptLimiter,
    pub(crate) events: Arc<dyn EventSink>,
}

impl DriverCore {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        limiter: AttemptLimiter,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            limiter,
            events,
        }
    }

    /// Whether the user's method record exists and is enabled.
    pub async fn method_enabled(&self, user_id: &str, driver: DriverName) -> Result<bool> {
        Ok(self
            .store
            .get_method(user_id, driver)
            .await?
            .is_some_and(|m| m.is_enabled))
    }

    /// Enable a method for the user, creating the record on first enable.
    ///
    /// Idempotent. When the user ends up with no primary method, this one is
    /// promoted.
    pub async fn enable_method(
        &self,
        user: &MfaUser,
        driver: DriverName,
        display_name: &str,
    ) -> Result<()> {
        let existing = self.store.get_method(&user.id, driver).await?;
        let already_enabled = existing.as_ref().is_some_and(|m| m.is_enabled);
        let record = match existing {
            Some(mut record) => {
                record.is_enabled = true;
                record
            }
            None => crate::store::MfaMethodRecord {
                user_id: user.id.clone(),
                driver,
                display_name: display_name.to_string(),
                is_primary: false,
                is_enabled: true,
                created_at: SystemTime::now(),
                last_used_at: None,
            },
        };
        self.store.save_method(record).await?;

        let methods = self.store.list_methods(&user.id).await?;
        let has_primary = methods.iter().any(|m| m.is_enabled && m.is_primary);
        if !has_primary {
            self.store.set_primary(&user.id, Some(driver)).await?;
            self.emit(MfaEvent::new(
                MfaEventKind::PrimaryMethodChanged,
                &user.id,
                Some(driver),
            ));
        }

        if !already_enabled {
            tracing::info!(
                target: "mfa.method.enabled",
                user_id = %user.id,
                driver = driver.as_str(),
                "MFA method enabled"
            );
            self.emit(MfaEvent::new(MfaEventKind::MethodEnabled, &user.id, Some(driver)));
        }
        Ok(())
    }

    /// Disable a method, refusing to remove the user's last enabled one.
    ///
    /// When the disabled method was primary, the longest-standing remaining
    /// enabled method is promoted first.
    pub async fn disable_method(&self, user: &MfaUser, driver: DriverName) -> Result<()> {
        let methods = self.store.list_methods(&user.id).await?;
        let target = methods
            .iter()
            .find(|m| m.driver == driver && m.is_enabled)
            .ok_or_else(|| MfaError::MethodNotConfigured(driver.to_string()))?;

        let enabled_count = methods.iter().filter(|m| m.is_enabled).count();
        if enabled_count <= 1 {
            return Err(MfaError::CannotDisableLastMethod);
        }

        if target.is_primary {
            let replacement = methods
                .iter()
                .find(|m| m.is_enabled && m.driver != driver)
                .map(|m| m.driver);
            self.store.set_primary(&user.id, replacement).await?;
            if let Some(promoted) = replacement {
                self.emit(MfaEvent::new(
                    MfaEventKind::PrimaryMethodChanged,
                    &user.id,
                    Some(promoted),
                ));
            }
        }

        self.store.set_method_enabled(&user.id, driver, false).await?;
        tracing::info!(
            target: "mfa.method.disabled",
            user_id = %user.id,
            driver = driver.as_str(),
            "MFA method disabled"
        );
        self.emit(MfaEvent::new(MfaEventKind::MethodDisabled, &user.id, Some(driver)));
        Ok(())
    }

    /// Stamp a method's last-used time.
    pub async fn touch(&self, user_id: &str, driver: DriverName) -> Result<()> {
        self.store
            .touch_method(user_id, driver, SystemTime::now())
            .await
    }

    fn rate_limit_key(driver: DriverName, user: &MfaUser, ctx: &RequestContext) -> String {
        format!(
            "mfa:attempts:{}:{}:{}",
            driver.as_str(),
            user.id,
            ctx.rate_limit_ip()
        )
    }

    /// Fail when the user/IP pair has exhausted its attempt budget.
    pub async fn check_rate_limit(
        &self,
        driver: DriverName,
        user: &MfaUser,
        ctx: &RequestContext,
    ) -> Result<()> {
        let result = self
            .limiter
            .check(&Self::rate_limit_key(driver, user, ctx))
            .await;
        if matches!(result, Err(MfaError::RateLimitExceeded { .. })) {
            self.emit(MfaEvent::new(
                MfaEventKind::RateLimitExceeded,
                &user.id,
                Some(driver),
            ));
        }
        result
    }

    /// Count one failed attempt against the user/IP pair.
    pub async fn record_failure(
        &self,
        driver: DriverName,
        user: &MfaUser,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.limiter
            .record_failure(&Self::rate_limit_key(driver, user, ctx))
            .await
    }

    /// Forget the user/IP pair's failed attempts after a success.
    pub async fn clear_rate_limit(
        &self,
        driver: DriverName,
        user: &MfaUser,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.limiter
            .clear(&Self::rate_limit_key(driver, user, ctx))
            .await
    }

    /// Hand an event to the sink.
    pub fn emit(&self, event: MfaEvent) {
        self.events.emit(&event);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::counter::InMemoryCounterStore;
    use crate::events::test::RecordingEventSink;
    use crate::store::{InMemoryCredentialStore, PlainCodec};

    /// A core wired to fresh in-memory backends, with the sink exposed.
    pub struct CoreFixture {
        pub core: DriverCore,
        pub store: Arc<InMemoryCredentialStore>,
        pub events: Arc<RecordingEventSink>,
    }

    impl CoreFixture {
        pub fn new() -> Self {
            Self::with_rate_limit(RateLimitConfig::default())
        }

        pub fn with_rate_limit(config: RateLimitConfig) -> Self {
            let store = Arc::new(InMemoryCredentialStore::new(Arc::new(PlainCodec)));
            let events = Arc::new(RecordingEventSink::new());
            let core = DriverCore::new(
                store.clone(),
                AttemptLimiter::new(Arc::new(InMemoryCounterStore::new()), config),
                events.clone(),
            );
            Self {
                core,
                store,
                events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::CoreFixture;
    use super::*;
    use crate::config::RateLimitConfig;

    fn user() -> MfaUser {
        MfaUser::new("user-1")
    }

    #[tokio::test]
    async fn driver_name_string_round_trip() {
        for name in DriverName::ALL {
            assert_eq!(name.as_str().parse::<DriverName>().unwrap(), name);
        }
        assert!(matches!(
            "sms".parse::<DriverName>(),
            Err(MfaError::DriverNotFound(_))
        ));
    }

    #[tokio::test]
    async fn first_enabled_method_becomes_primary() {
        let fx = CoreFixture::new();
        fx.core
            .enable_method(&user(), DriverName::Totp, "Authenticator App")
            .await
            .unwrap();

        let methods = fx.store.list_methods("user-1").await.unwrap();
        assert_eq!(methods.len(), 1);
        assert!(methods[0].is_primary);

        // A second method does not steal primary.
        fx.core
            .enable_method(&user(), DriverName::EmailOtp, "Email Code")
            .await
            .unwrap();
        let methods = fx.store.list_methods("user-1").await.unwrap();
        let primary: Vec<_> = methods.iter().filter(|m| m.is_primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].driver, DriverName::Totp);
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let fx = CoreFixture::new();
        let user = user();
        fx.core
            .enable_method(&user, DriverName::Totp, "Authenticator App")
            .await
            .unwrap();
        fx.core
            .enable_method(&user, DriverName::Totp, "Authenticator App")
            .await
            .unwrap();

        assert_eq!(fx.store.list_methods("user-1").await.unwrap().len(), 1);
        let enabled_events = fx
            .events
            .kinds()
            .into_iter()
            .filter(|k| *k == MfaEventKind::MethodEnabled)
            .count();
        assert_eq!(enabled_events, 1);
    }

    #[tokio::test]
    async fn last_method_cannot_be_disabled() {
        let fx = CoreFixture::new();
        let user = user();
        fx.core
            .enable_method(&user, DriverName::Totp, "Authenticator App")
            .await
            .unwrap();

        let err = fx.core.disable_method(&user, DriverName::Totp).await.unwrap_err();
        assert!(matches!(err, MfaError::CannotDisableLastMethod));
        assert!(fx.core.method_enabled("user-1", DriverName::Totp).await.unwrap());
    }

    #[tokio::test]
    async fn disabling_primary_promotes_replacement() {
        let fx = CoreFixture::new();
        let user = user();
        fx.core
            .enable_method(&user, DriverName::Totp, "Authenticator App")
            .await
            .unwrap();
        fx.core
            .enable_method(&user, DriverName::EmailOtp, "Email Code")
            .await
            .unwrap();

        fx.core.disable_method(&user, DriverName::Totp).await.unwrap();

        let methods = fx.store.list_methods("user-1").await.unwrap();
        let email = methods
            .iter()
            .find(|m| m.driver == DriverName::EmailOtp)
            .unwrap();
        assert!(email.is_primary && email.is_enabled);
        assert!(fx.events.kinds().contains(&MfaEventKind::PrimaryMethodChanged));
    }

    #[tokio::test]
    async fn disabling_unconfigured_method_fails() {
        let fx = CoreFixture::new();
        let err = fx
            .core
            .disable_method(&user(), DriverName::WebAuthn)
            .await
            .unwrap_err();
        assert!(matches!(err, MfaError::MethodNotConfigured(_)));
    }

    #[tokio::test]
    async fn rate_limit_key_isolated_per_ip() {
        use crate::session::InMemorySession;

        let fx = CoreFixture::with_rate_limit(RateLimitConfig::new(
            2,
            Duration::from_secs(900),
        ));
        let user = user();
        let ctx_a = RequestContext::new(Arc::new(InMemorySession::new())).with_ip("10.0.0.1");
        let ctx_b = RequestContext::new(Arc::new(InMemorySession::new())).with_ip("10.0.0.2");

        for _ in 0..2 {
            fx.core
                .record_failure(DriverName::Totp, &user, &ctx_a)
                .await
                .unwrap();
        }
        assert!(fx
            .core
            .check_rate_limit(DriverName::Totp, &user, &ctx_a)
            .await
            .is_err());
        assert!(fx
            .core
            .check_rate_limit(DriverName::Totp, &user, &ctx_b)
            .await
            .is_ok());
        assert!(fx.events.kinds().contains(&MfaEventKind::RateLimitExceeded));

        fx.core
            .clear_rate_limit(DriverName::Totp, &user, &ctx_a)
            .await
            .unwrap();
        assert!(fx
            .core
            .check_rate_limit(DriverName::Totp, &user, &ctx_a)
            .await
            .is_ok());
    }
}
