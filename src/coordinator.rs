//! The coordinator: one object tying the drivers, the session-verification
//! lifecycle and the method registry together.
//!
//! Built once at startup via [`MfaCoordinatorBuilder`] and shared (`Arc`)
//! across request handlers. Per-request state arrives through
//! [`RequestContext`]; the coordinator itself is stateless beyond its
//! collaborators.
//!
//! # Tracing Events
//!
//! - `mfa.session.verified` - a session was marked verified
//! - `mfa.session.cleared` - a session's verification was cleared
//! - `mfa.session.remembered` - verification granted via "remember me"
//! - `mfa.disabled_all` - every method was bulk-disabled for a user

use crate::config::MfaConfig;
use crate::context::{MfaUser, RequestContext};
use crate::counter::{CounterStore, InMemoryCounterStore};
use crate::driver::{
    DriverCore, DriverName, EmailOtpDriver, MethodDriver, TotpDriver, WebAuthnDriver,
    WebAuthnVerifier,
};
use crate::error::{MfaError, Result};
use crate::events::{EventSink, MfaEvent, MfaEventKind, NullEventSink};
use crate::mailer::Mailer;
use crate::ratelimit::AttemptLimiter;
use crate::store::{CredentialStore, MfaMethodRecord};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Aggregate view of a user's MFA posture.
#[derive(Clone, Debug)]
pub struct MfaStatistics {
    pub methods_enabled: usize,
    pub primary_method: Option<DriverName>,
    pub webauthn_keys: usize,
    pub backup_codes_remaining: usize,
    pub last_used_at: Option<SystemTime>,
}

/// Builder for [`MfaCoordinator`].
///
/// The credential store, mailer and WebAuthn verifier must be provided;
/// counters default to in-memory, events to the null sink and configuration
/// to its defaults.
#[derive(Default)]
pub struct MfaCoordinatorBuilder {
    config: Option<MfaConfig>,
    store: Option<Arc<dyn CredentialStore>>,
    counters: Option<Arc<dyn CounterStore>>,
    events: Option<Arc<dyn EventSink>>,
    mailer: Option<Arc<dyn Mailer>>,
    webauthn_verifier: Option<Arc<dyn WebAuthnVerifier>>,
}

impl MfaCoordinatorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: MfaConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    #[must_use]
    pub fn webauthn_verifier(mut self, verifier: Arc<dyn WebAuthnVerifier>) -> Self {
        self.webauthn_verifier = Some(verifier);
        self
    }

    /// Assemble the coordinator.
    pub fn build(self) -> Result<MfaCoordinator> {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .ok_or_else(|| MfaError::internal("MfaCoordinatorBuilder: store is required"))?;
        let mailer = self
            .mailer
            .ok_or_else(|| MfaError::internal("MfaCoordinatorBuilder: mailer is required"))?;
        let verifier = self.webauthn_verifier.ok_or_else(|| {
            MfaError::internal("MfaCoordinatorBuilder: webauthn verifier is required")
        })?;
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new()));
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(NullEventSink));

        let core = DriverCore::new(
            store.clone(),
            AttemptLimiter::new(counters.clone(), config.rate_limit.clone()),
            events.clone(),
        );
        let totp = Arc::new(TotpDriver::new(core.clone(), config.totp.clone()));
        let email_otp = Arc::new(EmailOtpDriver::new(
            core.clone(),
            config.email_otp.clone(),
            mailer,
            counters,
        ));
        let webauthn = Arc::new(WebAuthnDriver::new(
            core.clone(),
            config.webauthn.clone(),
            verifier,
        ));

        Ok(MfaCoordinator {
            config,
            store,
            events,
            core,
            totp,
            email_otp,
            webauthn,
        })
    }
}

/// Entry point for challenging users and managing their methods.
pub struct MfaCoordinator {
    config: MfaConfig,
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn EventSink>,
    core: DriverCore,
    totp: Arc<TotpDriver>,
    email_otp: Arc<EmailOtpDriver>,
    webauthn: Arc<WebAuthnDriver>,
}

impl MfaCoordinator {
    #[must_use]
    pub fn builder() -> MfaCoordinatorBuilder {
        MfaCoordinatorBuilder::new()
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &MfaConfig {
        &self.config
    }

    /// The TOTP driver, for its driver-specific operations
    /// (backup code regeneration).
    #[must_use]
    pub fn totp(&self) -> &TotpDriver {
        &self.totp
    }

    /// The email OTP driver, for resend and cleanup.
    #[must_use]
    pub fn email_otp(&self) -> &EmailOtpDriver {
        &self.email_otp
    }

    /// The WebAuthn driver, for registration and key management.
    #[must_use]
    pub fn webauthn(&self) -> &WebAuthnDriver {
        &self.webauthn
    }

    /// Look up a driver, failing when it is switched off in configuration.
    pub fn driver(&self, name: DriverName) -> Result<&dyn MethodDriver> {
        let driver: &dyn MethodDriver = match name {
            DriverName::Totp => self.totp.as_ref(),
            DriverName::EmailOtp => self.email_otp.as_ref(),
            DriverName::WebAuthn => self.webauthn.as_ref(),
        };
        if !driver.is_enabled() {
            return Err(MfaError::DriverNotEnabled(name.to_string()));
        }
        Ok(driver)
    }

    /// Drivers switched on in configuration.
    #[must_use]
    pub fn available_drivers(&self) -> Vec<DriverName> {
        DriverName::ALL
            .into_iter()
            .filter(|name| self.driver(*name).is_ok())
            .collect()
    }

    /// The user's enabled method records.
    pub async fn enabled_drivers(&self, user: &MfaUser) -> Result<Vec<MfaMethodRecord>> {
        Ok(self
            .store
            .list_methods(&user.id)
            .await?
            .into_iter()
            .filter(|m| m.is_enabled)
            .collect())
    }

    /// The user's primary method record, if any.
    pub async fn primary_method(&self, user: &MfaUser) -> Result<Option<MfaMethodRecord>> {
        Ok(self
            .enabled_drivers(user)
            .await?
            .into_iter()
            .find(|m| m.is_primary))
    }

    /// Make `driver` the user's primary method.
    ///
    /// Returns `false` without changing anything when the method is not
    /// enabled for the user.
    pub async fn set_primary_method(&self, user: &MfaUser, driver: DriverName) -> Result<bool> {
        let enabled = self
            .enabled_drivers(user)
            .await?
            .iter()
            .any(|m| m.driver == driver);
        if !enabled {
            return Ok(false);
        }
        self.store.set_primary(&user.id, Some(driver)).await?;
        self.events.emit(&MfaEvent::new(
            MfaEventKind::PrimaryMethodChanged,
            &user.id,
            Some(driver),
        ));
        Ok(true)
    }

    /// Which method to challenge with: the primary, else the user's single
    /// enabled method, else `None` (the caller must let the user choose).
    pub async fn determine_challenge_method(&self, user: &MfaUser) -> Result<Option<DriverName>> {
        let enabled = self.enabled_drivers(user).await?;
        if let Some(primary) = enabled.iter().find(|m| m.is_primary) {
            return Ok(Some(primary.driver));
        }
        match enabled.as_slice() {
            [only] => Ok(Some(only.driver)),
            _ => Ok(None),
        }
    }

    /// Whether the user has any enabled method.
    pub async fn is_mfa_enabled(&self, user: &MfaUser) -> Result<bool> {
        Ok(!self.enabled_drivers(user).await?.is_empty())
    }

    /// Whether this request must pass an MFA challenge before proceeding.
    ///
    /// The "remember me" path is the single automatic bypass: a session
    /// established via remember is marked verified here, explicitly and
    /// with a log line, when the configuration opts in.
    pub async fn requires_mfa(&self, user: &MfaUser, ctx: &RequestContext) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        if !self.is_mfa_enabled(user).await? {
            return Ok(false);
        }
        if self.is_verified(ctx).await? {
            return Ok(false);
        }
        if ctx.via_remember && self.config.auto_verify_remembered {
            tracing::info!(
                target: "mfa.session.remembered",
                user_id = %user.id,
                "Session verified via remember-me"
            );
            self.mark_as_verified(ctx, None).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether the session currently holds a live verification.
    pub async fn is_verified(&self, ctx: &RequestContext) -> Result<bool> {
        let Some(raw) = ctx.session.get(&self.config.session_key).await? else {
            return Ok(false);
        };
        let Ok(verified_at) = raw.parse::<u64>() else {
            return Ok(false);
        };
        let timeout = self.config.challenge_timeout.as_secs();
        if timeout == 0 {
            return Ok(true);
        }
        Ok(unix_now().saturating_sub(verified_at) < timeout)
    }

    /// Mark the session verified, recording which driver satisfied the
    /// challenge (`None` for the remember-me path).
    pub async fn mark_as_verified(
        &self,
        ctx: &RequestContext,
        driver: Option<DriverName>,
    ) -> Result<()> {
        ctx.session
            .put(&self.config.session_key, unix_now().to_string())
            .await?;
        let marker = driver.map_or("remembered", |d| d.as_str());
        ctx.session
            .put(&self.driver_session_key(), marker.to_string())
            .await?;
        tracing::info!(
            target: "mfa.session.verified",
            driver = marker,
            "Session marked MFA-verified"
        );
        Ok(())
    }

    /// Drop the session's verification (logout, step-up revocation).
    pub async fn clear_verification(&self, ctx: &RequestContext) -> Result<()> {
        ctx.session.forget(&self.config.session_key).await?;
        ctx.session.forget(&self.driver_session_key()).await?;
        tracing::debug!(target: "mfa.session.cleared", "Session MFA verification cleared");
        Ok(())
    }

    /// Which driver satisfied the current verification, if any.
    pub async fn verified_with(&self, ctx: &RequestContext) -> Result<Option<String>> {
        if !self.is_verified(ctx).await? {
            return Ok(None);
        }
        ctx.session.get(&self.driver_session_key()).await
    }

    fn driver_session_key(&self) -> String {
        format!("{}_driver", self.config.session_key)
    }

    /// Issue a challenge via the named driver.
    pub async fn challenge(
        &self,
        user: &MfaUser,
        driver: DriverName,
        ctx: &RequestContext,
    ) -> Result<crate::driver::ChallengeOutcome> {
        self.driver(driver)?.challenge(user, ctx).await
    }

    /// Issue a challenge with the user's preferred method: the primary,
    /// else their single enabled method, else the first enabled one.
    ///
    /// Fails with [`MfaError::NoMethodsEnabled`] when the user has nothing
    /// to challenge with.
    pub async fn challenge_preferred(
        &self,
        user: &MfaUser,
        ctx: &RequestContext,
    ) -> Result<(DriverName, crate::driver::ChallengeOutcome)> {
        let enabled = self.enabled_drivers(user).await?;
        let Some(first) = enabled.first() else {
            return Err(MfaError::NoMethodsEnabled);
        };
        let driver = self
            .determine_challenge_method(user)
            .await?
            .unwrap_or(first.driver);
        let outcome = self.challenge(user, driver, ctx).await?;
        Ok((driver, outcome))
    }

    /// Verify a credential via the named driver; success marks the session
    /// verified.
    pub async fn verify(
        &self,
        user: &MfaUser,
        driver: DriverName,
        credential: &str,
        ctx: &RequestContext,
    ) -> Result<bool> {
        let ok = self.driver(driver)?.verify(user, credential, ctx).await?;
        if ok {
            self.mark_as_verified(ctx, Some(driver)).await?;
        }
        Ok(ok)
    }

    /// Aggregate numbers for account-security screens.
    pub async fn statistics(&self, user: &MfaUser) -> Result<MfaStatistics> {
        let enabled = self.enabled_drivers(user).await?;
        let backup_codes_remaining = self
            .store
            .get_totp(&user.id)
            .await?
            .map_or(0, |r| r.backup_codes.len());
        Ok(MfaStatistics {
            methods_enabled: enabled.len(),
            primary_method: enabled.iter().find(|m| m.is_primary).map(|m| m.driver),
            webauthn_keys: self.store.count_webauthn_keys(&user.id).await?,
            backup_codes_remaining,
            last_used_at: enabled.iter().filter_map(|m| m.last_used_at).max(),
        })
    }

    /// Stamp a method's last-used time.
    pub async fn update_last_used(&self, user: &MfaUser, driver: DriverName) -> Result<()> {
        self.core.touch(&user.id, driver).await
    }

    /// Enable a method for the user directly (admin or post-verification
    /// flows). First enabled method becomes primary.
    pub async fn enable_method(&self, user: &MfaUser, driver: DriverName) -> Result<()> {
        let display_name = self.driver(driver)?.display_name().to_string();
        self.core.enable_method(user, driver, &display_name).await
    }

    /// Emergency escape hatch: disable every method, bypassing the
    /// last-method guard. Returns how many methods were enabled.
    pub async fn disable_all(&self, user: &MfaUser) -> Result<usize> {
        let disabled = self.store.disable_all_methods(&user.id).await?;
        tracing::warn!(
            target: "mfa.disabled_all",
            user_id = %user.id,
            disabled = disabled,
            "All MFA methods disabled"
        );
        self.events.emit(
            &MfaEvent::new(MfaEventKind::EmergencyDisabled, &user.id, None)
                .with_detail(format!("{disabled} methods disabled")),
        );
        Ok(disabled)
    }

    /// Purge expired email OTP rows; intended for a periodic job.
    pub async fn cleanup_expired_otps(&self) -> Result<usize> {
        self.email_otp.cleanup_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::webauthn::test::StubVerifier;
    use crate::events::test::RecordingEventSink;
    use crate::mailer::test::RecordingMailer;
    use crate::session::InMemorySession;
    use crate::store::{InMemoryCredentialStore, PlainCodec};
    use std::time::Duration;

    struct Fixture {
        coordinator: MfaCoordinator,
        events: Arc<RecordingEventSink>,
    }

    fn fixture_with(config: MfaConfig) -> Fixture {
        let events = Arc::new(RecordingEventSink::new());
        let coordinator = MfaCoordinator::builder()
            .config(config)
            .store(Arc::new(InMemoryCredentialStore::new(Arc::new(PlainCodec))))
            .events(events.clone())
            .mailer(Arc::new(RecordingMailer::new()))
            .webauthn_verifier(Arc::new(StubVerifier::new()))
            .build()
            .unwrap();
        Fixture {
            coordinator,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MfaConfig::default())
    }

    fn user() -> MfaUser {
        MfaUser::new("user-1").with_email("user@example.com")
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Arc::new(InMemorySession::new())).with_ip("203.0.113.9")
    }

    #[tokio::test]
    async fn builder_requires_collaborators() {
        assert!(MfaCoordinator::builder().build().is_err());
    }

    #[tokio::test]
    async fn requires_mfa_only_with_enabled_methods() {
        let f = fixture();
        let user = user();
        let ctx = ctx();

        // No methods enabled yet.
        assert!(!f.coordinator.requires_mfa(&user, &ctx).await.unwrap());

        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        assert!(f.coordinator.requires_mfa(&user, &ctx).await.unwrap());

        // Verification satisfies the requirement.
        f.coordinator
            .mark_as_verified(&ctx, Some(DriverName::EmailOtp))
            .await
            .unwrap();
        assert!(!f.coordinator.requires_mfa(&user, &ctx).await.unwrap());
        assert_eq!(
            f.coordinator.verified_with(&ctx).await.unwrap().as_deref(),
            Some("email_otp")
        );

        f.coordinator.clear_verification(&ctx).await.unwrap();
        assert!(f.coordinator.requires_mfa(&user, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn globally_disabled_mfa_never_requires() {
        let f = fixture_with(MfaConfig::default().enabled(false));
        let user = user();
        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        assert!(!f.coordinator.requires_mfa(&user, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn verification_expires_after_timeout() {
        let f = fixture_with(MfaConfig::default().challenge_timeout(Duration::from_secs(1)));
        let ctx = ctx();

        f.coordinator.mark_as_verified(&ctx, None).await.unwrap();
        assert!(f.coordinator.is_verified(&ctx).await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!f.coordinator.is_verified(&ctx).await.unwrap());
        assert!(f.coordinator.verified_with(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_timeout_means_never_expires() {
        let f = fixture_with(MfaConfig::default().challenge_timeout(Duration::ZERO));
        let ctx = ctx();
        // Stored timestamp far in the past still verifies.
        ctx.session
            .put("mfa_verified_at", "1000".to_string())
            .await
            .unwrap();
        assert!(f.coordinator.is_verified(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn remember_me_bypass_is_opt_in() {
        let user = user();

        let f = fixture();
        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        let remembered = ctx().via_remember(true);
        assert!(f.coordinator.requires_mfa(&user, &remembered).await.unwrap());

        let f = fixture_with(MfaConfig::default().auto_verify_remembered(true));
        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        let remembered = ctx().via_remember(true);
        assert!(!f.coordinator.requires_mfa(&user, &remembered).await.unwrap());
        assert_eq!(
            f.coordinator
                .verified_with(&remembered)
                .await
                .unwrap()
                .as_deref(),
            Some("remembered")
        );
    }

    #[tokio::test]
    async fn set_primary_requires_enabled_method() {
        let f = fixture();
        let user = user();

        assert!(!f
            .coordinator
            .set_primary_method(&user, DriverName::Totp)
            .await
            .unwrap());

        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        f.coordinator
            .enable_method(&user, DriverName::WebAuthn)
            .await
            .unwrap();
        assert!(f
            .coordinator
            .set_primary_method(&user, DriverName::WebAuthn)
            .await
            .unwrap());

        let primary = f.coordinator.primary_method(&user).await.unwrap().unwrap();
        assert_eq!(primary.driver, DriverName::WebAuthn);
        assert!(f
            .events
            .kinds()
            .contains(&MfaEventKind::PrimaryMethodChanged));
    }

    #[tokio::test]
    async fn challenge_method_selection() {
        let f = fixture();
        let user = user();

        assert_eq!(
            f.coordinator.determine_challenge_method(&user).await.unwrap(),
            None
        );

        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        assert_eq!(
            f.coordinator.determine_challenge_method(&user).await.unwrap(),
            Some(DriverName::EmailOtp)
        );

        // The first method was auto-promoted, so it stays the choice even
        // with a second method enabled.
        f.coordinator
            .enable_method(&user, DriverName::WebAuthn)
            .await
            .unwrap();
        assert_eq!(
            f.coordinator.determine_challenge_method(&user).await.unwrap(),
            Some(DriverName::EmailOtp)
        );
    }

    #[tokio::test]
    async fn preferred_challenge_needs_an_enabled_method() {
        let f = fixture();
        let user = user();

        assert!(matches!(
            f.coordinator.challenge_preferred(&user, &ctx()).await,
            Err(MfaError::NoMethodsEnabled)
        ));

        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        let (driver, outcome) = f
            .coordinator
            .challenge_preferred(&user, &ctx())
            .await
            .unwrap();
        assert_eq!(driver, DriverName::EmailOtp);
        assert!(matches!(
            outcome,
            crate::driver::ChallengeOutcome::EmailSent { .. }
        ));
    }

    #[tokio::test]
    async fn disable_all_bypasses_last_method_guard() {
        let f = fixture();
        let user = user();
        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();

        assert_eq!(f.coordinator.disable_all(&user).await.unwrap(), 1);
        assert!(!f.coordinator.is_mfa_enabled(&user).await.unwrap());
        assert!(f.events.kinds().contains(&MfaEventKind::EmergencyDisabled));
    }

    #[tokio::test]
    async fn statistics_aggregate_state() {
        let f = fixture();
        let user = user();
        f.coordinator
            .enable_method(&user, DriverName::EmailOtp)
            .await
            .unwrap();

        let stats = f.coordinator.statistics(&user).await.unwrap();
        assert_eq!(stats.methods_enabled, 1);
        assert_eq!(stats.primary_method, Some(DriverName::EmailOtp));
        assert_eq!(stats.webauthn_keys, 0);
        assert_eq!(stats.backup_codes_remaining, 0);
        assert!(stats.last_used_at.is_none());

        f.coordinator
            .update_last_used(&user, DriverName::EmailOtp)
            .await
            .unwrap();
        let stats = f.coordinator.statistics(&user).await.unwrap();
        assert!(stats.last_used_at.is_some());
    }

    #[tokio::test]
    async fn disabled_driver_is_unavailable() {
        let mut totp = crate::config::TotpDriverConfig::default();
        totp.enabled = false;
        let f = fixture_with(MfaConfig::default().totp(totp));

        assert!(matches!(
            f.coordinator.driver(DriverName::Totp),
            Err(MfaError::DriverNotEnabled(_))
        ));
        assert_eq!(
            f.coordinator.available_drivers(),
            vec![DriverName::EmailOtp, DriverName::WebAuthn]
        );
        assert!(matches!(
            f.coordinator.enable_method(&user(), DriverName::Totp).await,
            Err(MfaError::DriverNotEnabled(_))
        ));
    }
}
