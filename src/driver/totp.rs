//! TOTP (authenticator app) driver.
//!
//! Enrolment is two-phase: `setup` generates the secret and backup codes but
//! leaves the method disabled until the user proves possession with a first
//! successful `verify`. Backup codes ride on the same `verify` entry point,
//! distinguished by length, so a failed attempt never reveals which check
//! ran.
//!
//! # Tracing Events
//!
//! - `mfa.totp.setup` - secret generated, awaiting first verification
//! - `mfa.totp.verified` - a code or backup code was accepted
//! - `mfa.totp.backup_used` - a backup code was consumed

use crate::config::TotpDriverConfig;
use crate::context::{MfaUser, RequestContext};
use crate::driver::{
    backup, ChallengeOutcome, DriverCore, DriverName, DriverView, MethodDriver, RecoveryOption,
    SetupOutcome,
};
use crate::error::{MfaError, Result};
use crate::events::{MfaEvent, MfaEventKind};
use crate::store::{CredentialStore, TotpSecretRecord};
use async_trait::async_trait;
use std::time::SystemTime;
use totp_rs::{Secret, TOTP};

/// Authenticator-app second factor.
pub struct TotpDriver {
    core: DriverCore,
    config: TotpDriverConfig,
}

impl TotpDriver {
    #[must_use]
    pub fn new(core: DriverCore, config: TotpDriverConfig) -> Self {
        Self { core, config }
    }

    fn build_totp(&self, secret: &str, account_name: &str) -> Result<TOTP> {
        TOTP::new(
            self.config.algorithm,
            self.config.digits,
            self.config.window,
            self.config.period,
            Secret::Encoded(secret.to_string())
                .to_bytes()
                .map_err(|e| MfaError::internal(format!("Invalid TOTP secret: {e}")))?,
            Some(self.config.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| MfaError::internal(format!("Failed to build TOTP: {e}")))
    }

    /// Check a code against the stored secret, honoring the drift window.
    ///
    /// System-time failures read as a plain miss rather than an error; the
    /// caller must not learn why verification failed. A secret that cannot
    /// be loaded at all is a different matter and surfaces as a typed
    /// verification failure, with the backend detail kept to the logs.
    fn check_code(&self, secret: &str, code: &str, account_name: &str) -> Result<bool> {
        let totp = self.build_totp(secret, account_name).map_err(|e| {
            tracing::error!(user = %account_name, error = %e, "Stored TOTP secret could not be loaded");
            MfaError::VerificationFailed("verification could not be completed".to_string())
        })?;
        let code = code.replace([' ', '-'], "");
        match totp.check_current(&code) {
            Ok(valid) => Ok(valid),
            Err(e) => {
                tracing::warn!(error = %e, "TOTP check failed (system time issue?)");
                Ok(false)
            }
        }
    }

    #[cfg(test)]
    fn check_code_at(&self, secret: &str, code: &str, account_name: &str, time: u64) -> bool {
        self.build_totp(secret, account_name)
            .map(|totp| totp.check(&code.replace([' ', '-'], ""), time))
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn generate_code_at(&self, secret: &str, account_name: &str, time: u64) -> String {
        self.build_totp(secret, account_name).unwrap().generate(time)
    }

    /// Issue a fresh batch of backup codes, replacing any that remain.
    ///
    /// The returned codes are shown to the user exactly once.
    pub async fn regenerate_backup_codes(&self, user: &MfaUser) -> Result<Vec<String>> {
        if self.core.store.get_totp(&user.id).await?.is_none() {
            return Err(MfaError::MethodNotConfigured(self.name().to_string()));
        }
        let codes = backup::generate_codes(
            self.config.backup_code_count,
            self.config.backup_code_length,
        );
        self.core
            .store
            .replace_backup_codes(&user.id, codes.clone())
            .await?;
        self.core.emit(MfaEvent::new(
            MfaEventKind::BackupCodesRegenerated,
            &user.id,
            Some(self.name()),
        ));
        Ok(codes)
    }

    /// Redeem a backup code through an explicit recovery flow.
    ///
    /// Unlike [`MethodDriver::verify`], which folds backup codes into the
    /// ordinary code path and fails opaquely, this reports precisely: an
    /// exhausted batch is distinguishable from a code that is wrong or
    /// already spent. Meant for a UI that has asked for a backup code
    /// outright (see [`MethodDriver::recovery_options`]).
    pub async fn redeem_backup_code(
        &self,
        user: &MfaUser,
        code: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.core.check_rate_limit(self.name(), user, ctx).await?;

        let Some(record) = self.core.store.get_totp(&user.id).await? else {
            return Err(MfaError::MethodNotConfigured(self.name().to_string()));
        };
        if record.backup_codes.is_empty() {
            return Err(MfaError::NoBackupCodes);
        }
        if !self.core.store.consume_backup_code(&user.id, code).await? {
            self.handle_failure(user, ctx).await?;
            return Err(MfaError::InvalidBackupCode);
        }

        tracing::info!(
            target: "mfa.totp.backup_used",
            user_id = %user.id,
            "Backup code consumed"
        );
        self.core.emit(MfaEvent::new(
            MfaEventKind::BackupCodeUsed,
            &user.id,
            Some(self.name()),
        ));
        self.handle_success(user, ctx, &record).await
    }

    async fn handle_success(
        &self,
        user: &MfaUser,
        ctx: &RequestContext,
        record: &TotpSecretRecord,
    ) -> Result<()> {
        if record.verified_at.is_none() {
            // First success completes enrolment.
            self.core
                .store
                .mark_totp_verified(&user.id, SystemTime::now())
                .await?;
            self.core
                .enable_method(user, self.name(), &self.config.display_name)
                .await?;
        }
        self.core.clear_rate_limit(self.name(), user, ctx).await?;
        self.core.touch(&user.id, self.name()).await?;
        tracing::info!(
            target: "mfa.totp.verified",
            user_id = %user.id,
            "TOTP verification succeeded"
        );
        self.core
            .emit(MfaEvent::new(MfaEventKind::Verified, &user.id, Some(self.name())));
        Ok(())
    }

    async fn handle_failure(&self, user: &MfaUser, ctx: &RequestContext) -> Result<()> {
        self.core.record_failure(self.name(), user, ctx).await?;
        self.core.emit(MfaEvent::new(
            MfaEventKind::VerificationFailed,
            &user.id,
            Some(self.name()),
        ));
        Ok(())
    }
}

#[async_trait]
impl MethodDriver for TotpDriver {
    fn name(&self) -> DriverName {
        DriverName::Totp
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn is_configured(&self, user: &MfaUser) -> Result<bool> {
        Ok(self
            .core
            .store
            .get_totp(&user.id)
            .await?
            .is_some_and(|r| r.verified_at.is_some()))
    }

    async fn setup(&self, user: &MfaUser, _ctx: &RequestContext) -> Result<SetupOutcome> {
        if self.core.store.get_totp(&user.id).await?.is_some() {
            return Err(MfaError::SetupFailed(
                "TOTP is already set up for this user".to_string(),
            ));
        }

        let secret = Secret::generate_secret().to_encoded().to_string();
        let backup_codes = backup::generate_codes(
            self.config.backup_code_count,
            self.config.backup_code_length,
        );
        let provisioning_uri = self.build_totp(&secret, user.label())?.get_url();

        self.core
            .store
            .save_totp(TotpSecretRecord {
                user_id: user.id.clone(),
                secret: secret.clone(),
                backup_codes: backup_codes.clone(),
                verified_at: None,
            })
            .await?;

        tracing::info!(
            target: "mfa.totp.setup",
            user_id = %user.id,
            "TOTP secret generated, awaiting first verification"
        );
        self.core.emit(MfaEvent::new(
            MfaEventKind::SetupStarted,
            &user.id,
            Some(self.name()),
        ));

        Ok(SetupOutcome::Totp {
            secret,
            provisioning_uri,
            backup_codes,
        })
    }

    async fn challenge(&self, user: &MfaUser, _ctx: &RequestContext) -> Result<ChallengeOutcome> {
        if self.core.store.get_totp(&user.id).await?.is_none() {
            return Err(MfaError::MethodNotConfigured(self.name().to_string()));
        }
        self.core.emit(MfaEvent::new(
            MfaEventKind::ChallengeIssued,
            &user.id,
            Some(self.name()),
        ));
        Ok(ChallengeOutcome::Prompt {
            message: "Enter the code from your authenticator app".to_string(),
        })
    }

    async fn verify(
        &self,
        user: &MfaUser,
        credential: &str,
        ctx: &RequestContext,
    ) -> Result<bool> {
        self.validate_verification(credential)?;
        self.core.check_rate_limit(self.name(), user, ctx).await?;

        let Some(record) = self.core.store.get_totp(&user.id).await? else {
            // A probe against an unenrolled account still burns an attempt.
            self.core.record_failure(self.name(), user, ctx).await?;
            return Err(MfaError::MethodNotConfigured(self.name().to_string()));
        };

        let normalized = backup::normalize(credential);
        let ok = if normalized.len() > self.config.digits {
            let consumed = self
                .core
                .store
                .consume_backup_code(&user.id, credential)
                .await?;
            if consumed {
                tracing::info!(
                    target: "mfa.totp.backup_used",
                    user_id = %user.id,
                    "Backup code consumed"
                );
                self.core.emit(MfaEvent::new(
                    MfaEventKind::BackupCodeUsed,
                    &user.id,
                    Some(self.name()),
                ));
            }
            consumed
        } else {
            self.check_code(&record.secret, credential, user.label())?
        };

        if ok {
            self.handle_success(user, ctx, &record).await?;
        } else {
            self.handle_failure(user, ctx).await?;
        }
        Ok(ok)
    }

    async fn disable(&self, user: &MfaUser) -> Result<()> {
        self.core.disable_method(user, self.name()).await?;
        self.core.store.delete_totp(&user.id).await?;
        self.core.store.delete_method(&user.id, self.name()).await?;
        Ok(())
    }

    async fn data(&self, user: &MfaUser) -> Result<Option<DriverView>> {
        Ok(self
            .core
            .store
            .get_totp(&user.id)
            .await?
            .map(|record| DriverView::Totp {
                verified_at: record.verified_at,
                remaining_backup_codes: record.backup_codes.len(),
            }))
    }

    fn validate_verification(&self, credential: &str) -> Result<()> {
        let normalized = backup::normalize(credential);
        if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MfaError::InvalidCode);
        }
        Ok(())
    }

    async fn recovery_options(&self, user: &MfaUser) -> Result<Vec<RecoveryOption>> {
        let Some(record) = self.core.store.get_totp(&user.id).await? else {
            return Ok(Vec::new());
        };
        if record.backup_codes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![RecoveryOption {
            id: "backup_code".to_string(),
            remaining: record.backup_codes.len(),
            description: "Use one of your single-use backup codes".to_string(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::driver::test::CoreFixture;
    use crate::session::InMemorySession;
    use std::sync::Arc;
    use std::time::Duration;

    fn driver(fx: &CoreFixture) -> TotpDriver {
        TotpDriver::new(fx.core.clone(), TotpDriverConfig::new("TestApp"))
    }

    fn user() -> MfaUser {
        MfaUser::new("user-1").with_email("user@example.com")
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Arc::new(InMemorySession::new())).with_ip("203.0.113.9")
    }

    async fn set_up(driver: &TotpDriver, user: &MfaUser) -> (String, Vec<String>) {
        match driver.setup(user, &ctx()).await.unwrap() {
            SetupOutcome::Totp {
                secret,
                provisioning_uri,
                backup_codes,
            } => {
                assert!(provisioning_uri.starts_with("otpauth://totp/"));
                (secret, backup_codes)
            }
            other => panic!("expected TOTP setup outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn setup_generates_secret_and_backup_codes() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();

        let (secret, codes) = set_up(&driver, &user).await;
        assert!(!secret.is_empty());
        assert_eq!(codes.len(), 8);

        // Setup left the method pending, not enabled.
        assert!(!driver.is_configured(&user).await.unwrap());
        assert!(!fx.core.method_enabled("user-1", DriverName::Totp).await.unwrap());

        // A second setup is refused while one is pending.
        assert!(matches!(
            driver.setup(&user, &ctx()).await,
            Err(MfaError::SetupFailed(_))
        ));
    }

    #[tokio::test]
    async fn first_success_enables_and_promotes() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        let (secret, _) = set_up(&driver, &user).await;

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let code = driver.generate_code_at(&secret, user.label(), now);
        assert!(driver.verify(&user, &code, &ctx()).await.unwrap());

        assert!(driver.is_configured(&user).await.unwrap());
        let methods = fx.store.list_methods("user-1").await.unwrap();
        assert!(methods[0].is_enabled && methods[0].is_primary);
        assert!(methods[0].last_used_at.is_some());
        assert!(fx.events.kinds().contains(&MfaEventKind::MethodEnabled));
    }

    #[tokio::test]
    async fn wrong_code_is_a_plain_failure() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        set_up(&driver, &user).await;

        assert!(!driver.verify(&user, "000000", &ctx()).await.unwrap());
        assert!(fx.events.kinds().contains(&MfaEventKind::VerificationFailed));
    }

    #[tokio::test]
    async fn drift_window_boundary() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        let (secret, _) = set_up(&driver, &user).await;

        // Step-aligned base (divisible by the 30s period); the code is
        // minted in the final second of its step so the acceptance window
        // ends exactly one step after minting.
        let base = 1_699_999_980u64;
        let minted = base + 29;
        let code = driver.generate_code_at(&secret, user.label(), minted);

        // One step of drift in either direction is accepted.
        assert!(driver.check_code_at(&secret, &code, user.label(), minted + 30));
        assert!(driver.check_code_at(&secret, &code, user.label(), base - 30));
        // The first second past the window is rejected, both ways.
        assert!(!driver.check_code_at(&secret, &code, user.label(), minted + 31));
        assert!(!driver.check_code_at(&secret, &code, user.label(), base - 31));
    }

    #[tokio::test]
    async fn backup_code_is_single_use() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        let (_, codes) = set_up(&driver, &user).await;

        assert!(driver.verify(&user, &codes[0], &ctx()).await.unwrap());
        match driver.data(&user).await.unwrap().unwrap() {
            DriverView::Totp {
                remaining_backup_codes,
                verified_at,
            } => {
                assert_eq!(remaining_backup_codes, 7);
                assert!(verified_at.is_some());
            }
            other => panic!("unexpected view {other:?}"),
        }

        // Replay fails.
        assert!(!driver.verify(&user, &codes[0], &ctx()).await.unwrap());
        assert!(fx.events.kinds().contains(&MfaEventKind::BackupCodeUsed));
    }

    #[tokio::test]
    async fn explicit_redemption_reports_precisely() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        let (_, codes) = set_up(&driver, &user).await;

        driver.redeem_backup_code(&user, &codes[0], &ctx()).await.unwrap();
        assert!(driver.is_configured(&user).await.unwrap());

        // A spent code and a wrong code both read as invalid.
        assert!(matches!(
            driver.redeem_backup_code(&user, &codes[0], &ctx()).await,
            Err(MfaError::InvalidBackupCode)
        ));

        for code in &codes[1..] {
            driver.redeem_backup_code(&user, code, &ctx()).await.unwrap();
        }

        // An exhausted batch is its own answer.
        assert!(matches!(
            driver.redeem_backup_code(&user, "AAAA-AAAA-AA", &ctx()).await,
            Err(MfaError::NoBackupCodes)
        ));

        // And an unenrolled user cannot redeem at all.
        let stranger = MfaUser::new("user-2");
        assert!(matches!(
            driver.redeem_backup_code(&stranger, &codes[0], &ctx()).await,
            Err(MfaError::MethodNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn unloadable_secret_is_a_typed_failure() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        fx.store
            .save_totp(crate::store::TotpSecretRecord {
                user_id: "user-1".to_string(),
                secret: "not base32 !!".to_string(),
                backup_codes: Vec::new(),
                verified_at: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            driver.verify(&user, "123456", &ctx()).await,
            Err(MfaError::VerificationFailed(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_failures() {
        let fx = CoreFixture::with_rate_limit(RateLimitConfig::new(
            5,
            Duration::from_secs(900),
        ));
        let driver = driver(&fx);
        let user = user();
        set_up(&driver, &user).await;

        let ctx = ctx();
        for _ in 0..5 {
            assert!(!driver.verify(&user, "000000", &ctx).await.unwrap());
        }
        assert!(matches!(
            driver.verify(&user, "000000", &ctx).await,
            Err(MfaError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn unenrolled_verify_counts_an_attempt() {
        let fx = CoreFixture::with_rate_limit(RateLimitConfig::new(
            2,
            Duration::from_secs(900),
        ));
        let driver = driver(&fx);
        let user = user();
        let ctx = ctx();

        for _ in 0..2 {
            assert!(matches!(
                driver.verify(&user, "123456", &ctx).await,
                Err(MfaError::MethodNotConfigured(_))
            ));
        }
        assert!(matches!(
            driver.verify(&user, "123456", &ctx).await,
            Err(MfaError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn regenerate_replaces_remaining_codes() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        let user = user();
        let (_, original) = set_up(&driver, &user).await;

        let fresh = driver.regenerate_backup_codes(&user).await.unwrap();
        assert_eq!(fresh.len(), 8);
        assert_ne!(fresh, original);

        // Old codes are dead.
        assert!(!driver.verify(&user, &original[0], &ctx()).await.unwrap());
        assert!(driver.verify(&user, &fresh[0], &ctx()).await.unwrap());

        let options = driver.recovery_options(&user).await.unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].remaining, 7);
    }

    #[tokio::test]
    async fn validation_rejects_garbage() {
        let fx = CoreFixture::new();
        let driver = driver(&fx);
        assert!(driver.validate_verification("").is_err());
        assert!(driver.validate_verification("  ").is_err());
        assert!(driver.validate_verification("12#456").is_err());
        assert!(driver.validate_verification("123456").is_ok());
        assert!(driver.validate_verification("ABCD-EFGH-12").is_ok());
    }
}
