//! Email OTP driver.
//!
//! No secret material is enrolled; `setup` just enables the method for a user
//! with an email address. Each challenge mints a short-lived numeric code,
//! stores it with request metadata for audit, and mails it. Sends are gated
//! by a per-user throttle; redeeming a code invalidates every other code
//! still outstanding for the user.
//!
//! # Tracing Events
//!
//! - `mfa.email_otp.sent` - a code was generated and mailed
//! - `mfa.email_otp.send_failed` - the mailer refused the message
//! - `mfa.email_otp.verified` - a code was accepted

use crate::config::EmailOtpConfig;
use crate::context::{MfaUser, RequestContext};
use crate::counter::CounterStore;
use crate::driver::{
    ChallengeOutcome, DriverCore, DriverName, DriverView, MethodDriver, SetupOutcome,
};
use crate::error::{MfaError, Result};
use crate::events::{MfaEvent, MfaEventKind};
use crate::mailer::{Email, Mailer};
use crate::ratelimit::Throttle;
use crate::store::{CredentialStore, EmailOtpRecord};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::Rng;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Emailed-code second factor.
pub struct EmailOtpDriver {
    core: DriverCore,
    config: EmailOtpConfig,
    mailer: Arc<dyn Mailer>,
    throttle: Throttle,
}

impl EmailOtpDriver {
    #[must_use]
    pub fn new(
        core: DriverCore,
        config: EmailOtpConfig,
        mailer: Arc<dyn Mailer>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        let throttle = Throttle::new(counters, config.throttle);
        Self {
            core,
            config,
            mailer,
            throttle,
        }
    }

    fn throttle_key(user_id: &str) -> String {
        format!("mfa:email_throttle:{user_id}")
    }

    fn generate_code(length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }

    fn user_email(user: &MfaUser) -> Result<&str> {
        user.email
            .as_deref()
            .ok_or_else(|| MfaError::SetupFailed("user has no email address".to_string()))
    }

    /// Re-issue a code for a user mid-challenge. Same throttle gate.
    pub async fn resend(&self, user: &MfaUser, ctx: &RequestContext) -> Result<ChallengeOutcome> {
        self.challenge(user, ctx).await
    }

    /// Purge codes whose expiry has passed, across all users. Intended to be
    /// called from a periodic job; idempotent and safe under live traffic.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.core.store.delete_expired_otps(SystemTime::now()).await?;
        if removed > 0 {
            tracing::debug!(removed = removed, "Expired email OTPs purged");
        }
        Ok(removed)
    }
}

/// Mask an address for display: `jonathan@example.com` -> `jo****@example.com`.
#[must_use]
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{visible}****@{domain}")
        }
        None => "****".to_string(),
    }
}

#[async_trait]
impl MethodDriver for EmailOtpDriver {
    fn name(&self) -> DriverName {
        DriverName::EmailOtp
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
        Ok(user.email.is_some() && self.core.method_enabled(&user.id, self.name()).await?)
    }

    async fn setup(&self, user: &MfaUser, _ctx: &RequestContext) -> Result<SetupOutcome> {
        let email = Self::user_email(user)?.to_string();
        self.core
            .enable_method(user, self.name(), &self.config.display_name)
            .await?;
        Ok(SetupOutcome::EmailOtp { email })
    }

    async fn challenge(&self, user: &MfaUser, ctx: &RequestContext) -> Result<ChallengeOutcome> {
        let email = Self::user_email(user)?.to_string();
        self.throttle.check(&Self::throttle_key(&user.id)).await?;

        let code = Self::generate_code(self.config.code_length);
        let now = SystemTime::now();
        let record = EmailOtpRecord {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            code: code.clone(),
            expires_at: now + self.config.expires_in,
            verified_at: None,
            created_at: now,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
        };
        let otp_id = record.id;
        self.core.store.insert_email_otp(record).await?;

        let minutes = self.config.expires_in.as_secs() / 60;
        let greeting = user.display_name.as_deref().unwrap_or("there");
        let message = Email::new(
            self.config.from_address.as_str(),
            email.as_str(),
            self.config.subject.as_str(),
        )
            .from_name(self.config.from_name.as_str())
            .text(format!(
                "Hi {greeting},\n\n\
                 Your verification code is: {code}\n\n\
                 It expires in {minutes} minutes. If you did not request this code, \
                 you can ignore this email."
            ));
        if let Err(e) = self.mailer.send(&message).await {
            tracing::error!(
                target: "mfa.email_otp.send_failed",
                user_id = %user.id,
                error = %e,
                "Failed to send verification code"
            );
            return Err(MfaError::SetupFailed(
                "Failed to send verification code".to_string(),
            ));
        }

        self.throttle.set(&Self::throttle_key(&user.id)).await?;

        let masked_email = mask_email(&email);
        tracing::info!(
            target: "mfa.email_otp.sent",
            user_id = %user.id,
            email = %masked_email,
            otp_id = %otp_id,
            "Verification code sent"
        );
        self.core.emit(
            MfaEvent::new(MfaEventKind::ChallengeIssued, &user.id, Some(self.name()))
                .with_detail(masked_email.clone()),
        );

        Ok(ChallengeOutcome::EmailSent {
            masked_email,
            expires_in: self.config.expires_in,
            otp_id,
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

        let redeemed = self
            .core
            .store
            .consume_email_otp(&user.id, credential.trim(), SystemTime::now())
            .await?;

        // An expired code and a wrong code fail identically.
        if redeemed.is_none() {
            self.core.record_failure(self.name(), user, ctx).await?;
            self.core.emit(MfaEvent::new(
                MfaEventKind::VerificationFailed,
                &user.id,
                Some(self.name()),
            ));
            return Ok(false);
        }

        // Enablement happens at setup, never here: a code mailed before an
        // emergency disable must not bring the method back.
        self.core.clear_rate_limit(self.name(), user, ctx).await?;
        self.core.touch(&user.id, self.name()).await?;
        tracing::info!(
            target: "mfa.email_otp.verified",
            user_id = %user.id,
            "Email OTP verification succeeded"
        );
        self.core
            .emit(MfaEvent::new(MfaEventKind::Verified, &user.id, Some(self.name())));
        Ok(true)
    }

    async fn disable(&self, user: &MfaUser) -> Result<()> {
        self.core.disable_method(user, self.name()).await?;
        self.core.store.delete_email_otps(&user.id).await?;
        self.core.store.delete_method(&user.id, self.name()).await?;
        Ok(())
    }

    async fn data(&self, user: &MfaUser) -> Result<Option<DriverView>> {
        if self.core.store.get_method(&user.id, self.name()).await?.is_none() {
            return Ok(None);
        }
        let latest = self.core.store.latest_email_otp(&user.id).await?;
        let can_resend = self
            .throttle
            .remaining(&Self::throttle_key(&user.id))
            .await?
            .is_none();
        Ok(Some(DriverView::EmailOtp {
            email: user.email.as_deref().map(mask_email),
            last_sent_at: latest.map(|otp| otp.created_at),
            can_resend,
        }))
    }

    fn validate_verification(&self, credential: &str) -> Result<()> {
        let trimmed = credential.trim();
        if trimmed.len() != self.config.code_length
            || !trimmed.chars().all(|c| c.is_ascii_digit())
        {
            return Err(MfaError::InvalidCode);
        }
        Ok(())
    }
}
