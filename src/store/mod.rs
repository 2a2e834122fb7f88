//! Persistent credential storage.
//!
//! [`CredentialStore`] is the single seam between the drivers and whatever
//! database the host application runs. The records mirror one table each:
//! enabled methods, TOTP secrets, email OTP audit rows, and WebAuthn keys.
//! Operations that must be at-most-once under concurrency (backup code
//! consumption, email OTP consumption) are specified as atomic on the trait
//! so every backend upholds them, not just the in-memory one.

use crate::driver::DriverName;
use crate::error::Result;
use async_trait::async_trait;
use std::time::SystemTime;
use uuid::Uuid;

pub mod codec;
pub mod memory;

pub use codec::{ChaChaSecretCodec, PlainCodec, SecretCodec};
pub use memory::InMemoryCredentialStore;

/// One enabled (or previously enabled) method for a user.
#[derive(Clone, Debug)]
pub struct MfaMethodRecord {
    pub user_id: String,
    pub driver: DriverName,
    /// Display name captured at enable time.
    pub display_name: String,
    /// Exactly one enabled method per user is primary.
    pub is_primary: bool,
    pub is_enabled: bool,
    pub created_at: SystemTime,
    pub last_used_at: Option<SystemTime>,
}

/// A user's TOTP enrolment: the shared secret and remaining backup codes.
///
/// `secret` and `backup_codes` are plaintext on this struct; the store
/// applies its [`SecretCodec`] when the record crosses the persistence
/// boundary.
#[derive(Clone, Debug)]
pub struct TotpSecretRecord {
    pub user_id: String,
    /// Base32-encoded shared secret.
    pub secret: String,
    /// Unused backup codes, stored in display form (with hyphens).
    pub backup_codes: Vec<String>,
    /// Set on the first successful verification; `None` means setup is
    /// pending and the method is not yet enabled.
    pub verified_at: Option<SystemTime>,
}

/// One issued email OTP, kept as an audit row after use.
#[derive(Clone, Debug)]
pub struct EmailOtpRecord {
    pub id: Uuid,
    pub user_id: String,
    pub code: String,
    pub expires_at: SystemTime,
    /// Set when consumed; a non-`None` value means the code is spent.
    pub verified_at: Option<SystemTime>,
    pub created_at: SystemTime,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl EmailOtpRecord {
    /// Whether the code can still be redeemed at `now`.
    #[must_use]
    pub fn is_valid(&self, now: SystemTime) -> bool {
        self.verified_at.is_none() && now < self.expires_at
    }
}

/// One registered WebAuthn credential.
#[derive(Clone, Debug)]
pub struct WebAuthnKeyRecord {
    pub id: Uuid,
    pub user_id: String,
    /// User-chosen label ("YubiKey 5", "MacBook Touch ID").
    pub name: String,
    /// Base64url credential id as returned by the authenticator.
    pub credential_id: String,
    /// COSE public key, base64-encoded.
    pub public_key: String,
    pub aaguid: Option<String>,
    /// Signature counter from the last accepted assertion.
    pub counter: u32,
    pub transports: Vec<String>,
    pub attestation_format: Option<String>,
    pub created_at: SystemTime,
    pub last_used_at: Option<SystemTime>,
}

/// Durable storage for MFA credentials and method state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // Method registry -----------------------------------------------------

    /// Fetch a user's record for one driver, enabled or not.
    async fn get_method(&self, user_id: &str, driver: DriverName)
        -> Result<Option<MfaMethodRecord>>;

    /// All method records for a user.
    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethodRecord>>;

    /// Insert or replace a method record.
    async fn save_method(&self, record: MfaMethodRecord) -> Result<()>;

    /// Flip a method's enabled flag. No-op when the record is absent.
    async fn set_method_enabled(
        &self,
        user_id: &str,
        driver: DriverName,
        enabled: bool,
    ) -> Result<()>;

    /// Make `driver` the user's primary method, clearing the flag on every
    /// other record. `None` clears the flag everywhere.
    async fn set_primary(&self, user_id: &str, driver: Option<DriverName>) -> Result<()>;

    /// Stamp a method's `last_used_at`.
    async fn touch_method(&self, user_id: &str, driver: DriverName, at: SystemTime) -> Result<()>;

    /// Disable every method record for a user, returning how many were
    /// enabled before the call.
    async fn disable_all_methods(&self, user_id: &str) -> Result<usize>;

    /// Remove a method record entirely.
    async fn delete_method(&self, user_id: &str, driver: DriverName) -> Result<()>;

    // TOTP -----------------------------------------------------------------

    async fn get_totp(&self, user_id: &str) -> Result<Option<TotpSecretRecord>>;

    /// Insert or replace a user's TOTP enrolment.
    async fn save_totp(&self, record: TotpSecretRecord) -> Result<()>;

    /// Record the first successful verification.
    async fn mark_totp_verified(&self, user_id: &str, at: SystemTime) -> Result<()>;

    /// Atomically consume the backup code matching `code` (compared in
    /// normalized form). Returns `true` and removes the code when it
    /// matched; two concurrent calls with the same code succeed at most
    /// once between them.
    async fn consume_backup_code(&self, user_id: &str, code: &str) -> Result<bool>;

    /// Replace the remaining backup codes with a fresh batch.
    async fn replace_backup_codes(&self, user_id: &str, codes: Vec<String>) -> Result<()>;

    async fn delete_totp(&self, user_id: &str) -> Result<()>;

    // Email OTP ------------------------------------------------------------

    async fn insert_email_otp(&self, record: EmailOtpRecord) -> Result<()>;

    /// Atomically redeem the newest still-valid OTP matching `code`. On a
    /// match, marks it verified at `now`, invalidates every other
    /// outstanding code for the user, and returns the redeemed row.
    async fn consume_email_otp(
        &self,
        user_id: &str,
        code: &str,
        now: SystemTime,
    ) -> Result<Option<EmailOtpRecord>>;

    /// The most recently issued OTP row for a user, spent or not.
    async fn latest_email_otp(&self, user_id: &str) -> Result<Option<EmailOtpRecord>>;

    /// Remove all OTP rows for a user.
    async fn delete_email_otps(&self, user_id: &str) -> Result<()>;

    /// Purge rows whose expiry has passed, across all users. Returns the
    /// number removed.
    async fn delete_expired_otps(&self, now: SystemTime) -> Result<usize>;

    // WebAuthn -------------------------------------------------------------

    async fn insert_webauthn_key(&self, record: WebAuthnKeyRecord) -> Result<()>;

    async fn get_webauthn_key(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<WebAuthnKeyRecord>>;

    async fn list_webauthn_keys(&self, user_id: &str) -> Result<Vec<WebAuthnKeyRecord>>;

    async fn count_webauthn_keys(&self, user_id: &str) -> Result<usize>;

    /// Store the counter from an accepted assertion and stamp
    /// `last_used_at`.
    async fn update_webauthn_key_usage(
        &self,
        user_id: &str,
        credential_id: &str,
        counter: u32,
        at: SystemTime,
    ) -> Result<()>;

    /// Rename a key by row id. Returns `false` when no such key exists.
    async fn rename_webauthn_key(&self, user_id: &str, key_id: Uuid, name: &str) -> Result<bool>;

    /// Delete a key by row id. Returns `false` when no such key exists.
    async fn delete_webauthn_key(&self, user_id: &str, key_id: Uuid) -> Result<bool>;

    /// Delete every key for a user.
    async fn delete_webauthn_keys(&self, user_id: &str) -> Result<()>;
}
