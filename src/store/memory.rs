//! In-memory credential store.
//!
//! Backs tests and single-process deployments. One mutex guards all four
//! tables, which is what makes the consume operations atomic: a backup code
//! or email OTP checked and removed under the same lock can be redeemed at
//! most once no matter how many tasks race on it.

use crate::driver::backup;
use crate::driver::DriverName;
use crate::error::Result;
use crate::store::{
    CredentialStore, EmailOtpRecord, MfaMethodRecord, SecretCodec, TotpSecretRecord,
    WebAuthnKeyRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// Method records per user, in enable order.
    methods: HashMap<String, Vec<MfaMethodRecord>>,
    /// TOTP enrolments, secret material held in encoded form.
    totp: HashMap<String, TotpSecretRecord>,
    otps: Vec<EmailOtpRecord>,
    keys: Vec<WebAuthnKeyRecord>,
}

/// Credential store held entirely in process memory.
pub struct InMemoryCredentialStore {
    inner: Mutex<Inner>,
    codec: Arc<dyn SecretCodec>,
}

impl InMemoryCredentialStore {
    /// Create a store that encrypts secrets with the given codec.
    #[must_use]
    pub fn new(codec: Arc<dyn SecretCodec>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            codec,
        }
    }

    fn decode_totp(&self, record: &TotpSecretRecord) -> Result<TotpSecretRecord> {
        let mut codes = Vec::with_capacity(record.backup_codes.len());
        for code in &record.backup_codes {
            codes.push(self.codec.decrypt(&record.user_id, code)?);
        }
        Ok(TotpSecretRecord {
            user_id: record.user_id.clone(),
            secret: self.codec.decrypt(&record.user_id, &record.secret)?,
            backup_codes: codes,
            verified_at: record.verified_at,
        })
    }

    fn encode_codes(&self, user_id: &str, codes: &[String]) -> Result<Vec<String>> {
        codes
            .iter()
            .map(|c| self.codec.encrypt(user_id, c))
            .collect()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_method(
        &self,
        user_id: &str,
        driver: DriverName,
    ) -> Result<Option<MfaMethodRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .methods
            .get(user_id)
            .and_then(|records| records.iter().find(|r| r.driver == driver).cloned()))
    }

    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethodRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.methods.get(user_id).cloned().unwrap_or_default())
    }

    async fn save_method(&self, record: MfaMethodRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let records = inner.methods.entry(record.user_id.clone()).or_default();
        match records.iter_mut().find(|r| r.driver == record.driver) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn set_method_enabled(
        &self,
        user_id: &str,
        driver: DriverName,
        enabled: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(records) = inner.methods.get_mut(user_id) {
            if let Some(record) = records.iter_mut().find(|r| r.driver == driver) {
                record.is_enabled = enabled;
            }
        }
        Ok(())
    }

    async fn set_primary(&self, user_id: &str, driver: Option<DriverName>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(records) = inner.methods.get_mut(user_id) {
            for record in records.iter_mut() {
                record.is_primary = Some(record.driver) == driver;
            }
        }
        Ok(())
    }

    async fn touch_method(&self, user_id: &str, driver: DriverName, at: SystemTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(records) = inner.methods.get_mut(user_id) {
            if let Some(record) = records.iter_mut().find(|r| r.driver == driver) {
                record.last_used_at = Some(at);
            }
        }
        Ok(())
    }

    async fn disable_all_methods(&self, user_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut disabled = 0;
        if let Some(records) = inner.methods.get_mut(user_id) {
            for record in records.iter_mut() {
                if record.is_enabled {
                    disabled += 1;
                }
                record.is_enabled = false;
                record.is_primary = false;
            }
        }
        Ok(disabled)
    }

    async fn delete_method(&self, user_id: &str, driver: DriverName) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(records) = inner.methods.get_mut(user_id) {
            records.retain(|r| r.driver != driver);
        }
        Ok(())
    }

    async fn get_totp(&self, user_id: &str) -> Result<Option<TotpSecretRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .totp
            .get(user_id)
            .map(|record| self.decode_totp(record))
            .transpose()
    }

    async fn save_totp(&self, record: TotpSecretRecord) -> Result<()> {
        let encoded = TotpSecretRecord {
            secret: self.codec.encrypt(&record.user_id, &record.secret)?,
            backup_codes: self.encode_codes(&record.user_id, &record.backup_codes)?,
            user_id: record.user_id,
            verified_at: record.verified_at,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.totp.insert(encoded.user_id.clone(), encoded);
        Ok(())
    }

    async fn mark_totp_verified(&self, user_id: &str, at: SystemTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.totp.get_mut(user_id) {
            record.verified_at = Some(at);
        }
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: &str, code: &str) -> Result<bool> {
        // Decrypt and compare under the lock so two racing redemptions of
        // the same code cannot both observe it present.
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.totp.get_mut(user_id) else {
            return Ok(false);
        };
        let mut matched = None;
        for (idx, stored) in record.backup_codes.iter().enumerate() {
            let plain = self.codec.decrypt(user_id, stored)?;
            if backup::codes_match(&plain, code) {
                matched = Some(idx);
                break;
            }
        }
        match matched {
            Some(idx) => {
                record.backup_codes.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_backup_codes(&self, user_id: &str, codes: Vec<String>) -> Result<()> {
        let encoded = self.encode_codes(user_id, &codes)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.totp.get_mut(user_id) {
            record.backup_codes = encoded;
        }
        Ok(())
    }

    async fn delete_totp(&self, user_id: &str) -> Result<()> {
        self.inner.lock().unwrap().totp.remove(user_id);
        Ok(())
    }

    async fn insert_email_otp(&self, record: EmailOtpRecord) -> Result<()> {
        self.inner.lock().unwrap().otps.push(record);
        Ok(())
    }

    async fn consume_email_otp(
        &self,
        user_id: &str,
        code: &str,
        now: SystemTime,
    ) -> Result<Option<EmailOtpRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let winner = inner
            .otps
            .iter()
            .enumerate()
            .filter(|(_, otp)| otp.user_id == user_id && otp.is_valid(now) && otp.code == code)
            .max_by_key(|(_, otp)| otp.created_at)
            .map(|(idx, _)| idx);
        let Some(idx) = winner else {
            return Ok(None);
        };
        inner.otps[idx].verified_at = Some(now);
        let redeemed = inner.otps[idx].clone();
        // Outstanding sibling codes die with the redemption. They are
        // stamped verified rather than expired so audit views keep the
        // real expiry.
        for otp in inner.otps.iter_mut() {
            if otp.user_id == user_id && otp.id != redeemed.id && otp.is_valid(now) {
                otp.verified_at = Some(now);
            }
        }
        Ok(Some(redeemed))
    }

    async fn latest_email_otp(&self, user_id: &str) -> Result<Option<EmailOtpRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .otps
            .iter()
            .filter(|otp| otp.user_id == user_id)
            .max_by_key(|otp| otp.created_at)
            .cloned())
    }

    async fn delete_email_otps(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.otps.retain(|otp| otp.user_id != user_id);
        Ok(())
    }

    async fn delete_expired_otps(&self, now: SystemTime) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.otps.len();
        inner.otps.retain(|otp| now < otp.expires_at);
        Ok(before - inner.otps.len())
    }

    async fn insert_webauthn_key(&self, record: WebAuthnKeyRecord) -> Result<()> {
        self.inner.lock().unwrap().keys.push(record);
        Ok(())
    }

    async fn get_webauthn_key(
        &self,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<WebAuthnKeyRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .keys
            .iter()
            .find(|k| k.user_id == user_id && k.credential_id == credential_id)
            .cloned())
    }

    async fn list_webauthn_keys(&self, user_id: &str) -> Result<Vec<WebAuthnKeyRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn count_webauthn_keys(&self, user_id: &str) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.keys.iter().filter(|k| k.user_id == user_id).count())
    }

    async fn update_webauthn_key_usage(
        &self,
        user_id: &str,
        credential_id: &str,
        counter: u32,
        at: SystemTime,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner
            .keys
            .iter_mut()
            .find(|k| k.user_id == user_id && k.credential_id == credential_id)
        {
            key.counter = counter;
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn rename_webauthn_key(&self, user_id: &str, key_id: Uuid, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .keys
            .iter_mut()
            .find(|k| k.user_id == user_id && k.id == key_id)
        {
            Some(key) => {
                key.name = name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_webauthn_key(&self, user_id: &str, key_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.keys.len();
        inner.keys.retain(|k| !(k.user_id == user_id && k.id == key_id));
        Ok(inner.keys.len() < before)
    }

    async fn delete_webauthn_keys(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.keys.retain(|k| k.user_id != user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PlainCodec;
    use std::time::Duration;

    fn store() -> InMemoryCredentialStore {
        InMemoryCredentialStore::new(Arc::new(PlainCodec))
    }

    fn method(user: &str, driver: DriverName) -> MfaMethodRecord {
        MfaMethodRecord {
            user_id: user.to_string(),
            driver,
            display_name: driver.as_str().to_string(),
            is_primary: false,
            is_enabled: true,
            created_at: SystemTime::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn save_method_upserts() {
        let store = store();
        store.save_method(method("u", DriverName::Totp)).await.unwrap();
        let mut updated = method("u", DriverName::Totp);
        updated.is_primary = true;
        store.save_method(updated).await.unwrap();

        let records = store.list_methods("u").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_primary);
    }

    #[tokio::test]
    async fn set_primary_is_exclusive() {
        let store = store();
        store.save_method(method("u", DriverName::Totp)).await.unwrap();
        store
            .save_method(method("u", DriverName::EmailOtp))
            .await
            .unwrap();

        store.set_primary("u", Some(DriverName::EmailOtp)).await.unwrap();
        let records = store.list_methods("u").await.unwrap();
        let primary: Vec<_> = records.iter().filter(|r| r.is_primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].driver, DriverName::EmailOtp);

        store.set_primary("u", None).await.unwrap();
        assert!(store
            .list_methods("u")
            .await
            .unwrap()
            .iter()
            .all(|r| !r.is_primary));
    }

    #[tokio::test]
    async fn disable_all_counts_enabled_records() {
        let store = store();
        store.save_method(method("u", DriverName::Totp)).await.unwrap();
        let mut off = method("u", DriverName::EmailOtp);
        off.is_enabled = false;
        store.save_method(off).await.unwrap();

        assert_eq!(store.disable_all_methods("u").await.unwrap(), 1);
        assert!(store
            .list_methods("u")
            .await
            .unwrap()
            .iter()
            .all(|r| !r.is_enabled && !r.is_primary));
    }

    #[tokio::test]
    async fn totp_secret_round_trips_through_codec() {
        let key = [3u8; 32];
        let store =
            InMemoryCredentialStore::new(Arc::new(crate::store::ChaChaSecretCodec::new(&key)));
        store
            .save_totp(TotpSecretRecord {
                user_id: "u".to_string(),
                secret: "JBSWY3DPEHPK3PXP".to_string(),
                backup_codes: vec!["ABCD-EFGH-12".to_string()],
                verified_at: None,
            })
            .await
            .unwrap();

        let record = store.get_totp("u").await.unwrap().unwrap();
        assert_eq!(record.secret, "JBSWY3DPEHPK3PXP");
        assert_eq!(record.backup_codes, vec!["ABCD-EFGH-12".to_string()]);
    }

    #[tokio::test]
    async fn backup_code_consumed_once() {
        let store = store();
        store
            .save_totp(TotpSecretRecord {
                user_id: "u".to_string(),
                secret: "S".to_string(),
                backup_codes: vec!["ABCD-EFGH-12".to_string(), "WXYZ-2345-67".to_string()],
                verified_at: None,
            })
            .await
            .unwrap();

        // Normalized input (no hyphens, lowercase) still matches.
        assert!(store.consume_backup_code("u", "abcdefgh12").await.unwrap());
        assert!(!store.consume_backup_code("u", "ABCD-EFGH-12").await.unwrap());
        assert_eq!(store.get_totp("u").await.unwrap().unwrap().backup_codes.len(), 1);
    }

    #[tokio::test]
    async fn email_otp_consumption_invalidates_siblings() {
        let store = store();
        let now = SystemTime::now();
        let otp = |code: &str, created: SystemTime| EmailOtpRecord {
            id: Uuid::new_v4(),
            user_id: "u".to_string(),
            code: code.to_string(),
            expires_at: now + Duration::from_secs(600),
            verified_at: None,
            created_at: created,
            ip: None,
            user_agent: None,
        };
        store.insert_email_otp(otp("111111", now)).await.unwrap();
        store
            .insert_email_otp(otp("222222", now + Duration::from_secs(1)))
            .await
            .unwrap();

        let redeemed = store
            .consume_email_otp("u", "222222", now + Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redeemed.code, "222222");

        // The sibling is dead, and the redeemed code cannot be replayed.
        assert!(store
            .consume_email_otp("u", "111111", now + Duration::from_secs(3))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .consume_email_otp("u", "222222", now + Duration::from_secs(3))
            .await
            .unwrap()
            .is_none());

        // The sibling was invalidated, not expired: the cleanup job leaves
        // it alone until its real expiry passes.
        assert_eq!(
            store
                .delete_expired_otps(now + Duration::from_secs(4))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn expired_otp_is_rejected_and_purged() {
        let store = store();
        let now = SystemTime::now();
        store
            .insert_email_otp(EmailOtpRecord {
                id: Uuid::new_v4(),
                user_id: "u".to_string(),
                code: "333333".to_string(),
                expires_at: now + Duration::from_secs(1),
                verified_at: None,
                created_at: now,
                ip: None,
                user_agent: None,
            })
            .await
            .unwrap();

        let later = now + Duration::from_secs(2);
        assert!(store.consume_email_otp("u", "333333", later).await.unwrap().is_none());
        assert_eq!(store.delete_expired_otps(later).await.unwrap(), 1);
        assert!(store.latest_email_otp("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn webauthn_key_lifecycle() {
        let store = store();
        let key_id = Uuid::new_v4();
        store
            .insert_webauthn_key(WebAuthnKeyRecord {
                id: key_id,
                user_id: "u".to_string(),
                name: "YubiKey".to_string(),
                credential_id: "cred-1".to_string(),
                public_key: "pk".to_string(),
                aaguid: None,
                counter: 0,
                transports: vec!["usb".to_string()],
                attestation_format: None,
                created_at: SystemTime::now(),
                last_used_at: None,
            })
            .await
            .unwrap();

        assert_eq!(store.count_webauthn_keys("u").await.unwrap(), 1);

        let at = SystemTime::now();
        store
            .update_webauthn_key_usage("u", "cred-1", 7, at)
            .await
            .unwrap();
        let key = store.get_webauthn_key("u", "cred-1").await.unwrap().unwrap();
        assert_eq!(key.counter, 7);
        assert_eq!(key.last_used_at, Some(at));

        assert!(store.rename_webauthn_key("u", key_id, "Spare").await.unwrap());
        assert!(!store
            .rename_webauthn_key("u", Uuid::new_v4(), "X")
            .await
            .unwrap());

        assert!(store.delete_webauthn_key("u", key_id).await.unwrap());
        assert!(!store.delete_webauthn_key("u", key_id).await.unwrap());
        assert_eq!(store.count_webauthn_keys("u").await.unwrap(), 0);
    }
}
