//! WebAuthn (security key / platform authenticator) driver.
//!
//! The cryptographic ceremony lives behind [`WebAuthnVerifier`]; this driver
//! owns everything around it: option construction, challenge staging in the
//! session (single use), credential storage, counter tracking and the
//! last-key guard. Options follow the standard WebAuthn JSON shape and are
//! opaque to this crate beyond construction.
//!
//! Signature counters are enforced strictly: when either the stored or the
//! reported counter is non-zero, an assertion whose counter has not advanced
//! is rejected as a cloned-credential signal.
//!
//! # Tracing Events
//!
//! - `mfa.webauthn.key_registered` - a credential completed registration
//! - `mfa.webauthn.verified` - an assertion was accepted
//! - `mfa.webauthn.rejected` - an assertion failed verification
//! - `mfa.webauthn.counter_regression` - an assertion was rejected for a
//!   non-advancing signature counter

use crate::config::{Attestation, AuthenticatorAttachment, UserVerification, WebAuthnConfig};
use crate::context::{MfaUser, RequestContext};
use crate::driver::{
    ChallengeOutcome, DriverCore, DriverName, DriverView, KeySummary, MethodDriver, SetupOutcome,
};
use crate::error::{MfaError, Result};
use crate::events::{MfaEvent, MfaEventKind};
use crate::store::{CredentialStore, WebAuthnKeyRecord};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

const REGISTER_CHALLENGE_KEY: &str = "webauthn_register_challenge";
const REGISTER_USER_KEY: &str = "webauthn_register_user";
const AUTH_CHALLENGE_KEY: &str = "webauthn_auth_challenge";

/// COSE algorithm identifiers offered at registration, in preference order:
/// ES256, RS256, EdDSA.
const PUB_KEY_ALGS: [i64; 3] = [-7, -257, -8];

#[derive(Clone, Debug, Serialize)]
pub struct RelyingParty {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    /// Base64url-encoded user handle.
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PubKeyCredParam {
    #[serde(rename = "type")]
    pub credential_type: &'static str,
    pub alg: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDescriptor {
    #[serde(rename = "type")]
    pub credential_type: &'static str,
    /// Base64url credential id.
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSelection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub require_resident_key: bool,
    pub user_verification: UserVerification,
}

/// Options for `navigator.credentials.create`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationOptions {
    pub rp: RelyingParty,
    pub user: UserEntity,
    /// Base64url challenge.
    pub challenge: String,
    pub pub_key_cred_params: Vec<PubKeyCredParam>,
    pub timeout: u64,
    pub attestation: Attestation,
    pub authenticator_selection: AuthenticatorSelection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_credentials: Vec<CredentialDescriptor>,
}

/// Options for `navigator.credentials.get`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Base64url challenge.
    pub challenge: String,
    pub rp_id: String,
    pub timeout: u64,
    pub user_verification: UserVerification,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_credentials: Vec<CredentialDescriptor>,
}

/// What the verifier must check a registration response against.
#[derive(Clone, Debug)]
pub struct ExpectedRegistration {
    /// Base64url challenge staged at setup.
    pub challenge: String,
    pub rp_id: String,
    pub user_id: String,
}

/// What the verifier must check an assertion against.
#[derive(Clone, Debug)]
pub struct ExpectedAssertion {
    /// Base64url challenge staged at challenge time.
    pub challenge: String,
    pub rp_id: String,
}

/// A credential extracted from a verified registration response.
#[derive(Clone, Debug)]
pub struct RegisteredCredential {
    /// Base64url credential id.
    pub credential_id: String,
    /// COSE public key, base64-encoded.
    pub public_key: String,
    pub aaguid: Option<String>,
    pub counter: u32,
    pub transports: Vec<String>,
    pub attestation_format: Option<String>,
}

/// Outcome of a verified assertion.
#[derive(Clone, Copy, Debug)]
pub struct AssertionResult {
    /// Signature counter reported by the authenticator.
    pub counter: u32,
}

/// The consumed WebAuthn cryptography: attestation and assertion checking.
///
/// Implementations validate origin, challenge, signature and the rest of the
/// ceremony; this crate treats them as a black box.
#[async_trait]
pub trait WebAuthnVerifier: Send + Sync {
    async fn verify_registration(
        &self,
        expected: &ExpectedRegistration,
        client_response: &str,
    ) -> Result<RegisteredCredential>;

    async fn verify_assertion(
        &self,
        expected: &ExpectedAssertion,
        client_response: &str,
        stored: &WebAuthnKeyRecord,
    ) -> Result<AssertionResult>;
}

/// Security-key second factor.
pub struct WebAuthnDriver {
    core: DriverCore,
    config: WebAuthnConfig,
    verifier: Arc<dyn WebAuthnVerifier>,
}

impl WebAuthnDriver {
    #[must_use]
    pub fn new(core: DriverCore, config: WebAuthnConfig, verifier: Arc<dyn WebAuthnVerifier>) -> Self {
        Self {
            core,
            config,
            verifier,
        }
    }

    fn generate_challenge(&self) -> String {
        let mut bytes = vec![0u8; self.config.challenge_length];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn descriptors(keys: &[WebAuthnKeyRecord]) -> Vec<CredentialDescriptor> {
        keys.iter()
            .map(|key| CredentialDescriptor {
                credential_type: "public-key",
                id: key.credential_id.clone(),
                transports: key.transports.clone(),
            })
            .collect()
    }

    /// Pull the credential id out of a client response without trusting
    /// anything else in it.
    fn parse_credential_id(client_response: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(client_response).ok()?;
        value
            .get("id")
            .or_else(|| value.get("rawId"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }

    /// Complete a registration started by `setup`.
    ///
    /// The staged challenge is single use and bound to the user who started
    /// setup; a missing or mismatched stash is a `ChallengeTimeout`.
    pub async fn register(
        &self,
        user: &MfaUser,
        client_response: &str,
        key_name: &str,
        ctx: &RequestContext,
    ) -> Result<KeySummary> {
        let challenge = ctx.session.get(REGISTER_CHALLENGE_KEY).await?;
        let staged_user = ctx.session.get(REGISTER_USER_KEY).await?;
        ctx.session.forget(REGISTER_CHALLENGE_KEY).await?;
        ctx.session.forget(REGISTER_USER_KEY).await?;

        let challenge = match (challenge, staged_user) {
            (Some(challenge), Some(staged)) if staged == user.id => challenge,
            _ => return Err(MfaError::ChallengeTimeout),
        };

        let expected = ExpectedRegistration {
            challenge,
            rp_id: self.config.rp_id.clone(),
            user_id: user.id.clone(),
        };
        let credential = match self.verifier.verify_registration(&expected, client_response).await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(
                    target: "mfa.webauthn.rejected",
                    user_id = %user.id,
                    error = %e,
                    "WebAuthn registration rejected"
                );
                return Err(MfaError::WebAuthn(
                    "Security key registration failed".to_string(),
                ));
            }
        };

        if self
            .core
            .store
            .get_webauthn_key(&user.id, &credential.credential_id)
            .await?
            .is_some()
        {
            return Err(MfaError::WebAuthn(
                "This security key is already registered".to_string(),
            ));
        }

        let record = WebAuthnKeyRecord {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            name: key_name.to_string(),
            credential_id: credential.credential_id,
            public_key: credential.public_key,
            aaguid: credential.aaguid,
            counter: credential.counter,
            transports: credential.transports,
            attestation_format: credential.attestation_format,
            created_at: SystemTime::now(),
            last_used_at: None,
        };
        let summary = KeySummary {
            id: record.id,
            name: record.name.clone(),
            created_at: record.created_at,
            last_used_at: None,
        };
        self.core.store.insert_webauthn_key(record).await?;
        self.core
            .enable_method(user, self.name(), &self.config.display_name)
            .await?;

        tracing::info!(
            target: "mfa.webauthn.key_registered",
            user_id = %user.id,
            key_name = %key_name,
            "Security key registered"
        );
        self.core.emit(
            MfaEvent::new(MfaEventKind::KeyRegistered, &user.id, Some(self.name()))
                .with_detail(key_name),
        );
        Ok(summary)
    }

    /// Remove a registered key.
    ///
    /// Deleting the last key disables the method, which is refused when it
    /// is the user's only enabled method.
    pub async fn delete_key(&self, user: &MfaUser, key_id: Uuid) -> Result<()> {
        let keys = self.core.store.list_webauthn_keys(&user.id).await?;
        let key = keys
            .iter()
            .find(|k| k.id == key_id)
            .ok_or_else(|| MfaError::WebAuthn("Security key not found".to_string()))?;

        if keys.len() == 1 && self.core.method_enabled(&user.id, self.name()).await? {
            self.core.disable_method(user, self.name()).await?;
        }

        let name = key.name.clone();
        self.core.store.delete_webauthn_key(&user.id, key_id).await?;
        self.core.emit(
            MfaEvent::new(MfaEventKind::KeyDeleted, &user.id, Some(self.name()))
                .with_detail(name),
        );
        Ok(())
    }

    /// Rename a registered key. Returns `false` when no such key exists.
    pub async fn rename_key(&self, user: &MfaUser, key_id: Uuid, name: &str) -> Result<bool> {
        self.core
            .store
            .rename_webauthn_key(&user.id, key_id, name)
            .await
    }

    async fn reject(&self, user: &MfaUser, ctx: &RequestContext, reason: &str) -> Result<bool> {
        tracing::warn!(
            target: "mfa.webauthn.rejected",
            user_id = %user.id,
            reason = reason,
            "WebAuthn assertion rejected"
        );
        self.core.record_failure(self.name(), user, ctx).await?;
        self.core.emit(MfaEvent::new(
            MfaEventKind::VerificationFailed,
            &user.id,
            Some(self.name()),
        ));
        Ok(false)
    }
}

#[async_trait]
impl MethodDriver for WebAuthnDriver {
    fn name(&self) -> DriverName {
        DriverName::WebAuthn
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
        Ok(self.core.store.count_webauthn_keys(&user.id).await? > 0)
    }

    async fn setup(&self, user: &MfaUser, ctx: &RequestContext) -> Result<SetupOutcome> {
        let challenge = self.generate_challenge();
        let existing = self.core.store.list_webauthn_keys(&user.id).await?;

        let options = CreationOptions {
            rp: RelyingParty {
                id: self.config.rp_id.clone(),
                name: self.config.rp_name.clone(),
            },
            user: UserEntity {
                id: URL_SAFE_NO_PAD.encode(user.id.as_bytes()),
                name: user.label().to_string(),
                display_name: user
                    .display_name
                    .clone()
                    .unwrap_or_else(|| user.label().to_string()),
            },
            challenge: challenge.clone(),
            pub_key_cred_params: PUB_KEY_ALGS
                .iter()
                .map(|&alg| PubKeyCredParam {
                    credential_type: "public-key",
                    alg,
                })
                .collect(),
            timeout: self.config.timeout_ms,
            attestation: self.config.attestation,
            authenticator_selection: AuthenticatorSelection {
                authenticator_attachment: self.config.authenticator_attachment,
                require_resident_key: self.config.require_resident_key,
                user_verification: self.config.user_verification,
            },
            exclude_credentials: Self::descriptors(&existing),
        };

        ctx.session.put(REGISTER_CHALLENGE_KEY, challenge).await?;
        ctx.session.put(REGISTER_USER_KEY, user.id.clone()).await?;
        self.core.emit(MfaEvent::new(
            MfaEventKind::SetupStarted,
            &user.id,
            Some(self.name()),
        ));

        Ok(SetupOutcome::WebAuthn { options })
    }

    async fn challenge(&self, user: &MfaUser, ctx: &RequestContext) -> Result<ChallengeOutcome> {
        let keys = self.core.store.list_webauthn_keys(&user.id).await?;
        if keys.is_empty() {
            return Err(MfaError::MethodNotConfigured(self.name().to_string()));
        }

        let challenge = self.generate_challenge();
        let options = RequestOptions {
            challenge: challenge.clone(),
            rp_id: self.config.rp_id.clone(),
            timeout: self.config.timeout_ms,
            user_verification: self.config.user_verification,
            allow_credentials: Self::descriptors(&keys),
        };

        ctx.session.put(AUTH_CHALLENGE_KEY, challenge).await?;
        self.core.emit(MfaEvent::new(
            MfaEventKind::ChallengeIssued,
            &user.id,
            Some(self.name()),
        ));
        Ok(ChallengeOutcome::WebAuthn { options })
    }

    async fn verify(
        &self,
        user: &MfaUser,
        credential: &str,
        ctx: &RequestContext,
    ) -> Result<bool> {
        self.validate_verification(credential)?;
        self.core.check_rate_limit(self.name(), user, ctx).await?;

        // The staged challenge is single use whatever happens next.
        let challenge = ctx.session.get(AUTH_CHALLENGE_KEY).await?;
        ctx.session.forget(AUTH_CHALLENGE_KEY).await?;
        let Some(challenge) = challenge else {
            return Err(MfaError::ChallengeTimeout);
        };

        let Some(credential_id) = Self::parse_credential_id(credential) else {
            return self.reject(user, ctx, "unparseable client response").await;
        };
        let Some(stored) = self
            .core
            .store
            .get_webauthn_key(&user.id, &credential_id)
            .await?
        else {
            return self.reject(user, ctx, "unknown credential").await;
        };

        let expected = ExpectedAssertion {
            challenge,
            rp_id: self.config.rp_id.clone(),
        };
        let result = match self
            .verifier
            .verify_assertion(&expected, credential, &stored)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    target: "mfa.webauthn.rejected",
                    user_id = %user.id,
                    error = %e,
                    "WebAuthn assertion verification failed"
                );
                return self.reject(user, ctx, "verifier error").await;
            }
        };

        // A counter that fails to advance on an authenticator that uses
        // counters means a second physical copy of the credential may exist.
        if (stored.counter != 0 || result.counter != 0) && result.counter <= stored.counter {
            tracing::warn!(
                target: "mfa.webauthn.counter_regression",
                user_id = %user.id,
                stored = stored.counter,
                reported = result.counter,
                "Signature counter did not advance; possible cloned credential"
            );
            return self.reject(user, ctx, "counter regression").await;
        }

        self.core
            .store
            .update_webauthn_key_usage(&user.id, &credential_id, result.counter, SystemTime::now())
            .await?;
        self.core.clear_rate_limit(self.name(), user, ctx).await?;
        self.core.touch(&user.id, self.name()).await?;
        tracing::info!(
            target: "mfa.webauthn.verified",
            user_id = %user.id,
            "WebAuthn assertion accepted"
        );
        self.core
            .emit(MfaEvent::new(MfaEventKind::Verified, &user.id, Some(self.name())));
        Ok(true)
    }

    async fn disable(&self, user: &MfaUser) -> Result<()> {
        self.core.disable_method(user, self.name()).await?;
        self.core.store.delete_webauthn_keys(&user.id).await?;
        self.core.store.delete_method(&user.id, self.name()).await?;
        Ok(())
    }

    async fn data(&self, user: &MfaUser) -> Result<Option<DriverView>> {
        let keys = self.core.store.list_webauthn_keys(&user.id).await?;
        if keys.is_empty()
            && self.core.store.get_method(&user.id, self.name()).await?.is_none()
        {
            return Ok(None);
        }
        Ok(Some(DriverView::WebAuthn {
            keys: keys
                .into_iter()
                .map(|key| KeySummary {
                    id: key.id,
                    name: key.name,
                    created_at: key.created_at,
                    last_used_at: key.last_used_at,
                })
                .collect(),
        }))
    }
}
