//! # Breakwater
//!
//! A pluggable multi-factor authentication core: challenge an
//! already-authenticated user with a second factor before granting the
//! session "verified" status.
//!
//! # Features
//!
//! - **TOTP**: Authenticator apps with single-use backup codes
//! - **Email OTP**: Short-lived emailed codes with send throttling
//! - **WebAuthn**: Security keys and platform authenticators, with the
//!   cryptographic ceremony behind a verifier trait
//! - **Rate limiting**: Per user/IP fixed-window attempt caps
//! - **Lifecycle events**: Every transition reported to an audit sink
//!
//! Everything outside the core is a trait seam: sessions
//! ([`SessionState`]), credential storage ([`CredentialStore`]), counters
//! ([`CounterStore`]), mail ([`Mailer`]) and WebAuthn cryptography
//! ([`WebAuthnVerifier`]). In-memory implementations ship with the crate
//! for tests and single-process applications.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use breakwater::{
//!     ChaChaSecretCodec, DriverName, InMemoryCredentialStore, InMemorySession,
//!     MfaConfig, MfaCoordinator, MfaUser, RequestContext,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     mailer: Arc<dyn breakwater::Mailer>,
//! #     verifier: Arc<dyn breakwater::WebAuthnVerifier>,
//! # ) -> breakwater::Result<()> {
//! breakwater::init_tracing();
//!
//! let codec = Arc::new(ChaChaSecretCodec::new(&[0u8; 32]));
//! let coordinator = MfaCoordinator::builder()
//!     .config(MfaConfig::new())
//!     .store(Arc::new(InMemoryCredentialStore::new(codec)))
//!     .mailer(mailer)
//!     .webauthn_verifier(verifier)
//!     .build()?;
//!
//! let user = MfaUser::new("user-1").with_email("user@example.com");
//! let ctx = RequestContext::new(Arc::new(InMemorySession::new()));
//!
//! if coordinator.requires_mfa(&user, &ctx).await? {
//!     coordinator.challenge(&user, DriverName::EmailOtp, &ctx).await?;
//!     // ...collect the code from the user...
//!     coordinator.verify(&user, DriverName::EmailOtp, "123456", &ctx).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod coordinator;
pub mod counter;
pub mod driver;
pub mod error;
pub mod events;
pub mod mailer;
pub mod ratelimit;
pub mod session;
pub mod store;

pub use config::{
    Attestation, AuthenticatorAttachment, EmailOtpConfig, MfaConfig, RateLimitConfig,
    TotpDriverConfig, UserVerification, WebAuthnConfig,
};
pub use context::{MfaUser, RequestContext};
pub use coordinator::{MfaCoordinator, MfaCoordinatorBuilder, MfaStatistics};
pub use counter::{CounterStore, InMemoryCounterStore};
pub use driver::{
    AssertionResult, ChallengeOutcome, CreationOptions, DriverName, DriverView, EmailOtpDriver,
    ExpectedAssertion, ExpectedRegistration, KeySummary, MethodDriver, RecoveryOption,
    RegisteredCredential, RequestOptions, SetupOutcome, TotpDriver, WebAuthnDriver,
    WebAuthnVerifier,
};
pub use error::{MfaError, Result};
pub use events::{EventSink, MfaEvent, MfaEventKind, NullEventSink, TracingEventSink};
pub use mailer::{ConsoleMailer, Email, Mailer};
pub use ratelimit::{AttemptLimiter, Throttle};
pub use session::{InMemorySession, SessionState};
pub use store::{
    ChaChaSecretCodec, CredentialStore, EmailOtpRecord, InMemoryCredentialStore, MfaMethodRecord,
    PlainCodec, SecretCodec, TotpSecretRecord, WebAuthnKeyRecord,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early in your application, typically in `main()` before building
/// the coordinator.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "breakwater=debug")
/// - `BREAKWATER_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("BREAKWATER_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
