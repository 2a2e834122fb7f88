//! Session state seam.
//!
//! The core stores three things in the session: the verification timestamp,
//! the name of the driver that satisfied the challenge, and staged WebAuthn
//! challenges. The trait is a minimal get/put/forget handle scoped to the
//! current authenticated session; implement it over whatever session backend
//! the host application uses.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Key-value state scoped to the current authenticated session.
#[async_trait]
pub trait SessionState: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn forget(&self, key: &str) -> Result<()>;
}

/// In-memory session, one instance per logical session.
///
/// Suitable for tests and single-process applications.
#[derive(Default)]
pub struct InMemorySession {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySession {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionState for InMemorySession {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.values.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}
