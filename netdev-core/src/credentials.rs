//! Credential store collaborator.
//!
//! Devices carry only a [`CredentialRef`]; secrets are resolved when a
//! session is opened and dropped with the transport config afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::device::CredentialRef;
use crate::error::{Result, TransportError};

/// Secret material for one login.
#[derive(Clone)]
pub enum Secret {
    Password(SecretString),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    /// Token presented as the password on keyboard-less logins.
    Token(SecretString),
}

/// Resolved login for a device.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
    /// Password for privilege elevation (`enable`), when the platform needs one.
    pub enable_secret: Option<SecretString>,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(SecretString::from(password.into())),
            enable_secret: None,
        }
    }

    pub fn private_key(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::PrivateKey {
                path: path.into(),
                passphrase: None,
            },
            enable_secret: None,
        }
    }

    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(SecretString::from(secret.into()));
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.secret {
            Secret::Password(_) => "password",
            Secret::PrivateKey { .. } => "private_key",
            Secret::Token(_) => "token",
        };
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &kind)
            .field("enable_secret", &self.enable_secret.is_some())
            .finish()
    }
}

/// Resolves credential references into secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, reference: &CredentialRef) -> Result<Credentials>;
}

/// In-memory credential store for tests and embedded use.
#[derive(Default)]
pub struct StaticCredentialStore {
    entries: RwLock<HashMap<CredentialRef, Credentials>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&self, reference: CredentialRef, credentials: Credentials) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reference, credentials);
    }

    /// Builder-style insert.
    pub fn with(self, reference: impl Into<String>, credentials: Credentials) -> Self {
        self.insert(CredentialRef::new(reference), credentials);
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn resolve(&self, reference: &CredentialRef) -> Result<Credentials> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned()
            .ok_or_else(|| {
                TransportError::CredentialUnavailable {
                    reference: reference.to_string(),
                }
                .into()
            })
    }
}
