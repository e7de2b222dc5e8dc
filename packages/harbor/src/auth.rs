//! Password auth: a single configured account checked against an argon2 hash,
//! plus in-memory session tokens so a reconnecting client can skip the password.

use anyhow::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::ws::UserId;

/// Principal id of the configured account.
pub const ADMIN_USER_ID: UserId = 1;

/// Hash a password with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Check a username/password pair against the configured account.
///
/// Argon2 is deliberately slow; call this from a blocking context.
pub fn check_credentials(config: &AuthConfig, username: &str, password: &str) -> Result<bool> {
    let Some(hash) = config.password_hash.as_deref() else {
        debug!("Login attempted but no password hash is configured");
        return Ok(false);
    };
    if username != config.username {
        return Ok(false);
    }
    verify_password(password, hash)
}

/// Opaque session tokens issued on login. Lost on restart.
#[derive(Debug, Default)]
pub struct SessionStore {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, user: UserId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone(), user);
        token
    }

    pub fn validate(&self, token: &str) -> Option<UserId> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .copied()
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token)
            .is_some()
    }
}
