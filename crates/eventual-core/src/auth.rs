//! Bearer tokens for clients and peers.
//!
//! Tokens are HS256 JWTs signed with a shared secret. Clients present one on
//! every privileged frame; brokers sign a fresh one for every peer call.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("failed to sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

/// Verifies presented tokens and signs outgoing ones.
pub trait TokenAuthority: Send + Sync {
    /// Mint a token for an outgoing peer call.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` if the token cannot be produced.
    fn sign(&self) -> Result<String, AuthError>;

    /// Check a presented token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Invalid` if the signature or claims do not verify.
    fn verify(&self, token: &str) -> Result<(), AuthError>;

    /// Check an optional token, treating absence as failure.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingToken` or the verification error.
    fn verify_present(&self, token: Option<&str>) -> Result<(), AuthError> {
        match token {
            Some(token) if !token.is_empty() => self.verify(token),
            _ => Err(AuthError::MissingToken),
        }
    }
}

/// Claims carried by broker tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 token authority over a shared secret.
pub struct JwtAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    subject: String,
    ttl: Duration,
}

impl JwtAuthority {
    /// Default lifetime of signed tokens.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            subject: "eventual".to_string(),
            ttl,
        }
    }

    /// Set the `sub` claim of signed tokens.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sign a token for an arbitrary subject. Used by tooling and tests.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` on encoder failure.
    pub fn sign_for(&self, subject: &str) -> Result<String, AuthError> {
        let now = now_epoch_seconds();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(AuthError::Signing)
    }
}

impl TokenAuthority for JwtAuthority {
    fn sign(&self) -> Result<String, AuthError> {
        self.sign_for(&self.subject)
    }

    fn verify(&self, token: &str) -> Result<(), AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(())
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
