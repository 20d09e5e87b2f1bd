//! Signed login sessions
//!
//! A successful login yields an HS256 token signed with the session
//! authentication key from the key store, so sessions survive restarts.

use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::keys::Keys;
use crate::types::{Result, SesameError};

/// Session token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Canonical user name
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: u64,
    /// Expires at (unix seconds)
    pub exp: u64,
}

pub struct SessionSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    session_ttl: Duration,
    remember_ttl: Duration,
}

impl SessionSigner {
    pub fn new(keys: &Keys, session_ttl: Duration, remember_ttl: Duration) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(&keys.session_auth_key),
            decoding_key: DecodingKey::from_secret(&keys.session_auth_key),
            validation,
            session_ttl,
            remember_ttl,
        }
    }

    /// Issue a token for `user_name`
    pub fn issue(&self, user_name: &str, remember: bool) -> Result<String> {
        self.issue_at(user_name, remember, unix_now())
    }

    fn issue_at(&self, user_name: &str, remember: bool, now: u64) -> Result<String> {
        let ttl = if remember {
            self.remember_ttl
        } else {
            self.session_ttl
        };
        let claims = Claims {
            sub: user_name.to_string(),
            iat: now,
            exp: now + ttl.as_secs(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| SesameError::Auth(format!("Failed to issue session: {e}")))
    }

    /// Check signature and expiry, returning the claims
    pub fn validate(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "session expired",
                    ErrorKind::InvalidSignature => "invalid signature",
                    _ => "invalid session",
                };
                SesameError::Unauthorized(reason.into())
            })
    }
}

/// Token of an `Authorization: Bearer <token>` header
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
