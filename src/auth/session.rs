//! Session tokens issued by the game backend.
//!
//! A session is an HS256 token whose `sub` claim is the user identity.
//! "Reloading" a session means verifying the token again at connect time.

use std::path::Path;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ws::protocol::{CLOSE_SESSION_EXPIRED, CLOSE_SESSION_INVALID};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User identity
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Why a session could not be reloaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionRejection {
    #[error("no session token")]
    Missing,
    #[error("session expired")]
    Expired,
    #[error("session token invalid: {0}")]
    Invalid(String),
    #[error("session carries no user identity")]
    NoIdentity,
}

impl SessionRejection {
    /// WebSocket close code sent to the client.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Expired => CLOSE_SESSION_EXPIRED,
            _ => CLOSE_SESSION_INVALID,
        }
    }
}

/// Load or generate the session signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/session_secret.
pub fn load_or_generate_session_secret(
    data_dir: &str,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("session_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("Session signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("Session key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("Session signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue a session token for `identity`, valid for `ttl_secs`.
pub fn issue_session_token(
    secret: &[u8],
    identity: &str,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: identity.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Verify a session token and return its claims.
pub fn reload_session(
    secret: &[u8],
    token: Option<&str>,
) -> Result<SessionClaims, SessionRejection> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(SessionRejection::Missing)?;

    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<SessionClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => SessionRejection::Expired,
            _ => SessionRejection::Invalid(e.to_string()),
        })?;

    Ok(token_data.claims)
}
