use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::PresenceError;

/// Shared secret guarding the administrative endpoints.
///
/// Only the SHA-256 digest is kept. Candidates are hashed and compared in
/// constant time, so neither content nor length leaks through timing.
#[derive(Clone)]
pub struct AdminSecret {
    digest: [u8; 32],
}

impl AdminSecret {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        candidate[..].ct_eq(&self.digest[..]).into()
    }

    /// Check a caller's secret, mapping a mismatch to `Unauthorized`.
    pub fn require(&self, candidate: &str) -> Result<(), PresenceError> {
        if self.verify(candidate) {
            Ok(())
        } else {
            Err(PresenceError::Unauthorized)
        }
    }
}

impl std::fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminSecret(<redacted>)")
    }
}

/// Generate a 32-byte random admin secret, hex-encoded (64 chars).
pub fn generate_admin_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}
