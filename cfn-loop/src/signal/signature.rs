//! HMAC-SHA256 signing of signal acknowledgments.
//!
//! The canonical string is `coordinator_id:signal_id:timestamp:iteration`
//! and the signature is the hex-encoded HMAC-SHA256 over it. There is no
//! unsigned-ACK fallback: a record without a verifiable signature is a
//! security fault.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::SignalError;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the shared coordination secret.
pub const SECRET_ENV_VAR: &str = "BLOCKING_COORDINATION_SECRET";

/// Shared HMAC key. Debug output never reveals the key material.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Build from an explicit secret. Empty secrets are rejected:
    /// cooperating coordinators require a shared key.
    pub fn new(secret: &str) -> Result<Self, SignalError> {
        if secret.is_empty() {
            return Err(SignalError::MissingSecret);
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// Read the secret from `BLOCKING_COORDINATION_SECRET`. Absence is
    /// a hard construction failure.
    pub fn from_env() -> Result<Self, SignalError> {
        match std::env::var(SECRET_ENV_VAR) {
            Ok(secret) => Self::new(&secret),
            Err(_) => Err(SignalError::MissingSecret),
        }
    }

    /// Hex-encoded HMAC-SHA256 over `canonical`.
    pub fn sign(&self, canonical: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time verification of a hex signature over `canonical`.
    /// Missing or malformed signatures verify false.
    pub fn verify(&self, canonical: &str, signature_hex: &str) -> bool {
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(canonical.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

/// The string every ACK signature covers.
pub fn canonical_string(
    coordinator_id: &str,
    signal_id: &str,
    timestamp: i64,
    iteration: u64,
) -> String {
    format!("{coordinator_id}:{signal_id}:{timestamp}:{iteration}")
}
