//! Update signing
//!
//! A signature binds an update ID to the leading gradient entries so that
//! updates altered in transit are rejected at submission. Key management is
//! left to the host; the default signer is a plain SHA-256 digest.

use sha2::{Digest, Sha256};

/// Number of leading gradient entries covered by a signature
pub const SIGNED_PREFIX_LEN: usize = 100;

/// Signs and verifies updates
pub trait Signer: Send + Sync {
    /// Computes the signature of an update
    fn sign(&self, update_id: &str, gradients: &[f64]) -> String;

    /// Checks a signature by recomputing it
    fn verify(&self, update_id: &str, gradients: &[f64], signature: &str) -> bool {
        self.sign(update_id, gradients) == signature
    }
}

/// Hex-encoded SHA-256 over the update ID and gradient prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Signer;

impl Signer for Sha256Signer {
    fn sign(&self, update_id: &str, gradients: &[f64]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(signing_payload(update_id, gradients).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// `update_id` followed by the comma-joined decimal gradient prefix
pub fn signing_payload(update_id: &str, gradients: &[f64]) -> String {
    let prefix: Vec<String> = gradients
        .iter()
        .take(SIGNED_PREFIX_LEN)
        .map(|g| g.to_string())
        .collect();
    format!("{update_id}{}", prefix.join(","))
}
