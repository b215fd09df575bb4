//! Commitment scheme
//!
//! Publishing only the hash during the commitment phase and the secret
//! plus salt during the reveal phase binds every node to its secret
//! before any secret becomes visible, which keeps the combined value
//! unbiased as long as one honest node commits first.

use rand::random;
use sha2::{Digest, Sha256};

/// A node's secret proposal for one agreement cycle, together with the
/// salt and the hash that is published during the commitment phase.
#[derive(Debug, Clone)]
pub struct Commitment {
    secret: i64,
    salt: String,
    hash: String,
}

impl Commitment {
    /// Commits to the given secret with a fresh random salt.
    pub fn new(secret: i64) -> Self {
        let salt = random::<u64>().to_string();
        let hash = text_hash(&reveal_text(secret, &salt));
        Commitment { secret, salt, hash }
    }

    /// Commits to a freshly generated random secret.
    pub fn generate() -> Self {
        Commitment::new(random::<i64>())
    }

    pub fn secret(&self) -> i64 {
        self.secret
    }

    /// The value published during the commitment phase.
    pub fn commitment_string(&self) -> &str {
        &self.hash
    }

    /// The value published during the reveal phase: `secret#salt`.
    pub fn reveal_string(&self) -> String {
        reveal_text(self.secret, &self.salt)
    }
}

/// Checks a peer's reveal against its previously published commitment.
/// A mismatch only means that this peer's contribution is invalid for the
/// cycle; it is reported as `false`, never as an error.
pub fn verify_commitment(commitment_hash: &str, reveal: &str) -> bool {
    text_hash(reveal) == commitment_hash
}

/// Extracts the secret from a reveal text. Call only after
/// [`verify_commitment`] succeeded.
pub fn secret_of(reveal: &str) -> Option<i64> {
    reveal.split('#').next()?.parse().ok()
}

fn reveal_text(secret: i64, salt: &str) -> String {
    format!("{}#{}", secret, salt)
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reveal_matches_commitment() {
        let commitment = Commitment::new(42);
        assert!(verify_commitment(
            commitment.commitment_string(),
            &commitment.reveal_string()
        ));
    }

    #[test]
    fn test_tampered_secret_fails() {
        let commitment = Commitment::new(42);
        let forged = commitment.reveal_string().replacen("42", "43", 1);
        assert!(!verify_commitment(commitment.commitment_string(), &forged));
    }

    #[test]
    fn test_tampered_salt_fails() {
        let commitment = Commitment::new(42);
        let mut forged = commitment.reveal_string();
        forged.push('0');
        assert!(!verify_commitment(commitment.commitment_string(), &forged));
    }

    #[test]
    fn test_independent_salts() {
        // Two commitments to the same secret must not be linkable.
        let a = Commitment::new(7);
        let b = Commitment::new(7);
        assert_ne!(a.commitment_string(), b.commitment_string());
    }

    #[test]
    fn test_secret_of_reveal() {
        let commitment = Commitment::new(-99);
        assert_eq!(secret_of(&commitment.reveal_string()), Some(-99));
        assert_eq!(secret_of("garbage"), None);
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let commitment = Commitment::new(1);
        assert_eq!(commitment.commitment_string().len(), 64);
    }
}
