//! Site credential checks.
//!
//! Sites are provisioned with a shared secret; only its hex SHA-256 is
//! stored on the site row.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex SHA-256 of a credential, as stored in `Site::secret_hash`.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Check a presented credential against the stored hash in constant time.
pub fn verify_credential(credential: &str, secret_hash: &str) -> bool {
    let presented = hash_credential(credential);
    constant_time_eq(
        presented.as_bytes(),
        secret_hash.to_ascii_lowercase().as_bytes(),
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_credential_verifies() {
        let stored = hash_credential("venue-secret");
        assert!(verify_credential("venue-secret", &stored));
        assert!(verify_credential("venue-secret", &stored.to_uppercase()));
    }

    #[test]
    fn wrong_credential_fails() {
        let stored = hash_credential("venue-secret");
        assert!(!verify_credential("venue-secreT", &stored));
        assert!(!verify_credential("", &stored));
    }

    #[test]
    fn malformed_hash_fails() {
        assert!(!verify_credential("venue-secret", "abc"));
    }
}
