use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Number of hex characters of `SHA-256(raw_key)` stored alongside the
/// bcrypt hash for indexed lookup.
pub const LOOKUP_PREFIX_LEN: usize = 16;

/// Generates a fresh agent API key of the form `sk_agt_<64 hex>`
pub fn generate() -> String {
    let secret: [u8; 32] = rand::rng().random();

    format!("sk_agt_{}", hex::encode(secret))
}

/// Fast-lookup prefix: the first 16 hex characters of SHA-256 over the raw key
pub fn lookup_prefix(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.as_bytes());

    hex::encode(digest)[..LOOKUP_PREFIX_LEN].to_string()
}

pub fn hash(raw_key: &str) -> Result<String> {
    bcrypt::hash(raw_key, bcrypt::DEFAULT_COST).context("Failed to hash api key")
}

/// Constant-time verification of a raw key against a stored bcrypt hash
pub fn verify(raw_key: &str, key_hash: &str) -> bool {
    bcrypt::verify(raw_key, key_hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_expected_shape() {
        let key = generate();

        assert!(key.starts_with("sk_agt_"));

        assert_eq!(key.len(), "sk_agt_".len() + 64);

        assert_ne!(key, generate());
    }

    #[test]
    fn lookup_prefix_is_stable_and_short() {
        let key = "sk_agt_0000000000000000000000000000000000000000000000000000000000000000";

        assert_eq!(lookup_prefix(key), lookup_prefix(key));

        assert_eq!(lookup_prefix(key).len(), LOOKUP_PREFIX_LEN);

        assert_ne!(lookup_prefix(key), lookup_prefix("sk_agt_other"));
    }

    #[test]
    fn verify_round_trips_and_rejects_wrong_key() {
        let key = generate();

        let key_hash = bcrypt::hash(&key, 4).unwrap();

        assert!(verify(&key, &key_hash));

        assert!(!verify("sk_agt_wrong", &key_hash));
    }
}
