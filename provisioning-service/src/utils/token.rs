use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 32 random bytes, hex encoded. Returned to the caller once and never stored.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

/// SHA-256 hex digest used as the persisted form of every opaque token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable_and_one_way() {
        let hash = hash_token("token_abc");
        assert_eq!(hash, hash_token("token_abc"));
        assert_ne!(hash, "token_abc");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_hashes_match() {
        let hash = hash_token("token_abc");
        assert!(hashes_match(&hash, &hash_token("token_abc")));
        assert!(!hashes_match(&hash, &hash_token("token_abd")));
        assert!(!hashes_match(&hash, ""));
    }
}
