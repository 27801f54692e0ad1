//! Script body digests.
//!
//! Scripts are identified by the SHA-1 of their body, rendered as 40
//! lowercase hexadecimal characters. `EVALSHA` accepts a digest supplied
//! by the client only if it normalizes to exactly this form.

use sha1::{Digest, Sha1};

/// Number of hexadecimal characters in a script digest.
pub const DIGEST_HEX_LEN: usize = 40;

/// Computes the hex digest of a script body.
pub fn sha1_hex(body: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Returns `true` when `digest` is exactly 40 hex characters after case
/// normalization.
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == DIGEST_HEX_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Normalizes a client-supplied digest to its canonical lowercase form, or
/// `None` when it cannot identify any script.
pub fn normalize_digest(digest: &str) -> Option<String> {
    if is_valid_digest(digest) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha1("") is the classic empty-input vector.
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(sha1_hex(b"return 1"), sha1_hex(b"return 1"));
    }

    #[test]
    fn test_digest_validation() {
        let digest = sha1_hex(b"return 1");
        assert!(is_valid_digest(&digest));
        assert!(is_valid_digest(&digest.to_ascii_uppercase()));

        // Wrong lengths are rejected outright.
        assert!(!is_valid_digest(&digest[..39]));
        assert!(!is_valid_digest(&format!("{digest}0")));
        assert!(!is_valid_digest("zz39a3ee5e6b4b0d3255bfef95601890afd80709"));
    }

    #[test]
    fn test_normalization() {
        let digest = sha1_hex(b"x");
        assert_eq!(
            normalize_digest(&digest.to_ascii_uppercase()).as_deref(),
            Some(digest.as_str())
        );
        assert_eq!(normalize_digest("nope"), None);
    }
}
