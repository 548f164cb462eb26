//! Blake3 hashing for content-addressed artifact keys

/// Hash raw bytes with blake3.
pub fn hash_bytes(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}

/// Full hex digest of `data`
pub fn content_hash(data: &[u8]) -> String {
    hash_bytes(data).to_hex().to_string()
}

/// Return the first `len` hex characters of a blake3 hash (at most 64).
pub fn short_hash(hash: &blake3::Hash, len: usize) -> String {
    let hex = hash.to_hex();
    hex[..len.min(hex.len())].to_string()
}

/// Path-safe name for a page token; the first page (no token) is `first`.
///
/// Tokens are opaque and may contain characters unfit for object keys.
pub fn page_key(page_token: Option<&str>) -> String {
    match page_token {
        None => "first".to_string(),
        Some(token) => format!("p{}", short_hash(&hash_bytes(token.as_bytes()), 16)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn content_hash_is_full_hex() {
        let h = content_hash(b"payload");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_hash_length() {
        let h = hash_bytes(b"test");
        assert_eq!(short_hash(&h, 8).len(), 8);
        assert_eq!(short_hash(&h, 100).len(), 64);
    }

    #[test]
    fn page_key_first_page() {
        assert_eq!(page_key(None), "first");
    }

    #[test]
    fn page_key_stable_and_safe() {
        let token = "QURTSl9pM3/+==";
        let key = page_key(Some(token));
        assert_eq!(key, page_key(Some(token)));
        assert_eq!(key.len(), 17);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, page_key(Some("other")));
    }
}
