/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Short, filesystem-safe digest of an arbitrary string.
///
/// Used to turn integrity strings (which contain `/`, `+` and `=`) into
/// cache path components. Returns the first `len` hex characters.
#[must_use]
pub fn short_digest(input: &str, len: usize) -> String {
    let mut hex = blake3_bytes(input.as_bytes());
    hex.truncate(len.min(hex.len()));
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_bytes() {
        let hash = blake3_bytes(b"hello world");
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_short_digest_prefix() {
        let digest = short_digest("hello world", 16);
        assert_eq!(digest, "d74981efa70a0c88");
    }

    #[test]
    fn test_short_digest_is_path_safe() {
        let digest = short_digest("sha512-abc/def+ghi==", 16);
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
