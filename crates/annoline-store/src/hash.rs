//! Blake3 hashing for dataset keys, guideline provenance and part integrity

use std::io;
use std::path::Path;

/// Hash a file's contents (memory-mapped when large).
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap(path)?;
    Ok(hasher.finalize())
}

pub fn hash_bytes(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}

/// Hash of the hashes' concatenated bytes; order-sensitive.
pub fn combine_hashes(hashes: &[blake3::Hash]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hasher.finalize()
}

/// First 8 hex characters.
pub fn short_hash(hash: &blake3::Hash) -> String {
    hash.to_hex()[..8].to_string()
}

/// Full hex digest of a text document (guideline provenance).
pub fn text_digest(text: &str) -> String {
    hash_bytes(text.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_prefix_of_full() {
        let h = hash_bytes(b"premise");
        let short = short_hash(&h);
        assert_eq!(short.len(), 8);
        assert!(h.to_hex().starts_with(&short));
    }

    #[test]
    fn combine_order_matters() {
        let a = hash_bytes(b"part_00000");
        let b = hash_bytes(b"part_00001");
        assert_eq!(combine_hashes(&[a, b]), combine_hashes(&[a, b]));
        assert_ne!(combine_hashes(&[a, b]), combine_hashes(&[b, a]));
    }

    #[test]
    fn text_digest_changes_with_guideline() {
        assert_eq!(text_digest("rules v1"), text_digest("rules v1"));
        assert_ne!(text_digest("rules v1"), text_digest("rules v2"));
        assert_eq!(text_digest("").len(), 64);
    }

    #[test]
    fn hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.parquet");
        std::fs::write(&path, b"file content").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"file content"));
    }
}
