//! Hashing utilities for content comparison.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex SHA256 digest of a file's contents, read in fixed-size chunks so
/// large bundle resources never sit in memory whole.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        match file.read(&mut chunk)? {
            0 => break,
            n => hasher.update(&chunk[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_sha256_file_known_digest() {
        let file = file_with(b"hello world");
        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_sha256_file_spans_chunks() {
        let long = file_with(&vec![7u8; 20_000]);
        let shorter = file_with(&vec![7u8; 19_999]);

        let digest = sha256_file(long.path()).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, sha256_file(long.path()).unwrap());
        assert_ne!(digest, sha256_file(shorter.path()).unwrap());
    }

    #[test]
    fn test_sha256_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = sha256_file(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
