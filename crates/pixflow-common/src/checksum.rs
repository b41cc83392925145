//! Content hashing for downloaded images
//!
//! The downloader feeds every body chunk through a [`ContentHasher`] while it
//! streams the bytes to disk, so the digest never requires a second read.

use crate::error::Result;
use crate::types::ContentHash;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Incremental SHA-256 hasher producing a [`ContentHash`]
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of content
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash::from_bytes(self.inner.finalize().into())
    }
}

/// Compute the content hash for any readable source
pub fn compute_hash<R: Read>(reader: &mut R) -> Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Compute the content hash of a file on disk
pub fn compute_file_hash(path: impl AsRef<Path>) -> Result<ContentHash> {
    let mut file = std::fs::File::open(path)?;
    compute_hash(&mut file)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_hash() {
        let mut cursor = Cursor::new(b"hello world");
        let hash = compute_hash(&mut cursor).unwrap();
        assert_eq!(hash.to_hex(), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hello");
        hasher.update(b" ");
        hasher.update(b"world");
        assert_eq!(hasher.bytes_hashed(), 11);
        assert_eq!(hasher.finalize().to_hex(), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_compute_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let hash = compute_file_hash(&path).unwrap();
        assert_eq!(hash.to_hex(), HELLO_WORLD_SHA256);
    }
}
