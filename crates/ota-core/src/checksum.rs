//! Checksum verification.
//!
//! SHA-256 digests computed incrementally while bytes stream to disk, plus
//! file-based helpers used when resuming a partial download or re-checking a
//! staged package.
//!
//! Digests are compared in constant time.

use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;

use crate::error::OtaError;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A SHA-256 digest.
pub type Sha256Digest = [u8; 32];

/// Parse a hex-encoded SHA-256 digest as carried in update commands.
///
/// Accepts an optional `sha256:` prefix and either letter case.
pub fn parse_digest(s: &str) -> Result<Sha256Digest, OtaError> {
    let hex_str = s.trim();
    let hex_str = hex_str.strip_prefix("sha256:").unwrap_or(hex_str);
    let bytes = hex::decode(hex_str)
        .map_err(|e| OtaError::InvalidRequest(format!("checksum is not valid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| OtaError::InvalidRequest("checksum must be a 32-byte SHA-256 digest".into()))
}

/// Constant-time digest comparison.
pub fn digests_match(a: &Sha256Digest, b: &Sha256Digest) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}

/// Incremental SHA-256 accumulator that also counts the bytes it has seen.
#[derive(Clone, Default)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Sha256Digest {
        self.inner.finalize().into()
    }
}

/// Verifies artifacts against expected SHA-256 digests.
#[derive(Debug, Clone)]
pub struct ChecksumVerifier {
    buffer_size: usize,
}

impl ChecksumVerifier {
    pub fn new() -> Self {
        Self {
            buffer_size: HASH_BUFFER_SIZE,
        }
    }

    /// Compute the SHA-256 hash of a whole file.
    pub async fn hash_file(&self, path: &Path) -> Result<Sha256Digest, OtaError> {
        let len = tokio::fs::metadata(path).await?.len();
        Ok(self.hash_prefix(path, len).await?.finalize())
    }

    /// Hash the first `len` bytes of a file, returning the live accumulator so
    /// a resumed download can keep feeding it.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::SizeMismatch`] if the file is shorter than `len`.
    pub async fn hash_prefix(&self, path: &Path, len: u64) -> Result<StreamingHasher, OtaError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = StreamingHasher::new();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut remaining = len;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            remaining -= n as u64;
        }

        if remaining > 0 {
            return Err(OtaError::SizeMismatch {
                expected: len,
                actual: len - remaining,
            });
        }
        Ok(hasher)
    }

    /// Compare a computed digest with the expected one.
    pub fn check(&self, expected: &Sha256Digest, actual: &Sha256Digest) -> Result<(), OtaError> {
        if !digests_match(expected, actual) {
            tracing::error!(
                expected = %hex::encode(expected),
                actual = %hex::encode(actual),
                "Checksum mismatch"
            );
            return Err(OtaError::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    /// Hash a file and compare it with the expected digest.
    pub async fn verify_file(&self, path: &Path, expected: &Sha256Digest) -> Result<(), OtaError> {
        let actual = self.hash_file(path).await?;
        self.check(expected, &actual)?;
        tracing::debug!(path = %path.display(), hash = %hex::encode(actual), "Checksum verified");
        Ok(())
    }
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sha256(data: &[u8]) -> Sha256Digest {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_parse_digest() {
        let hex_str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest = parse_digest(hex_str).unwrap();
        assert_eq!(digest, sha256(b""));
        assert_eq!(parse_digest(&format!("sha256:{}", hex_str.to_uppercase())).unwrap(), digest);

        assert!(parse_digest("abcd").is_err());
        assert!(parse_digest("not-hex").is_err());
    }

    #[tokio::test]
    async fn test_hash_file_and_verify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"hello ota").unwrap();

        let verifier = ChecksumVerifier::new();
        let expected = sha256(b"hello ota");
        assert_eq!(verifier.hash_file(&path).await.unwrap(), expected);
        assert!(verifier.verify_file(&path, &expected).await.is_ok());

        let wrong = sha256(b"something else");
        let err = verifier.verify_file(&path, &wrong).await.unwrap_err();
        assert!(matches!(err, OtaError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_hash_prefix_continues_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data[..120_000]).unwrap();

        let verifier = ChecksumVerifier::new();
        let mut hasher = verifier.hash_prefix(&path, 120_000).await.unwrap();
        assert_eq!(hasher.bytes(), 120_000);
        hasher.update(&data[120_000..]);
        assert_eq!(hasher.finalize(), sha256(&data));
    }

    #[tokio::test]
    async fn test_hash_prefix_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let err = ChecksumVerifier::new().hash_prefix(&path, 10).await.err().unwrap();
        assert!(matches!(err, OtaError::SizeMismatch { expected: 10, actual: 3 }));
    }
}
