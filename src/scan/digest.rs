//! Content digests used for blacklist matching
//!
//! SHA-1 is the default since that is what existing blacklists are
//! published in. SHA-256 comes from ring, BLAKE3 from the blake3 crate.

use ring::digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Digest algorithm shared by the blacklist and the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    /// Length of a digest rendered as lowercase hex
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Blake3 => 64,
        }
    }

    /// Start an incremental digest
    pub fn hasher(&self) -> ContentHasher {
        match self {
            DigestAlgorithm::Sha1 => {
                ContentHasher::Ring(digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY))
            }
            DigestAlgorithm::Sha256 => ContentHasher::Ring(digest::Context::new(&digest::SHA256)),
            DigestAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Digest an in-memory buffer
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        };
        f.write_str(name)
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(DigestAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            other => Err(format!("unknown digest algorithm: {}", other)),
        }
    }
}

/// Incremental digest accumulator
pub enum ContentHasher {
    Ring(digest::Context),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Ring(ctx) => ctx.update(data),
            ContentHasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Finish and render as lowercase hex
    pub fn finalize_hex(self) -> String {
        match self {
            ContentHasher::Ring(ctx) => hex::encode(ctx.finish().as_ref()),
            ContentHasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            DigestAlgorithm::Sha1.digest_bytes(b"hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            DigestAlgorithm::Sha256.digest_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        for algorithm in [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Blake3,
        ] {
            let mut hasher = algorithm.hasher();
            hasher.update(b"hello ");
            hasher.update(b"world");
            let digest = hasher.finalize_hex();

            assert_eq!(digest, algorithm.digest_bytes(b"hello world"));
            assert_eq!(digest.len(), algorithm.hex_len());
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("SHA1".parse::<DigestAlgorithm>(), Ok(DigestAlgorithm::Sha1));
        assert_eq!("sha-256".parse::<DigestAlgorithm>(), Ok(DigestAlgorithm::Sha256));
        assert_eq!("blake3".parse::<DigestAlgorithm>(), Ok(DigestAlgorithm::Blake3));
        assert!("md5".parse::<DigestAlgorithm>().is_err());
        assert_eq!(DigestAlgorithm::Blake3.to_string(), "blake3");
    }
}
