//! Checksums backed by the `RustCrypto` digest crates.

use downlink_core::HashAlgorithm;
use downlink_core::ports::{CryptographicHash, HashFactory};
use sha2::digest::DynDigest;

/// Incremental digest over one of the supported algorithms.
pub struct DigestHash {
    algorithm: HashAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl DigestHash {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner: Box<dyn DynDigest + Send> = match algorithm {
            HashAlgorithm::Md5 => Box::new(md5::Md5::default()),
            HashAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            HashAlgorithm::Sha224 => Box::new(sha2::Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        };
        Self { algorithm, inner }
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl std::fmt::Debug for DigestHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestHash")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl CryptographicHash for DigestHash {
    fn add_data(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn hex_digest(&mut self) -> String {
        hex::encode(self.inner.finalize_reset())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestHashFactory;

impl DigestHashFactory {
    pub const fn new() -> Self {
        Self
    }
}

impl HashFactory for DigestHashFactory {
    fn create_hash(&self, algorithm: HashAlgorithm) -> Box<dyn CryptographicHash> {
        Box::new(DigestHash::new(algorithm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(algorithm: HashAlgorithm, chunks: &[&[u8]]) -> String {
        let mut hash = DigestHashFactory::new().create_hash(algorithm);
        for chunk in chunks {
            hash.add_data(chunk);
        }
        hash.hex_digest()
    }

    #[test]
    fn test_known_digests_of_hello() {
        assert_eq!(
            digest(HashAlgorithm::Md5, &[b"hello"]),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            digest(HashAlgorithm::Sha1, &[b"hello"]),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            digest(HashAlgorithm::Sha256, &[b"hello"]),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_chunked_input_matches_single_update() {
        for algorithm in [
            HashAlgorithm::Sha224,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(
                digest(algorithm, &[b"hel", b"", b"lo"]),
                digest(algorithm, &[b"hello"]),
                "{algorithm} differs when fed in chunks"
            );
        }
    }

    #[test]
    fn test_digest_is_lowercase_hex_of_expected_width() {
        let widths = [
            (HashAlgorithm::Md5, 32),
            (HashAlgorithm::Sha1, 40),
            (HashAlgorithm::Sha224, 56),
            (HashAlgorithm::Sha256, 64),
            (HashAlgorithm::Sha384, 96),
            (HashAlgorithm::Sha512, 128),
        ];
        for (algorithm, width) in widths {
            let hex = digest(algorithm, &[b"downlink"]);
            assert_eq!(hex.len(), width);
            assert!(hex.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }
}
