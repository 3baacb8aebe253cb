//! Checksum port. Only the invocation contract lives here; digests come
//! from the adapter crate.

use crate::hash::HashAlgorithm;

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait CryptographicHash: Send {
    fn add_data(&mut self, data: &[u8]);

    /// Lowercase hex digest of everything added so far.
    fn hex_digest(&mut self) -> String;
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait HashFactory: Send + Sync {
    fn create_hash(&self, algorithm: HashAlgorithm) -> Box<dyn CryptographicHash>;
}
