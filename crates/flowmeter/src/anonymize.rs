//! Address anonymization for exports
//!
//! Applied to `src_ip` / `dst_ip` at export time only; metering always sees
//! real addresses.

use sha2::{Digest, Sha256};

/// Deterministic address transform
pub trait Anonymizer: Send + Sync {
    fn anonymize(&self, address: &str) -> String;
}

impl<F> Anonymizer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn anonymize(&self, address: &str) -> String {
        self(address)
    }
}

/// Keyed SHA-256 digest of the address, hex encoded.
///
/// The secret is drawn once per instance, so one export is consistent with
/// itself but digests cannot be matched across runs.
#[derive(Clone)]
pub struct KeyedAnonymizer {
    secret: [u8; 32],
}

impl KeyedAnonymizer {
    /// Random secret
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
        }
    }

    /// Fixed secret, for reproducible exports
    pub fn with_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }
}

impl Default for KeyedAnonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer for KeyedAnonymizer {
    fn anonymize(&self, address: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(address.as_bytes());
        hex::encode(hasher.finalize())
    }
}
