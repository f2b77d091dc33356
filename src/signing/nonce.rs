use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{FixflowError, Result};

const NONCE_BYTES: usize = 32;

/// Logon nonce source.
///
/// Nonces come from the OS CSPRNG and are remembered for the life of the
/// process; a repeat is refused rather than sent.
#[derive(Default)]
pub struct NonceGenerator {
    issued: Mutex<HashSet<String>>,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh hex-encoded nonce
    pub fn next(&self) -> Result<String> {
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| FixflowError::Auth(format!("OS random source failed: {}", e)))?;
        self.claim(hex::encode(bytes))
    }

    /// Record a nonce as issued, refusing one seen before
    pub fn claim(&self, nonce: String) -> Result<String> {
        let mut issued = self.issued.lock();
        if !issued.insert(nonce.clone()) {
            return Err(FixflowError::Auth(format!(
                "nonce {} already used for a logon",
                nonce
            )));
        }
        debug!(issued = issued.len(), "Issued logon nonce");
        Ok(nonce)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonces_are_unique_hex() {
        let generator = NonceGenerator::new();
        let a = generator.next().unwrap();
        let b = generator.next().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), NONCE_BYTES * 2);
        assert!(hex::decode(&a).is_ok());
        assert_eq!(generator.issued_count(), 2);
    }

    #[test]
    fn test_reuse_refused() {
        let generator = NonceGenerator::new();
        generator.claim("abc".into()).unwrap();
        let err = generator.claim("abc".into()).unwrap_err();
        assert!(matches!(err, FixflowError::Auth(_)));
    }
}
