//! Server identity and signature checks
//!
//! A server's identity chain id is its ed25519 verifying key, so any signed
//! message can be checked against the chain id it claims.

use crate::types::ChainId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;

/// Signing identity of this node
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic identity from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Identity chain id (the verifying key bytes)
    pub fn chain_id(&self) -> ChainId {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("chain_id", &hex::encode(self.chain_id()))
            .finish()
    }
}

/// Check `signature` over `data` against the key behind `chain_id`
pub fn verify_signature(chain_id: &ChainId, data: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(chain_id) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::from_seed([7u8; 32]);
        let sig = identity.sign(b"minute 3");

        assert!(verify_signature(&identity.chain_id(), b"minute 3", &sig));
        assert!(!verify_signature(&identity.chain_id(), b"minute 4", &sig));

        let other = Identity::generate();
        assert!(!verify_signature(&other.chain_id(), b"minute 3", &sig));
    }

    #[test]
    fn test_garbage_signature() {
        let identity = Identity::from_seed([1u8; 32]);
        assert!(!verify_signature(&identity.chain_id(), b"data", &[0u8; 3]));
    }
}
