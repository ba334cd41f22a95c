//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - SHA-256 and double-SHA-256 hashing for mutations, transactions and anchors
//! - Ed25519 key pair generation, signing, and verification
//! - A pluggable [`SignatureVerifier`] capability so the signature algorithm
//!   is not baked into the validation pipeline

use crate::types::ByteString;
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 applied twice, used by the anchor chain fold
pub fn double_hash(data: &[u8]) -> [u8; 32] {
    hash_bytes(&hash_bytes(data))
}

/// Content hash of an encoded mutation or transaction
pub fn hash(data: &ByteString) -> ByteString {
    ByteString::from(hash_bytes(data.as_slice()))
}

/// One signed identity attached to a posted mutation
///
/// The signature covers `sha256(raw_mutation)`. The identity string used by
/// permission providers is the lowercase hex of the public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEvidence {
    /// Signer public key
    pub public_key: ByteString,
    /// Signature over the mutation hash
    pub signature: ByteString,
}

impl SignatureEvidence {
    /// Create evidence from raw key and signature bytes
    pub fn new(public_key: ByteString, signature: ByteString) -> Self {
        Self {
            public_key,
            signature,
        }
    }

    /// Identity string used for permission resolution
    pub fn identity(&self) -> String {
        self.public_key.to_hex()
    }
}

/// Pluggable signature verification capability
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `message` for `public_key`
    fn verify(&self, public_key: &ByteString, message: &[u8], signature: &ByteString) -> bool;
}

/// Ed25519 verifier (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &ByteString, message: &[u8], signature: &ByteString) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key.as_slice()) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.as_slice()) else {
            return false;
        };

        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key
            .verify(message, &DalekSignature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public key bytes
    pub fn public_key(&self) -> ByteString {
        ByteString::from(self.verifying_key.to_bytes())
    }

    /// Identity string used for permission resolution
    pub fn identity(&self) -> String {
        self.public_key().to_hex()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> ByteString {
        ByteString::new(self.signing_key.sign(message).to_bytes().to_vec())
    }

    /// Evidence for a raw mutation: signs `sha256(raw_mutation)`
    pub fn sign_mutation(&self, raw_mutation: &ByteString) -> SignatureEvidence {
        let digest = hash(raw_mutation);
        SignatureEvidence::new(self.public_key(), self.sign(digest.as_slice()))
    }
}
