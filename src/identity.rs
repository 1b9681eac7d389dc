//! Tape identity
//!
//! Every tape is owned by exactly one Ed25519 keypair. The holder of the
//! signing key is the single writer; everyone else replicates. The public
//! key doubles as the tape's name: peers derive the discovery [`Topic`]
//! from it and verify every block against it.
//!
//! This identity is separate from the libp2p node keypair. A node can
//! replicate tapes it does not own, and a tape outlives any particular
//! node that seeds it.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::TapeError;

/// Domain separator mixed into topic derivation.
const TOPIC_CONTEXT: &[u8] = b"tapecast/topic/v1";

/// The writer keypair for a tape.
#[derive(Clone)]
pub struct TapeKeypair {
    signing: SigningKey,
}

impl TapeKeypair {
    /// Create a fresh keypair.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing: SigningKey::generate(&mut csprng),
        }
    }

    /// Load a keypair from a hex-encoded seed file.
    pub fn load(path: &Path) -> Result<Self, TapeError> {
        let encoded = std::fs::read_to_string(path)?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| TapeError::Key(format!("Failed to decode key file: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TapeError::Key("Key file must hold a 32-byte seed".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Save the keypair seed as hex.
    pub fn save(&self, path: &Path) -> Result<(), TapeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.signing.to_bytes()))?;
        Ok(())
    }

    /// Load the keypair at `path`, generating and saving a new one if the
    /// file does not exist. Returns `true` when a key was created.
    pub fn load_or_generate(path: &Path) -> Result<(Self, bool), TapeError> {
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            let keypair = Self::generate();
            keypair.save(path)?;
            Ok((keypair, true))
        }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> TapePublicKey {
        TapePublicKey {
            bytes: self.signing.verifying_key().to_bytes(),
        }
    }

    /// Sign a 32-byte digest.
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        self.signing.sign(digest).to_bytes().to_vec()
    }
}

impl fmt::Debug for TapeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeKeypair")
            .field("public", &self.public())
            .finish()
    }
}

/// The public key naming a tape.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapePublicKey {
    bytes: [u8; 32],
}

impl TapePublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, TapeError> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| TapeError::Key(format!("Invalid public key: {}", e)))?;
        Ok(Self { bytes })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, TapeError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| TapeError::Key(format!("Failed to decode public key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TapeError::Key("Public key must be 32 bytes".to_string()))?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Check a signature over a 32-byte digest.
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        let verifying = match VerifyingKey::from_bytes(&self.bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        verifying.verify(digest, &signature).is_ok()
    }

    /// Derive the discovery topic for this tape.
    pub fn topic(&self) -> Topic {
        let mut hasher = Sha256::new();
        hasher.update(TOPIC_CONTEXT);
        hasher.update(self.bytes);
        Topic {
            bytes: hasher.finalize().into(),
        }
    }
}

impl fmt::Display for TapePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TapePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TapePublicKey({})", self.to_hex())
    }
}

/// Rendezvous name for a tape on the DHT. Derived from the public key so
/// peers can meet without revealing the key itself in provider records.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    bytes: [u8; 32],
}

impl Topic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = TapeKeypair::generate();
        let digest = [7u8; 32];
        let signature = keypair.sign(&digest);

        assert!(keypair.public().verify(&digest, &signature));
        assert!(!keypair.public().verify(&[8u8; 32], &signature));

        let other = TapeKeypair::generate();
        assert!(!other.public().verify(&digest, &signature));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape_key");

        let keypair = TapeKeypair::generate();
        keypair.save(&path).unwrap();

        let loaded = TapeKeypair::load(&path).unwrap();
        assert_eq!(keypair.public(), loaded.public());
    }

    #[test]
    fn test_load_or_generate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape_key");

        let (first, created) = TapeKeypair::load_or_generate(&path).unwrap();
        assert!(created);

        let (second, created) = TapeKeypair::load_or_generate(&path).unwrap();
        assert!(!created);
        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let keypair = TapeKeypair::generate();
        let public = keypair.public();

        let decoded = TapePublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(public, decoded);

        assert!(TapePublicKey::from_hex("not hex").is_err());
        assert!(TapePublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_topic_derivation() {
        let a = TapeKeypair::generate().public();
        let b = TapeKeypair::generate().public();

        // Stable for one key, distinct across keys.
        assert_eq!(a.topic(), a.topic());
        assert_ne!(a.topic(), b.topic());
        assert_ne!(a.topic().as_bytes(), a.as_bytes());
    }
}
