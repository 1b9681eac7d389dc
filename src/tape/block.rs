//! Block format and per-block verification
//!
//! A tape is a sequence of blocks. Each block commits to its payload with a
//! content hash, to its entire prefix with a chain link, and to its writer
//! with an Ed25519 signature. Verifying block `i` against the expected link
//! therefore authenticates everything before it without re-reading the
//! prefix.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TapeError;
use crate::identity::{TapeKeypair, TapePublicKey};

/// Chain link of the first block. No prefix to commit to.
pub const GENESIS_LINK: [u8; 32] = [0u8; 32];

/// Domain separator mixed into the signing digest.
const BLOCK_SIGN_CONTEXT: &[u8] = b"tapecast/block/v1";

/// One entry of a tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the tape, starting at zero.
    pub index: u64,
    /// Opaque payload bytes. The store never interprets them.
    pub payload: Vec<u8>,
    /// SHA-256 of the payload.
    pub content_hash: [u8; 32],
    /// Commitment to all preceding blocks. [`GENESIS_LINK`] at index zero.
    pub parent_link: [u8; 32],
    /// Writer signature over the signing digest. Always 64 bytes.
    pub signature: Vec<u8>,
}

/// Position plus content hash, enough to name a block without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub index: u64,
    pub content_hash: [u8; 32],
}

/// SHA-256 of a payload.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Chain link expected of the block following `index`.
pub fn chain_link(parent_link: &[u8; 32], content_hash: &[u8; 32], index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(parent_link);
    hasher.update(content_hash);
    hasher.update(index.to_le_bytes());
    hasher.finalize().into()
}

/// Digest the writer signs for one block.
pub fn signing_digest(index: u64, content_hash: &[u8; 32], parent_link: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(BLOCK_SIGN_CONTEXT);
    hasher.update(index.to_le_bytes());
    hasher.update(content_hash);
    hasher.update(parent_link);
    hasher.finalize().into()
}

impl Block {
    /// Build and sign a block extending the tape at `index` with the given
    /// parent link.
    pub fn create(
        index: u64,
        payload: Vec<u8>,
        parent_link: [u8; 32],
        keypair: &TapeKeypair,
    ) -> Self {
        let content_hash = hash_payload(&payload);
        let digest = signing_digest(index, &content_hash, &parent_link);
        let signature = keypair.sign(&digest);
        Self {
            index,
            payload,
            content_hash,
            parent_link,
            signature,
        }
    }

    /// Chain link this block hands to its successor.
    pub fn next_link(&self) -> [u8; 32] {
        chain_link(&self.parent_link, &self.content_hash, self.index)
    }

    pub fn reference(&self) -> BlockRef {
        BlockRef {
            index: self.index,
            content_hash: self.content_hash,
        }
    }

    /// Full verification of a block arriving at the tape head.
    ///
    /// Checks, in order: the block lands at `expected_index`, the payload
    /// matches its content hash, the parent link matches `expected_link`,
    /// and the signature checks out under `writer`.
    pub fn verify_chained(
        &self,
        expected_index: u64,
        expected_link: &[u8; 32],
        writer: &TapePublicKey,
    ) -> Result<(), TapeError> {
        if self.index != expected_index {
            return Err(TapeError::NonContiguous {
                index: self.index,
                expected: expected_index,
            });
        }

        let actual_hash = hash_payload(&self.payload);
        if actual_hash != self.content_hash {
            return Err(TapeError::BadContentHash {
                index: self.index,
                expected: hex::encode(self.content_hash),
                actual: hex::encode(actual_hash),
            });
        }

        if &self.parent_link != expected_link {
            return Err(TapeError::BrokenChain {
                index: self.index,
                expected: hex::encode(expected_link),
                actual: hex::encode(self.parent_link),
            });
        }

        let digest = signing_digest(self.index, &self.content_hash, &self.parent_link);
        if !writer.verify(&digest, &self.signature) {
            return Err(TapeError::BadSignature { index: self.index });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(keypair: &TapeKeypair, payloads: &[&[u8]]) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut link = GENESIS_LINK;
        for (i, payload) in payloads.iter().enumerate() {
            let block = Block::create(i as u64, payload.to_vec(), link, keypair);
            link = block.next_link();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_chain_verifies() {
        let keypair = TapeKeypair::generate();
        let writer = keypair.public();
        let blocks = chain(&keypair, &[b"a", b"b", b"c"]);

        let mut link = GENESIS_LINK;
        for (i, block) in blocks.iter().enumerate() {
            block.verify_chained(i as u64, &link, &writer).unwrap();
            link = block.next_link();
        }
    }

    #[test]
    fn test_links_are_positional() {
        let keypair = TapeKeypair::generate();
        // Same payloads at different positions produce different links.
        let a = Block::create(0, b"x".to_vec(), GENESIS_LINK, &keypair);
        let b = Block::create(1, b"x".to_vec(), GENESIS_LINK, &keypair);
        assert_ne!(a.next_link(), b.next_link());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = TapeKeypair::generate();
        let writer = keypair.public();
        let mut block = Block::create(0, b"honest".to_vec(), GENESIS_LINK, &keypair);
        block.payload = b"forged".to_vec();

        let err = block.verify_chained(0, &GENESIS_LINK, &writer).unwrap_err();
        assert!(matches!(err, TapeError::BadContentHash { index: 0, .. }));
    }

    #[test]
    fn test_wrong_parent_link_rejected() {
        let keypair = TapeKeypair::generate();
        let writer = keypair.public();
        let block = Block::create(1, b"b".to_vec(), [9u8; 32], &keypair);

        let err = block.verify_chained(1, &[1u8; 32], &writer).unwrap_err();
        assert!(matches!(err, TapeError::BrokenChain { index: 1, .. }));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let keypair = TapeKeypair::generate();
        let impostor = TapeKeypair::generate();
        let block = Block::create(0, b"a".to_vec(), GENESIS_LINK, &impostor);

        let err = block
            .verify_chained(0, &GENESIS_LINK, &keypair.public())
            .unwrap_err();
        assert!(matches!(err, TapeError::BadSignature { index: 0 }));
    }

    #[test]
    fn test_noncontiguous_rejected() {
        let keypair = TapeKeypair::generate();
        let writer = keypair.public();
        let block = Block::create(5, b"e".to_vec(), GENESIS_LINK, &keypair);

        let err = block.verify_chained(3, &GENESIS_LINK, &writer).unwrap_err();
        assert!(matches!(
            err,
            TapeError::NonContiguous {
                index: 5,
                expected: 3
            }
        ));
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let keypair = TapeKeypair::generate();
        let writer = keypair.public();
        let mut block = Block::create(0, b"a".to_vec(), GENESIS_LINK, &keypair);
        block.signature.truncate(10);

        let err = block.verify_chained(0, &GENESIS_LINK, &writer).unwrap_err();
        assert!(matches!(err, TapeError::BadSignature { index: 0 }));
    }
}
