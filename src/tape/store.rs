//! Persistent tape storage
//!
//! Blocks live in a sled tree keyed by big-endian index, so iteration order
//! is tape order. A small meta tree pins the tape's public key to the
//! database, which catches pointing a process at a directory that holds a
//! different tape.
//!
//! The store keeps a single in-memory head (next index plus expected chain
//! link) behind a mutex. Appending and accepting replicated blocks both go
//! through it, so the tape on disk is always contiguous and every block was
//! verified against the head it extends. The current length is published
//! through a watch channel; readers subscribe to it to tail the tape
//! without polling.

use std::path::Path;

use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::error::TapeError;
use crate::identity::{TapeKeypair, TapePublicKey, Topic};
use crate::tape::block::{hash_payload, signing_digest, Block, BlockRef, GENESIS_LINK};

const KEY_FILE: &str = "tape_key";
const DB_DIR: &str = "tape.sled";
const TREE_BLOCKS: &str = "blocks";
const TREE_META: &str = "meta";
const META_PUBLIC_KEY: &[u8] = b"public_key";

/// Whether this process holds the writer key for the tape.
#[derive(Debug)]
enum TapeRole {
    Writer(TapeKeypair),
    Replica,
}

#[derive(Debug)]
struct Head {
    next_index: u64,
    link: [u8; 32],
}

/// A single tape on disk.
#[derive(Debug)]
pub struct TapeStore {
    db: sled::Db,
    blocks: sled::Tree,
    meta: sled::Tree,
    public_key: TapePublicKey,
    role: TapeRole,
    head: Mutex<Head>,
    length_tx: watch::Sender<u64>,
    length_rx: watch::Receiver<u64>,
}

impl TapeStore {
    /// Open the writer tape under `dir`, creating the keypair and database
    /// on first use. Returns `true` when a new tape was created.
    pub async fn open_or_create(dir: &Path) -> Result<(Self, bool), TapeError> {
        tokio::fs::create_dir_all(dir).await?;
        let (keypair, created) = TapeKeypair::load_or_generate(&dir.join(KEY_FILE))?;
        let public_key = keypair.public();
        let db = Self::open_db(dir)?;
        let store = Self::from_parts(db, public_key, TapeRole::Writer(keypair))?;
        Ok((store, created))
    }

    /// Open a replica of the tape named by `public_key` under `dir`.
    pub async fn open_replica(dir: &Path, public_key: TapePublicKey) -> Result<Self, TapeError> {
        tokio::fs::create_dir_all(dir).await?;
        let db = Self::open_db(dir)?;
        Self::from_parts(db, public_key, TapeRole::Replica)
    }

    /// Open whatever tape already exists under `dir`, as writer when the
    /// key file is present, as replica otherwise.
    pub async fn open_existing(dir: &Path) -> Result<Self, TapeError> {
        if !dir.join(DB_DIR).exists() {
            return Err(TapeError::Uninitialized {
                path: dir.to_path_buf(),
            });
        }
        let db = Self::open_db(dir)?;
        let meta = db
            .open_tree(TREE_META)
            .map_err(|e| TapeError::Database(e.to_string()))?;
        let stored = meta
            .get(META_PUBLIC_KEY)
            .map_err(|e| TapeError::Database(e.to_string()))?
            .ok_or_else(|| TapeError::Uninitialized {
                path: dir.to_path_buf(),
            })?;
        let bytes: [u8; 32] = stored
            .as_ref()
            .try_into()
            .map_err(|_| TapeError::Key("Stored tape key is malformed".to_string()))?;
        let public_key = TapePublicKey::from_bytes(bytes)?;

        let key_path = dir.join(KEY_FILE);
        let role = if key_path.exists() {
            let keypair = TapeKeypair::load(&key_path)?;
            if keypair.public() != public_key {
                return Err(TapeError::Key(
                    "Tape key on disk does not match the stored tape".to_string(),
                ));
            }
            TapeRole::Writer(keypair)
        } else {
            TapeRole::Replica
        };
        Self::from_parts(db, public_key, role)
    }

    /// In-memory writer tape. Storage is discarded on drop.
    pub fn memory(keypair: TapeKeypair) -> Result<Self, TapeError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| TapeError::Database(e.to_string()))?;
        let public_key = keypair.public();
        Self::from_parts(db, public_key, TapeRole::Writer(keypair))
    }

    /// In-memory replica tape. Storage is discarded on drop.
    pub fn memory_replica(public_key: TapePublicKey) -> Result<Self, TapeError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| TapeError::Database(e.to_string()))?;
        Self::from_parts(db, public_key, TapeRole::Replica)
    }

    fn open_db(dir: &Path) -> Result<sled::Db, TapeError> {
        sled::Config::new()
            .path(dir.join(DB_DIR))
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|e| TapeError::Database(e.to_string()))
    }

    fn from_parts(
        db: sled::Db,
        public_key: TapePublicKey,
        role: TapeRole,
    ) -> Result<Self, TapeError> {
        let blocks = db
            .open_tree(TREE_BLOCKS)
            .map_err(|e| TapeError::Database(e.to_string()))?;
        let meta = db
            .open_tree(TREE_META)
            .map_err(|e| TapeError::Database(e.to_string()))?;

        match meta
            .get(META_PUBLIC_KEY)
            .map_err(|e| TapeError::Database(e.to_string()))?
        {
            Some(stored) => {
                if stored.as_ref() != public_key.as_bytes().as_slice() {
                    return Err(TapeError::Key(
                        "Database holds a different tape than the requested key".to_string(),
                    ));
                }
            }
            None => {
                meta.insert(META_PUBLIC_KEY, public_key.as_bytes().as_slice())
                    .map_err(|e| TapeError::Database(e.to_string()))?;
            }
        }

        // Recover the head from the last stored block.
        let head = match blocks
            .last()
            .map_err(|e| TapeError::Database(e.to_string()))?
        {
            Some((_, value)) => {
                let block: Block = rmp_serde::from_slice(&value)
                    .map_err(|e| TapeError::Serialization(e.to_string()))?;
                Head {
                    next_index: block.index + 1,
                    link: block.next_link(),
                }
            }
            None => Head {
                next_index: 0,
                link: GENESIS_LINK,
            },
        };

        let (length_tx, length_rx) = watch::channel(head.next_index);
        Ok(Self {
            db,
            blocks,
            meta,
            public_key,
            role,
            head: Mutex::new(head),
            length_tx,
            length_rx,
        })
    }

    pub fn public_key(&self) -> TapePublicKey {
        self.public_key
    }

    pub fn topic(&self) -> Topic {
        self.public_key.topic()
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.role, TapeRole::Writer(_))
    }

    /// Number of blocks stored. Also the index the next block will take.
    pub fn length(&self) -> u64 {
        *self.length_rx.borrow()
    }

    /// Watch channel that carries the tape length. Receivers wake whenever
    /// a block lands.
    pub fn subscribe_length(&self) -> watch::Receiver<u64> {
        self.length_tx.subscribe()
    }

    /// Sign and append a payload. Writer only.
    pub async fn append(&self, payload: &[u8]) -> Result<BlockRef, TapeError> {
        let keypair = match &self.role {
            TapeRole::Writer(keypair) => keypair,
            TapeRole::Replica => return Err(TapeError::ReadOnly),
        };
        let mut head = self.head.lock().await;
        let block = Block::create(head.next_index, payload.to_vec(), head.link, keypair);
        let reference = block.reference();
        self.persist(&mut head, &block).await?;
        Ok(reference)
    }

    /// Store a block received from a peer. The block must extend the local
    /// head and verify in full against the tape's public key, otherwise it
    /// is rejected and nothing is written.
    pub async fn accept(&self, block: Block) -> Result<BlockRef, TapeError> {
        let mut head = self.head.lock().await;
        block.verify_chained(head.next_index, &head.link, &self.public_key)?;
        let reference = block.reference();
        self.persist(&mut head, &block).await?;
        Ok(reference)
    }

    /// Write a block and advance the head. The length is only published
    /// after the database flushed, so observers never see a length the
    /// disk cannot back.
    async fn persist(&self, head: &mut Head, block: &Block) -> Result<(), TapeError> {
        let encoded =
            rmp_serde::to_vec(block).map_err(|e| TapeError::Serialization(e.to_string()))?;
        self.blocks
            .insert(block.index.to_be_bytes(), encoded)
            .map_err(|e| TapeError::Database(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| TapeError::Database(e.to_string()))?;

        head.link = block.next_link();
        head.next_index = block.index + 1;
        self.length_tx.send_replace(head.next_index);
        Ok(())
    }

    /// Fetch one block.
    pub async fn get(&self, index: u64) -> Result<Block, TapeError> {
        match self
            .blocks
            .get(index.to_be_bytes())
            .map_err(|e| TapeError::Database(e.to_string()))?
        {
            Some(value) => {
                rmp_serde::from_slice(&value).map_err(|e| TapeError::Serialization(e.to_string()))
            }
            None => Err(TapeError::NotFound { index }),
        }
    }

    /// Re-verify the stored prefix up to and including `index`.
    ///
    /// Walks the chain from block zero recomputing content hashes and
    /// links, then checks the signature of the block at `index`, which the
    /// recomputed chain ties to everything before it. Returns `Ok(false)`
    /// when stored data does not verify; asking past the end is an error.
    pub async fn verify(&self, index: u64) -> Result<bool, TapeError> {
        if index >= self.length() {
            return Err(TapeError::NotFound { index });
        }

        let mut link = GENESIS_LINK;
        for i in 0..=index {
            let block = self.get(i).await?;
            if block.index != i {
                warn!(index = i, stored = block.index, "Stored block is mispositioned");
                return Ok(false);
            }
            if hash_payload(&block.payload) != block.content_hash {
                warn!(index = i, "Stored payload does not match its content hash");
                return Ok(false);
            }
            if block.parent_link != link {
                warn!(index = i, "Stored chain link does not match the prefix");
                return Ok(false);
            }
            if i == index {
                let digest = signing_digest(block.index, &block.content_hash, &block.parent_link);
                if !self.public_key.verify(&digest, &block.signature) {
                    warn!(index = i, "Stored block signature does not verify");
                    return Ok(false);
                }
            }
            link = block.next_link();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_store() -> TapeStore {
        TapeStore::memory(TapeKeypair::generate()).unwrap()
    }

    #[tokio::test]
    async fn test_append_get_length() {
        let store = writer_store();
        assert_eq!(store.length(), 0);

        let a = store.append(b"alpha").await.unwrap();
        let b = store.append(b"beta").await.unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(store.length(), 2);

        assert_eq!(store.get(0).await.unwrap().payload, b"alpha");
        assert_eq!(store.get(1).await.unwrap().payload, b"beta");
        assert!(matches!(
            store.get(2).await,
            Err(TapeError::NotFound { index: 2 })
        ));
    }

    #[tokio::test]
    async fn test_replica_is_read_only() {
        let writer = TapeKeypair::generate();
        let replica = TapeStore::memory_replica(writer.public()).unwrap();
        assert!(matches!(
            replica.append(b"nope").await,
            Err(TapeError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_replica_accepts_writer_blocks() {
        let writer = writer_store();
        let replica = TapeStore::memory_replica(writer.public_key()).unwrap();

        for payload in [b"a".as_slice(), b"b", b"c"] {
            writer.append(payload).await.unwrap();
        }
        for i in 0..writer.length() {
            let block = writer.get(i).await.unwrap();
            replica.accept(block).await.unwrap();
        }

        assert_eq!(replica.length(), 3);
        assert_eq!(replica.get(2).await.unwrap().payload, b"c");
        assert!(replica.verify(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_rejects_gap() {
        let writer = writer_store();
        let replica = TapeStore::memory_replica(writer.public_key()).unwrap();

        writer.append(b"a").await.unwrap();
        writer.append(b"b").await.unwrap();

        let second = writer.get(1).await.unwrap();
        let err = replica.accept(second).await.unwrap_err();
        assert!(matches!(
            err,
            TapeError::NonContiguous {
                index: 1,
                expected: 0
            }
        ));
        assert_eq!(replica.length(), 0);
    }

    #[tokio::test]
    async fn test_accept_rejects_foreign_writer() {
        let honest = writer_store();
        let impostor = writer_store();
        let replica = TapeStore::memory_replica(honest.public_key()).unwrap();

        impostor.append(b"forged").await.unwrap();
        let block = impostor.get(0).await.unwrap();

        let err = replica.accept(block).await.unwrap_err();
        assert!(matches!(err, TapeError::BadSignature { index: 0 }));
    }

    #[tokio::test]
    async fn test_verify_clean_tape() {
        let store = writer_store();
        for i in 0..5u32 {
            store.append(format!("payload-{}", i).as_bytes()).await.unwrap();
        }
        for i in 0..5 {
            assert!(store.verify(i).await.unwrap());
        }
        assert!(matches!(
            store.verify(5).await,
            Err(TapeError::NotFound { index: 5 })
        ));
    }

    #[tokio::test]
    async fn test_length_watch_wakes_on_append() {
        let store = writer_store();
        let mut lengths = store.subscribe_length();
        assert_eq!(*lengths.borrow_and_update(), 0);

        store.append(b"x").await.unwrap();
        lengths.changed().await.unwrap();
        assert_eq!(*lengths.borrow_and_update(), 1);
    }
}
