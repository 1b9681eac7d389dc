//! Sequential readers and writers over a tape
//!
//! [`TapeReader`] yields blocks in order starting from any index. In live
//! mode it parks on the store's length watch once it reaches the end and
//! wakes when new blocks land, so tailing a tape costs nothing between
//! appends. [`TapeWriter`] is the appending counterpart, a thin handle
//! that turns payloads into signed blocks.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::TapeError;
use crate::tape::block::{Block, BlockRef};
use crate::tape::store::TapeStore;

/// Ordered block reader.
pub struct TapeReader {
    store: Arc<TapeStore>,
    next: u64,
    /// Exclusive end for finite readers, `None` when live.
    end: Option<u64>,
    lengths: watch::Receiver<u64>,
}

impl TapeReader {
    /// Start reading at `start`. A finite reader stops at the length the
    /// tape had when it was created; re-reading later data takes a fresh
    /// reader. A live reader never finishes on its own.
    pub fn new(store: Arc<TapeStore>, start: u64, live: bool) -> Self {
        let lengths = store.subscribe_length();
        let end = if live { None } else { Some(store.length()) };
        Self {
            store,
            next: start,
            end,
            lengths,
        }
    }

    /// Next block in sequence.
    ///
    /// Returns `Ok(None)` when a finite reader is exhausted, or when a
    /// live reader's store has been dropped. Cancel-safe: a cancelled call
    /// does not skip blocks.
    pub async fn next_block(&mut self) -> Result<Option<Block>, TapeError> {
        loop {
            let limit = match self.end {
                Some(end) => end,
                None => *self.lengths.borrow_and_update(),
            };
            if self.next < limit {
                let block = self.store.get(self.next).await?;
                self.next += 1;
                return Ok(Some(block));
            }
            match self.end {
                Some(_) => return Ok(None),
                None => {
                    if self.lengths.changed().await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Index the next call to [`next_block`](Self::next_block) will yield.
    pub fn position(&self) -> u64 {
        self.next
    }
}

/// Appending handle for the writer side of a tape.
pub struct TapeWriter {
    store: Arc<TapeStore>,
}

impl TapeWriter {
    pub fn new(store: Arc<TapeStore>) -> Self {
        Self { store }
    }

    /// Append one payload as a signed block.
    pub async fn write(&mut self, payload: &[u8]) -> Result<BlockRef, TapeError> {
        self.store.append(payload).await
    }

    /// Finish writing. Everything already written is durable, so this only
    /// consumes the handle.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TapeKeypair;
    use std::time::Duration;

    fn writer_store() -> Arc<TapeStore> {
        Arc::new(TapeStore::memory(TapeKeypair::generate()).unwrap())
    }

    #[tokio::test]
    async fn test_finite_reader_stops_at_creation_length() {
        let store = writer_store();
        let mut writer = TapeWriter::new(store.clone());
        writer.write(b"a").await.unwrap();
        writer.write(b"b").await.unwrap();

        let mut reader = TapeReader::new(store.clone(), 0, false);
        // Appends after creation are not part of this pass.
        writer.write(b"c").await.unwrap();

        assert_eq!(reader.next_block().await.unwrap().unwrap().payload, b"a");
        assert_eq!(reader.next_block().await.unwrap().unwrap().payload, b"b");
        assert!(reader.next_block().await.unwrap().is_none());

        // A fresh reader sees the full tape.
        let mut reader = TapeReader::new(store, 0, false);
        let mut count = 0;
        while reader.next_block().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_finite_reader_from_offset() {
        let store = writer_store();
        let mut writer = TapeWriter::new(store.clone());
        for payload in [b"a".as_slice(), b"b", b"c"] {
            writer.write(payload).await.unwrap();
        }

        let mut reader = TapeReader::new(store, 2, false);
        assert_eq!(reader.next_block().await.unwrap().unwrap().index, 2);
        assert!(reader.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_reader_wakes_on_append() {
        let store = writer_store();
        let mut reader = TapeReader::new(store.clone(), 0, true);

        let handle = tokio::spawn(async move { reader.next_block().await });
        // Give the reader time to park on the watch.
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.append(b"wake").await.unwrap();
        let block = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(block.payload, b"wake");
    }

    #[tokio::test]
    async fn test_reader_past_end_is_empty() {
        let store = writer_store();
        let mut writer = TapeWriter::new(store.clone());
        writer.write(b"only").await.unwrap();

        let mut reader = TapeReader::new(store, 10, false);
        assert!(reader.next_block().await.unwrap().is_none());
        assert_eq!(reader.position(), 10);
    }
}
