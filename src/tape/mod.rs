//! Append-only tape storage
//!
//! A tape is a signed, hash-chained, append-only log owned by a single
//! writer key. [`store`] persists it, [`block`] defines the on-tape
//! format, and [`stream`] layers sequential readers and writers on top.

pub mod block;
pub mod store;
pub mod stream;

pub use block::{Block, BlockRef, GENESIS_LINK};
pub use store::TapeStore;
pub use stream::{TapeReader, TapeWriter};
