//! Durable SA storage on redb
//!
//! Implements the `sadb-core` [`Store`](sadb_core::Store) contract over an
//! embedded [`redb`] database file.
//!
//! # Layout
//!
//! One table per frame type, named after the partition (`SecAssn`,
//! `SecAssnTm`, `SecAssnAos`). Rows are keyed by `(scid, spi)` so that every
//! SA of a spacecraft is one contiguous key range, and the largest SPI in use
//! is the last key of that range. Values are CBOR-encoded records.
//!
//! # Concurrency
//!
//! redb admits one write transaction at a time. A session transaction is a
//! redb write transaction, so engine transactions are serialized by the
//! database itself.

mod codec;
mod error;
mod store;

pub use error::RedbStoreError;
pub use store::{RedbConfig, RedbSession, RedbStore};
