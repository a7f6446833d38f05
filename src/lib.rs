//! `blobkv` is a single-process, disk-backed key-value store built on two
//! cooperating engines:
//!
//! - [`BlobStore`]: a variable-length blob heap. A single file holds a
//!   head-to-tail sequence of records; deleted records publish their span
//!   to an in-memory free list for first-fit reuse, and [`vacuum`] rewrites
//!   the file to reclaim slack and tombstones.
//! - [`KvStore`]: an open-addressed, power-of-two-sized hash index over a
//!   second file. Each live slot holds a pair of blob offsets -- one for
//!   the serialized key, one for the serialized value -- and the index
//!   doubles in place (rehashing entirely inside the same file) when it
//!   saturates.
//!
//! Both engines are single-threaded and synchronous: every mutating call
//! flushes before returning, and there is no support for multi-process or
//! multi-threaded access to the same files.
//!
//! [`vacuum`]: BlobStore::vacuum

mod blob_store;
pub mod error;
mod kv_store;

pub use blob_store::BlobStore;
pub use error::{BlobError, BlobResult, KvError, KvResult};
pub use kv_store::KvStore;
