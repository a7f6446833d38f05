use failure::Fail;
use std::io;

/// Errors raised by the [`BlobStore`](crate::BlobStore).
#[derive(Fail, Debug)]
pub enum BlobError {
    /// The underlying file operation failed.
    #[fail(display = "IO error: {}", _0)]
    Io(#[cause] io::Error),
    /// `get` was called on a record that has been tombstoned by `delete`.
    #[fail(display = "blob has been deleted")]
    Deleted,
    /// A header was read that cannot be a valid record (currently only the
    /// deleted flag byte is checked; everything else is trusted).
    #[fail(display = "malformed blob header: {}", _0)]
    Malformed(String),
}

impl From<io::Error> for BlobError {
    fn from(err: io::Error) -> BlobError {
        BlobError::Io(err)
    }
}

/// `Result` alias for [`BlobError`].
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors raised by the [`KvStore`](crate::KvStore).
#[derive(Fail, Debug)]
pub enum KvError {
    /// The underlying index file operation failed.
    #[fail(display = "IO error: {}", _0)]
    Io(#[cause] io::Error),
    /// `get`/`delete` was called with a key that has no live slot.
    #[fail(display = "key not found")]
    NotFound,
    /// The blob store backing this index raised an error while reading or
    /// writing a key or value blob.
    #[fail(display = "blob store error: {}", _0)]
    Blob(#[cause] BlobError),
    /// Encoding or decoding a key or value with `bincode` failed.
    #[fail(display = "serialization error: {}", _0)]
    Serde(#[cause] bincode::Error),
}

impl From<io::Error> for KvError {
    fn from(err: io::Error) -> KvError {
        KvError::Io(err)
    }
}

impl From<BlobError> for KvError {
    fn from(err: BlobError) -> KvError {
        KvError::Blob(err)
    }
}

impl From<bincode::Error> for KvError {
    fn from(err: bincode::Error) -> KvError {
        KvError::Serde(err)
    }
}

/// `Result` alias for [`KvError`].
pub type KvResult<T> = Result<T, KvError>;
