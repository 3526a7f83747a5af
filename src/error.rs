use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Parse and validation failures surface to the caller; I/O errors propagate
/// from the pager unchanged. Internal invariant violations are debug-asserted
/// and reported as `Internal` in release builds.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic mismatch, unsupported version, or a page number beyond the file.
    /// Fatal to the open attempt.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// CRC mismatch or marker-sequence violation in a journal file. The
    /// transaction containing it is treated as never committed.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// A write transaction would span more than two journal files.
    #[error("transaction too large: {needed} pages do not fit in two journal files of {capacity} pages")]
    TransactionTooLarge { needed: u64, capacity: u64 },

    /// The free list is empty and the data file cannot be extended.
    #[error("database full: {0}")]
    DatabaseFull(String),

    /// A journal file was released after its reference count reached zero.
    #[error("object disposed: {0}")]
    ObjectDisposed(&'static str),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
