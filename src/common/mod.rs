//! Shared identifiers and constants used across the engine.

use std::cmp::Ordering;

/// Physical page number inside the data file (32-bit, per the file format).
pub type PageNumber = u32;

/// Unique identifier for transactions.
pub type TxId = u64;

/// Monotonic number of a journal file.
pub type JournalNumber = u64;

/// Default page size. The page size is fixed for the lifetime of an
/// environment; it is configurable at creation only.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Pages 0 and 1 hold the double-buffered file headers; the free-space
/// buffers follow and data pages come after them.
pub const HEADER_PAGE_COUNT: u32 = 2;

/// Compares two binary keys under the environment's byte comparator:
/// plain unsigned lexicographic ordering.
#[inline]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}
