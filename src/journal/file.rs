//! A single append-only journal file.
//!
//! Each file carries a page translation table mapping logical data-page
//! numbers to page offsets inside the file; the table is published by
//! copy-on-replace so read transactions can capture it without locking.
//! Files are reference counted: the journal holds a creator reference, every
//! live snapshot holds one, and the file is deleted once the count reaches
//! zero after it has been retired.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::common::{JournalNumber, PageNumber};
use crate::error::{DbError, Result};

/// `%019d.journal`
pub fn journal_file_name(number: JournalNumber) -> String {
    format!("{number:019}.journal")
}

struct RefState {
    count: u32,
    disposed: bool,
}

pub struct JournalFile {
    number: JournalNumber,
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    capacity_pages: u64,
    /// Next free page slot inside the file.
    write_page: AtomicU64,
    /// Logical page number -> page offset within this file. Append-only per
    /// file: remapping a page requires a later offset.
    translation: RwLock<Arc<HashMap<PageNumber, u64>>>,
    refs: Mutex<RefState>,
    delete_on_dispose: AtomicBool,
}

impl JournalFile {
    /// Creates and pre-allocates a fresh journal file. The returned file
    /// carries its creator reference.
    pub fn create(
        dir: &Path,
        number: JournalNumber,
        capacity_pages: u64,
        page_size: usize,
    ) -> Result<Arc<JournalFile>> {
        let path = dir.join(journal_file_name(number));
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.set_len(capacity_pages * page_size as u64)?;
        debug!(number, capacity_pages, "journal file created");
        Ok(Arc::new(JournalFile {
            number,
            path,
            file: Mutex::new(file),
            page_size,
            capacity_pages,
            write_page: AtomicU64::new(0),
            translation: RwLock::new(Arc::new(HashMap::new())),
            refs: Mutex::new(RefState { count: 1, disposed: false }),
            delete_on_dispose: AtomicBool::new(false),
        }))
    }

    /// Opens an existing journal file for recovery.
    pub fn open(dir: &Path, number: JournalNumber, page_size: usize) -> Result<Arc<JournalFile>> {
        let path = dir.join(journal_file_name(number));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity_pages = file.metadata()?.len() / page_size as u64;
        Ok(Arc::new(JournalFile {
            number,
            path,
            file: Mutex::new(file),
            page_size,
            capacity_pages,
            write_page: AtomicU64::new(0),
            translation: RwLock::new(Arc::new(HashMap::new())),
            refs: Mutex::new(RefState { count: 1, disposed: false }),
            delete_on_dispose: AtomicBool::new(false),
        }))
    }

    pub fn number(&self) -> JournalNumber {
        self.number
    }

    pub fn capacity_pages(&self) -> u64 {
        self.capacity_pages
    }

    pub fn write_page(&self) -> u64 {
        self.write_page.load(Ordering::Acquire)
    }

    pub fn set_write_page(&self, page: u64) {
        self.write_page.store(page, Ordering::Release);
    }

    pub fn available_pages(&self) -> u64 {
        self.capacity_pages.saturating_sub(self.write_page())
    }

    /// Marks the file full so no further transaction starts in it.
    pub fn mark_full(&self) {
        self.set_write_page(self.capacity_pages);
    }

    pub fn read_page_at(&self, page_offset: u64) -> Result<Vec<u8>> {
        if page_offset >= self.capacity_pages {
            return Err(DbError::CorruptJournal(format!(
                "journal {} offset {page_offset} beyond capacity",
                self.number
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page_at(&self, page_offset: u64, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() <= self.page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset * self.page_size as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Current translation table snapshot.
    pub fn translation(&self) -> Arc<HashMap<PageNumber, u64>> {
        self.translation.read().clone()
    }

    pub fn lookup(&self, page_no: PageNumber) -> Option<u64> {
        self.translation.read().get(&page_no).copied()
    }

    /// Merges a committed transaction's table into the file table
    /// atomically (copy-on-replace).
    pub fn merge_translation(&self, entries: &HashMap<PageNumber, u64>) {
        let mut guard = self.translation.write();
        let mut next = HashMap::clone(&guard);
        for (&page, &offset) in entries {
            next.insert(page, offset);
        }
        *guard = Arc::new(next);
    }

    // -- reference counting ----------------------------------------------

    pub fn acquire(&self) -> Result<()> {
        let mut refs = self.refs.lock();
        if refs.disposed {
            return Err(DbError::ObjectDisposed("journal file"));
        }
        refs.count += 1;
        Ok(())
    }

    /// Drops one reference. At zero the file is disposed; if it has been
    /// retired, its backing file is deleted. Releasing a disposed file is an
    /// error.
    pub fn release(&self) -> Result<()> {
        let dispose = {
            let mut refs = self.refs.lock();
            if refs.disposed {
                return Err(DbError::ObjectDisposed("journal file"));
            }
            refs.count -= 1;
            if refs.count == 0 {
                refs.disposed = true;
                true
            } else {
                false
            }
        };
        if dispose && self.delete_on_dispose.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(number = self.number, error = %e, "failed to delete retired journal file");
            } else {
                debug!(number = self.number, "journal file deleted");
            }
        }
        Ok(())
    }

    /// Marks the file for deletion once its last reference is released.
    pub fn retire(&self) {
        self.delete_on_dispose.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn double_release_is_object_disposed() -> Result<()> {
        let dir = tempdir()?;
        let file = JournalFile::create(dir.path(), 1, 8, 4096)?;
        file.release()?; // creator reference gone, file disposed
        assert!(matches!(file.release(), Err(DbError::ObjectDisposed(_))));
        assert!(matches!(file.acquire(), Err(DbError::ObjectDisposed(_))));
        Ok(())
    }

    #[test]
    fn retired_file_is_deleted_at_zero_refs() -> Result<()> {
        let dir = tempdir()?;
        let file = JournalFile::create(dir.path(), 2, 8, 4096)?;
        let path = dir.path().join(journal_file_name(2));
        assert!(path.exists());
        file.acquire()?; // a snapshot reference
        file.retire();
        file.release()?; // snapshot gone
        assert!(path.exists());
        file.release()?; // creator gone -> disposed -> deleted
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn translation_is_copy_on_replace() -> Result<()> {
        let dir = tempdir()?;
        let file = JournalFile::create(dir.path(), 3, 8, 4096)?;
        let mut first = HashMap::new();
        first.insert(9u32, 1u64);
        file.merge_translation(&first);
        let snapshot = file.translation();
        let mut second = HashMap::new();
        second.insert(9u32, 5u64);
        file.merge_translation(&second);
        // The earlier snapshot still sees the old offset.
        assert_eq!(snapshot.get(&9), Some(&1));
        assert_eq!(file.lookup(9), Some(5));
        Ok(())
    }
}
