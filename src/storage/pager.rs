//! File-backed pager.
//!
//! Presents the data file as an array of fixed-size pages. Reads are served
//! by seeking under a mutex and copying into an owned page image; growing
//! the file bumps a generation counter so that transactions can pin the
//! generation they started on (`PagerState`). For this file-stream
//! implementation, page views are buffers owned by the caller, so `flush` of
//! a range is write-through; `sync` performs the full fsync.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::PageNumber;
use crate::error::{DbError, Result};
use crate::storage::page::Page;

/// Generation token for page views. A transaction pins the state it started
/// on; the pager publishes a new state whenever the backing file grows.
#[derive(Debug)]
pub struct PagerState {
    pub generation: u64,
    pub allocated_pages: u64,
}

pub struct Pager {
    file: Mutex<File>,
    page_size: usize,
    allocated_pages: AtomicU64,
    state: RwLock<Arc<PagerState>>,
}

impl Pager {
    pub fn open(path: &Path, page_size: usize) -> Result<Pager> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len();
        let allocated = len / page_size as u64;
        Ok(Pager {
            file: Mutex::new(file),
            page_size,
            allocated_pages: AtomicU64::new(allocated),
            state: RwLock::new(Arc::new(PagerState { generation: 0, allocated_pages: allocated })),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn number_of_allocated_pages(&self) -> u64 {
        self.allocated_pages.load(Ordering::Acquire)
    }

    /// Pins the current pager generation.
    pub fn state(&self) -> Arc<PagerState> {
        self.state.read().clone()
    }

    /// Reads the page image at `page_no`.
    pub fn get(&self, page_no: PageNumber) -> Result<Page> {
        if (page_no as u64) >= self.number_of_allocated_pages() {
            return Err(DbError::InvalidFormat(format!(
                "page {page_no} is beyond the end of the data file"
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Page::from_bytes(buf))
    }

    /// Grows the file to back `new_length` pages and publishes a new
    /// generation. A no-op if the file is already large enough.
    pub fn allocate_more_pages(&self, new_length: u64) -> Result<()> {
        let current = self.number_of_allocated_pages();
        if new_length <= current {
            return Ok(());
        }
        {
            let file = self.file.lock();
            file.set_len(new_length * self.page_size as u64)
                .map_err(|e| DbError::DatabaseFull(format!("cannot extend data file: {e}")))?;
        }
        self.allocated_pages.store(new_length, Ordering::Release);
        let mut state = self.state.write();
        let generation = state.generation + 1;
        *state = Arc::new(PagerState { generation, allocated_pages: new_length });
        debug!(pages = new_length, generation, "data file extended");
        Ok(())
    }

    /// Ensures pages `[first, first + count)` are backed by the file.
    pub fn ensure_continuous(&self, first: PageNumber, count: u32) -> Result<()> {
        self.allocate_more_pages(first as u64 + count as u64)
    }

    /// Writes a page image at its native page number.
    pub fn write(&self, page: &Page) -> Result<()> {
        self.write_to(page, page.page_number())
    }

    /// Writes a page image at an explicit target page number.
    pub fn write_to(&self, page: &Page, target: PageNumber) -> Result<()> {
        debug_assert_eq!(page.page_size(), self.page_size);
        self.write_raw(target, page.as_bytes())
    }

    pub fn write_raw(&self, target: PageNumber, bytes: &[u8]) -> Result<()> {
        let end = target as u64 + (bytes.len() as u64).div_ceil(self.page_size as u64);
        self.allocate_more_pages(end)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(target as u64 * self.page_size as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Range flush. Writes in this implementation go straight to the file
    /// descriptor, so there is no dirty mapping to push; durability comes
    /// from `sync`.
    pub fn flush(&self, _first: PageNumber, _count: u32) -> Result<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    /// Full fsync of the data file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// A scratch page-sized buffer for the commit path (file-header
    /// construction).
    pub fn temp_page(&self) -> Vec<u8> {
        vec![0u8; self.page_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_LEAF;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::open(&dir.path().join("data.db"), 4096)?;
        let page = Page::new(3, PAGE_LEAF, 4096);
        pager.write(&page)?;
        assert_eq!(pager.number_of_allocated_pages(), 4);
        let loaded = pager.get(3)?;
        assert_eq!(loaded.page_number(), 3);
        assert!(loaded.is_leaf());
        Ok(())
    }

    #[test]
    fn growth_publishes_new_generation() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::open(&dir.path().join("data.db"), 4096)?;
        let pinned = pager.state();
        pager.ensure_continuous(10, 4)?;
        assert_eq!(pager.number_of_allocated_pages(), 14);
        let fresh = pager.state();
        assert!(fresh.generation > pinned.generation);
        assert_eq!(pinned.generation, 0);
        Ok(())
    }

    #[test]
    fn read_past_end_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::open(&dir.path().join("data.db"), 4096)?;
        assert!(matches!(pager.get(0), Err(DbError::InvalidFormat(_))));
        Ok(())
    }
}
