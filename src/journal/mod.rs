//! Write-ahead journal.
//!
//! Commits append the transaction's dirty pages to the current journal file,
//! follow them with a transaction header carrying a CRC over exactly those
//! page bytes, and fsync; the data file is only brought up to date later by
//! the applier (`applier` module). A transaction that does not fit the
//! remaining space of one journal file spills into exactly one successor
//! (`Start|Split` then `Split|Commit`); anything larger is rejected.

pub mod applier;
pub mod file;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::{JournalNumber, PageNumber, TxId};
use crate::error::{DbError, Result};
use crate::storage::header::{FileHeader, FreeSpaceInfo};
use crate::storage::page::Page;
use crate::tree::TreeState;
use file::JournalFile;

pub const TX_START: u8 = 1;
pub const TX_SPLIT: u8 = 2;
pub const TX_COMMIT: u8 = 4;

const TX_HEADER_MARKER: [u8; 8] = *b"COWTXN\x00\x01";
const TX_HEADER_SIZE: usize = 120;

/// First page of every transaction inside a journal file.
#[derive(Debug, Clone)]
pub struct TransactionHeader {
    pub txid: TxId,
    pub next_page_number: u64,
    pub last_page_number: u64,
    pub page_count: u32,
    pub overflow_page_count: u32,
    pub crc: u32,
    pub marker: u8,
    pub root: TreeState,
    pub free_space: FreeSpaceInfo,
    pub page_number_in_log_file: u64,
}

impl TransactionHeader {
    pub fn write_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= TX_HEADER_SIZE);
        buf[0..8].copy_from_slice(&TX_HEADER_MARKER);
        buf[8..16].copy_from_slice(&self.txid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_page_number.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_page_number.to_le_bytes());
        buf[32..36].copy_from_slice(&self.page_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.overflow_page_count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.crc.to_le_bytes());
        buf[44] = self.marker;
        buf[45] = 0;
        buf[46] = 0;
        buf[47] = 0;
        self.root.write_into(&mut buf[48..72]);
        self.free_space.write_into(&mut buf[72..112]);
        buf[112..120].copy_from_slice(&self.page_number_in_log_file.to_le_bytes());
    }

    /// Parses a candidate header page. `None` means the bytes do not start a
    /// transaction (recovery stops there).
    pub fn read_from(buf: &[u8]) -> Option<TransactionHeader> {
        if buf.len() < TX_HEADER_SIZE || buf[0..8] != TX_HEADER_MARKER {
            return None;
        }
        Some(TransactionHeader {
            txid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            next_page_number: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_page_number: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            page_count: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            overflow_page_count: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            marker: buf[44],
            root: TreeState::read_from(&buf[48..72]),
            free_space: FreeSpaceInfo::read_from(&buf[72..112]),
            page_number_in_log_file: u64::from_le_bytes(buf[112..120].try_into().unwrap()),
        })
    }
}

/// What a committing transaction hands to the journal.
pub struct CommitBatch<'a> {
    pub txid: TxId,
    pub next_page_number: u64,
    pub last_page_number: u64,
    pub root: TreeState,
    pub free_space: FreeSpaceInfo,
    /// Dirty pages keyed by target data-page number (ascending).
    pub pages: &'a BTreeMap<PageNumber, Page>,
    pub overflow_pages: &'a HashSet<PageNumber>,
}

/// A read transaction's view of one journal file: the file (referenced) and
/// the translation table captured at begin time.
pub struct JournalSnapshot {
    file: Arc<JournalFile>,
    table: Arc<HashMap<PageNumber, u64>>,
}

impl JournalSnapshot {
    pub fn lookup(&self, page_no: PageNumber) -> Option<u64> {
        self.table.get(&page_no).copied()
    }

    pub fn read_page(&self, page_offset: u64) -> Result<Page> {
        Ok(Page::from_bytes(self.file.read_page_at(page_offset)?))
    }
}

impl Drop for JournalSnapshot {
    fn drop(&mut self) {
        if let Err(e) = self.file.release() {
            warn!(error = %e, "journal snapshot release failed");
        }
    }
}

/// State recovered from the journal directory at open.
pub struct RecoveredState {
    /// Header of the last committed transaction found, if any.
    pub last: Option<TransactionHeader>,
}

pub struct Journal {
    dir: PathBuf,
    page_size: usize,
    file_capacity_pages: u64,
    files: RwLock<Arc<Vec<Arc<JournalFile>>>>,
    current: Mutex<Option<Arc<JournalFile>>>,
    next_number: AtomicU64,
}

impl Journal {
    pub fn new(dir: &Path, page_size: usize, file_size_bytes: u64) -> Journal {
        let file_capacity_pages = (file_size_bytes / page_size as u64).max(4);
        Journal {
            dir: dir.to_path_buf(),
            page_size,
            file_capacity_pages,
            files: RwLock::new(Arc::new(Vec::new())),
            current: Mutex::new(None),
            next_number: AtomicU64::new(1),
        }
    }

    pub fn file_capacity_pages(&self) -> u64 {
        self.file_capacity_pages
    }

    pub fn files_snapshot(&self) -> Arc<Vec<Arc<JournalFile>>> {
        self.files.read().clone()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn recent_number(&self) -> JournalNumber {
        self.files.read().last().map(|f| f.number()).unwrap_or(0)
    }

    fn rotate(&self) -> Result<Arc<JournalFile>> {
        let number = self.next_number.fetch_add(1, Ordering::AcqRel);
        let file = JournalFile::create(&self.dir, number, self.file_capacity_pages, self.page_size)?;
        let mut files = self.files.write();
        let mut next = Vec::clone(&files);
        next.push(file.clone());
        *files = Arc::new(next);
        Ok(file)
    }

    /// Commits a transaction: pages first, then the header with CRC, then
    /// fsync; the translation table is published last.
    pub fn commit(&self, batch: &CommitBatch<'_>) -> Result<()> {
        let total = batch.pages.len() as u64;
        let cap = self.file_capacity_pages;
        if total + 2 > 2 * cap {
            return Err(DbError::TransactionTooLarge { needed: total + 2, capacity: cap });
        }

        let mut current = self.current.lock();
        if current.as_ref().map_or(true, |f| f.available_pages() < 2) {
            *current = Some(self.rotate()?);
        }
        let first = current.as_ref().expect("current journal file").clone();
        let room = first.available_pages() - 1; // header page
        let pages: Vec<(&PageNumber, &Page)> = batch.pages.iter().collect();

        if total <= room {
            self.write_segment(&first, batch, &pages, TX_START | TX_COMMIT)?;
        } else {
            let fit = room as usize;
            let rest = &pages[fit..];
            if rest.len() as u64 + 1 > cap {
                return Err(DbError::TransactionTooLarge {
                    needed: total + 2,
                    capacity: cap,
                });
            }
            self.write_segment(&first, batch, &pages[..fit], TX_START | TX_SPLIT)?;
            first.mark_full();
            let second = self.rotate()?;
            *current = Some(second.clone());
            self.write_segment(&second, batch, rest, TX_SPLIT | TX_COMMIT)?;
            debug!(txid = batch.txid, "transaction split across two journal files");
        }

        if current.as_ref().map_or(false, |f| f.available_pages() < 2) {
            current.as_ref().expect("current journal file").mark_full();
            *current = None;
        }
        Ok(())
    }

    fn write_segment(
        &self,
        file: &Arc<JournalFile>,
        batch: &CommitBatch<'_>,
        pages: &[(&PageNumber, &Page)],
        marker: u8,
    ) -> Result<()> {
        let start = file.write_page();
        let mut hasher = crc32fast::Hasher::new();
        let mut entries: HashMap<PageNumber, u64> = HashMap::with_capacity(pages.len());
        let mut overflow = 0u32;
        for (i, (no, page)) in pages.iter().enumerate() {
            let pos = start + 1 + i as u64;
            file.write_page_at(pos, page.as_bytes())?;
            hasher.update(page.as_bytes());
            entries.insert(**no, pos);
            if batch.overflow_pages.contains(*no) {
                overflow += 1;
            }
        }
        let header = TransactionHeader {
            txid: batch.txid,
            next_page_number: batch.next_page_number,
            last_page_number: batch.last_page_number,
            page_count: pages.len() as u32 - overflow,
            overflow_page_count: overflow,
            crc: hasher.finalize(),
            marker,
            root: batch.root,
            free_space: batch.free_space,
            page_number_in_log_file: start,
        };
        let mut buf = vec![0u8; self.page_size];
        header.write_into(&mut buf);
        file.write_page_at(start, &buf)?;
        file.sync()?;
        file.merge_translation(&entries);
        file.set_write_page(start + 1 + pages.len() as u64);
        Ok(())
    }

    /// Captures `(journal file, translation table)` pairs for a transaction
    /// at begin time; lookup scans newest-to-oldest.
    pub fn snapshot(&self) -> Vec<JournalSnapshot> {
        let files = self.files.read();
        files
            .iter()
            .filter_map(|f| {
                f.acquire().ok()?;
                Some(JournalSnapshot { file: f.clone(), table: f.translation() })
            })
            .collect()
    }

    /// Scans the journal directory, replays committed transactions into the
    /// per-file translation tables, and stops at the first corruption (which
    /// is treated as the uncommitted tail).
    pub fn recover(&self, header: &FileHeader) -> Result<RecoveredState> {
        let mut numbers: Vec<JournalNumber> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".journal") {
                if let Ok(n) = stem.parse::<u64>() {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();

        let last_synced_log = header.journal.last_synced_log;
        let last_synced_page = header.journal.last_synced_log_page;
        let mut opened: Vec<Arc<JournalFile>> = Vec::new();
        let mut expected_next: TxId = header.transaction_id + 1;
        let mut pending_split: Option<(TxId, Vec<(Arc<JournalFile>, HashMap<PageNumber, u64>)>)> =
            None;
        let mut last: Option<TransactionHeader> = None;

        'files: for number in numbers {
            if (number as i64) < last_synced_log {
                // Fully applied before the last header flush; nothing left
                // to replay.
                if let Err(e) = std::fs::remove_file(self.dir.join(file::journal_file_name(number)))
                {
                    warn!(number, error = %e, "could not remove stale journal file");
                }
                continue;
            }
            let jf = JournalFile::open(&self.dir, number, self.page_size)?;
            opened.push(jf.clone());
            let mut pos: u64 = if (number as i64) == last_synced_log {
                (last_synced_page + 1).max(0) as u64
            } else {
                0
            };
            jf.set_write_page(pos);

            while pos < jf.capacity_pages() {
                let buf = jf.read_page_at(pos)?;
                let Some(hdr) = TransactionHeader::read_from(&buf) else {
                    break 'files;
                };
                if let Some((split_txid, _)) = &pending_split {
                    if hdr.marker & TX_SPLIT == 0 || hdr.txid != *split_txid {
                        warn!(txid = hdr.txid, "broken split sequence in journal");
                        break 'files;
                    }
                } else {
                    if hdr.marker & TX_START == 0 || hdr.txid != expected_next {
                        break 'files;
                    }
                }
                let n = (hdr.page_count + hdr.overflow_page_count) as u64;
                if pos + 1 + n > jf.capacity_pages() {
                    warn!(txid = hdr.txid, "journal transaction extends past the file");
                    break 'files;
                }
                let mut hasher = crc32fast::Hasher::new();
                let mut entries: HashMap<PageNumber, u64> = HashMap::new();
                for i in 0..n {
                    let image = jf.read_page_at(pos + 1 + i)?;
                    hasher.update(&image);
                    let logical = u32::from_le_bytes(image[0..4].try_into().unwrap());
                    entries.insert(logical, pos + 1 + i);
                }
                if hasher.finalize() != hdr.crc {
                    // CRC mismatch: the transaction never committed; stop
                    // here, later pages will be overwritten.
                    warn!(txid = hdr.txid, "checksum mismatch, treating as uncommitted");
                    break 'files;
                }
                if hdr.marker & TX_COMMIT != 0 {
                    if let Some((_, segments)) = pending_split.take() {
                        for (f, e) in segments {
                            f.merge_translation(&e);
                        }
                    }
                    jf.merge_translation(&entries);
                    expected_next = hdr.txid + 1;
                    last = Some(hdr);
                } else {
                    pending_split
                        .get_or_insert_with(|| (hdr.txid, Vec::new()))
                        .1
                        .push((jf.clone(), entries));
                }
                pos += 1 + n;
                jf.set_write_page(pos);
            }
        }

        // Resume appending into the last file when it still has room.
        let mut current = self.current.lock();
        *current = opened.iter().last().filter(|f| f.available_pages() >= 2).cloned();
        if let Some(max) = opened.iter().map(|f| f.number()).max() {
            self.next_number.store(max + 1, Ordering::Release);
        }
        *self.files.write() = Arc::new(opened);

        if let Some(hdr) = &last {
            info!(
                txid = hdr.txid,
                files = self.file_count(),
                "journal recovery replayed committed transactions"
            );
        }
        Ok(RecoveredState { last })
    }

    /// Drops journal files older than `before` from the file list, marking
    /// them for deletion once every snapshot reference is gone.
    pub fn retire_files_before(&self, before: JournalNumber) {
        let mut files = self.files.write();
        let mut kept = Vec::new();
        for f in files.iter() {
            if f.number() < before {
                f.retire();
                if let Err(e) = f.release() {
                    warn!(number = f.number(), error = %e, "retiring journal file failed");
                }
            } else {
                kept.push(f.clone());
            }
        }
        *files = Arc::new(kept);
    }
}
