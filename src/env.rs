//! Storage environment: the top-level façade.
//!
//! Owns the pager, the journal, the free-space buffers, the
//! active-transactions table, the single writer semaphore, and the
//! transaction counter. All global mutable state lives here with an explicit
//! lifetime; there are no ambient singletons.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::common::{PageNumber, TxId, DEFAULT_PAGE_SIZE, HEADER_PAGE_COUNT};
use crate::error::{DbError, Result};
use crate::journal::{applier, Journal, JournalSnapshot};
use crate::storage::freespace::{max_trackable, FreeSpaceMap};
use crate::storage::header::{FileHeader, FreeSpaceInfo, JournalInfo};
use crate::storage::page::PAGE_LEAF;
use crate::storage::pager::Pager;
use crate::tree::{self, Tree, TreeIter, TreeState};
use crate::txn::{Transaction, TransactionKind};

/// Environment configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Page size; fixed for the lifetime of the environment.
    pub page_size: usize,
    /// Pre-allocated size of each journal file, in bytes.
    pub journal_file_size: u64,
    /// Pages reserved for each of the two free-space buffers.
    pub free_space_buffer_pages: u32,
    /// Run the background journal applier.
    pub background_flush: bool,
    /// How often the background applier wakes up.
    pub flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            journal_file_size: 1024 * 1024,
            free_space_buffer_pages: 4,
            background_flush: true,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// Binary semaphore gating ReadWrite transactions: acquired in
/// `new_transaction(ReadWrite)` and released in the completion callback.
pub(crate) struct WriteSemaphore {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl WriteSemaphore {
    fn new() -> WriteSemaphore {
        WriteSemaphore { locked: Mutex::new(false), cv: Condvar::new() }
    }

    pub(crate) fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    pub(crate) fn release(&self) {
        *self.locked.lock() = false;
        self.cv.notify_one();
    }
}

pub(crate) struct ActiveTxn {
    /// Journal application may not cross this transaction id.
    pub(crate) barrier: TxId,
}

/// The two alternating free-space buffers and their on-disk location.
pub(crate) struct FreeSpace {
    maps: [FreeSpaceMap; 2],
    /// Buffer the writer currently mutates.
    current: usize,
    /// Buffer whose on-disk region holds the latest flushed bits.
    disk_buffer: usize,
    first_buffer_page: PageNumber,
    buffer_pages: u32,
    tracked_pages: u32,
}

impl FreeSpace {
    pub(crate) fn try_allocate(&mut self, count: u32) -> Option<PageNumber> {
        self.maps[self.current].try_allocate(count)
    }

    pub(crate) fn mark_free(&mut self, page_no: PageNumber) {
        if page_no < self.tracked_pages {
            self.maps[self.current].mark_page(page_no, true);
        } else {
            warn!(page_no, "freed page outside the tracked range");
        }
    }

    fn mark_allocated(&mut self, page_no: PageNumber) {
        if page_no < self.tracked_pages {
            self.maps[self.current].mark_page(page_no, false);
        }
    }

    fn free_count(&self) -> u64 {
        self.maps[self.current].free_page_count()
    }

    fn info(&self) -> FreeSpaceInfo {
        FreeSpaceInfo {
            first_buffer_page: self.first_buffer_page as i64,
            buffer_pages: self.buffer_pages as i64,
            tracked_pages: self.tracked_pages as i64,
            current_buffer: self.disk_buffer as i64,
            reserved: 0,
        }
    }
}

/// Mutable environment-wide counters, updated at commit and flush.
pub(crate) struct EnvMeta {
    pub(crate) last_txid: TxId,
    pub(crate) next_page: u64,
    pub(crate) root: TreeState,
    pub(crate) journal: JournalInfo,
}

pub(crate) struct EnvCore {
    pub(crate) config: Config,
    pub(crate) pager: Pager,
    pub(crate) journal: Journal,
    pub(crate) freespace: Mutex<FreeSpace>,
    pub(crate) meta: RwLock<EnvMeta>,
    /// Concurrent map of active transactions, keyed by ticket.
    pub(crate) active: DashMap<u64, ActiveTxn>,
    pub(crate) ticket_counter: AtomicU64,
    pub(crate) writer: WriteSemaphore,
    /// Freed pages waiting for older readers to finish, per transaction.
    pub(crate) pending_free: Mutex<Vec<(TxId, Vec<PageNumber>)>>,
    /// Serializes journal application (background thread vs explicit flush).
    pub(crate) applier_lock: Mutex<()>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

impl EnvCore {
    pub(crate) fn begin(self: &Arc<Self>, kind: TransactionKind) -> Result<Transaction> {
        match kind {
            TransactionKind::ReadWrite => {
                self.writer.acquire();
                let (id, next_page, root) = {
                    let meta = self.meta.read();
                    (meta.last_txid + 1, meta.next_page, meta.root)
                };
                let ticket = self.ticket_counter.fetch_add(1, Ordering::AcqRel);
                self.active.insert(ticket, ActiveTxn { barrier: id });
                let snapshots: Vec<JournalSnapshot> = self.journal.snapshot();
                Ok(Transaction::new(self.clone(), ticket, id, kind, next_page, root, snapshots))
            }
            TransactionKind::Read => {
                let (anchor, next_page, root) = {
                    let meta = self.meta.read();
                    (meta.last_txid, meta.next_page, meta.root)
                };
                let ticket = self.ticket_counter.fetch_add(1, Ordering::AcqRel);
                self.active.insert(ticket, ActiveTxn { barrier: anchor + 1 });
                let snapshots = self.journal.snapshot();
                Ok(Transaction::new(self.clone(), ticket, anchor, kind, next_page, root, snapshots))
            }
        }
    }

    /// Post-commit callback: advances the transaction counter and publishes
    /// the committed root state and end-of-file counter.
    pub(crate) fn finish_commit(&self, id: TxId, next_page: u64, root: TreeState) {
        let mut meta = self.meta.write();
        meta.last_txid = id;
        meta.next_page = next_page;
        meta.root = root;
    }

    pub(crate) fn oldest_active_barrier(&self) -> TxId {
        self.active.iter().map(|e| e.barrier).min().unwrap_or(TxId::MAX)
    }

    /// Hands pages freed by transactions behind `barrier` to the free-space
    /// handler; later readers can no longer observe them.
    pub(crate) fn release_pending_free(&self, barrier: TxId) {
        let released: Vec<Vec<PageNumber>> = {
            let mut pending = self.pending_free.lock();
            let (ready, keep): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(txid, _)| *txid < barrier);
            *pending = keep;
            ready.into_iter().map(|(_, pages)| pages).collect()
        };
        if released.is_empty() {
            return;
        }
        let mut freespace = self.freespace.lock();
        for pages in released {
            for page in pages {
                freespace.mark_free(page);
            }
        }
    }

    pub(crate) fn free_space_info(&self) -> FreeSpaceInfo {
        self.freespace.lock().info()
    }

    /// Writes the current free-space buffer to its on-disk region, converges
    /// the back buffer via the dirty-chunk copy, and swaps roles so the next
    /// commit builds on the other buffer. Returns the header block
    /// describing what is now on disk.
    pub(crate) fn flush_free_space(&self) -> Result<FreeSpaceInfo> {
        let mut fs = self.freespace.lock();
        let current = fs.current;
        if !fs.maps[current].dirty_chunks().is_empty() {
            let region_start = fs.first_buffer_page + current as u32 * fs.buffer_pages;
            self.pager.write_raw(region_start, fs.maps[current].as_bytes())?;
            let (front, back) = fs.maps.split_at_mut(1);
            if current == 0 {
                front[0].copy_dirty_pages_to(&mut back[0]);
            } else {
                back[0].copy_dirty_pages_to(&mut front[0]);
            }
            fs.maps[current].clear_modification_bits();
            fs.disk_buffer = current;
            fs.current = 1 - current;
        }
        Ok(fs.info())
    }
}

/// Embedded storage environment over one directory: a single data file plus
/// its journal files.
pub struct Environment {
    core: Arc<EnvCore>,
    applier_thread: Option<JoinHandle<()>>,
}

impl Environment {
    /// Opens (or creates) an environment in `path`.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Environment> {
        let dir: PathBuf = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let pager = Pager::open(&dir.join("data.db"), config.page_size)?;
        let journal = Journal::new(&dir, config.page_size, config.journal_file_size);

        let fresh = pager.number_of_allocated_pages() < HEADER_PAGE_COUNT as u64;
        let core = if fresh {
            Self::bootstrap(config, pager, journal)?
        } else {
            Self::open_existing(config, pager, journal)?
        };

        let applier_thread = if core.config.background_flush {
            let worker = core.clone();
            Some(std::thread::spawn(move || loop {
                {
                    let mut shutdown = worker.shutdown.lock();
                    if *shutdown {
                        break;
                    }
                    let _ = worker
                        .shutdown_cv
                        .wait_for(&mut shutdown, worker.config.flush_interval);
                    if *shutdown {
                        break;
                    }
                }
                if let Err(e) = applier::apply(&worker) {
                    warn!(error = %e, "background journal application failed");
                }
            }))
        } else {
            None
        };

        Ok(Environment { core, applier_thread })
    }

    fn bootstrap(config: Config, pager: Pager, journal: Journal) -> Result<Arc<EnvCore>> {
        let page_size = config.page_size;
        let buffer_pages = config.free_space_buffer_pages;
        let buffer_len = buffer_pages as usize * page_size;
        let tracked = max_trackable(buffer_len, page_size);
        let maps = [
            FreeSpaceMap::new(buffer_len, tracked, page_size)?,
            FreeSpaceMap::new(buffer_len, tracked, page_size)?,
        ];
        let data_start = HEADER_PAGE_COUNT + 2 * buffer_pages;

        // Free-space buffers, then both header copies.
        pager.write_raw(HEADER_PAGE_COUNT, maps[0].as_bytes())?;
        pager.write_raw(HEADER_PAGE_COUNT + buffer_pages, maps[1].as_bytes())?;
        let freespace = FreeSpace {
            maps,
            current: 0,
            disk_buffer: 0,
            first_buffer_page: HEADER_PAGE_COUNT,
            buffer_pages,
            tracked_pages: tracked,
        };
        let header = FileHeader {
            journal: JournalInfo::default(),
            transaction_id: 0,
            last_page_number: data_start as u64 - 1,
            free_space: freespace.info(),
            root: TreeState::default(),
        };
        let mut buf = pager.temp_page();
        header.write_into(&mut buf);
        pager.write_raw(0, &buf)?;
        pager.write_raw(1, &buf)?;
        pager.sync()?;

        let core = Arc::new(EnvCore {
            config,
            pager,
            journal,
            freespace: Mutex::new(freespace),
            meta: RwLock::new(EnvMeta {
                last_txid: 0,
                next_page: data_start as u64,
                root: TreeState::default(),
                journal: JournalInfo::default(),
            }),
            active: DashMap::new(),
            ticket_counter: AtomicU64::new(1),
            writer: WriteSemaphore::new(),
            pending_free: Mutex::new(Vec::new()),
            applier_lock: Mutex::new(()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        });

        // Boot transaction: materialize the empty root tree.
        let mut txn = core.begin(TransactionKind::ReadWrite)?;
        let root_page = txn.allocate_tree_page(PAGE_LEAF)?;
        txn.set_tree_state(
            "",
            TreeState { root_page, depth: 1, page_count: 1, entry_count: 0 },
        );
        txn.commit()?;
        info!(data_start, tracked, "environment created");
        Ok(core)
    }

    fn open_existing(config: Config, pager: Pager, journal: Journal) -> Result<Arc<EnvCore>> {
        let read_header = |slot: PageNumber| -> Result<FileHeader> {
            let page = pager.get(slot)?;
            FileHeader::read_from(page.as_bytes())
        };
        let header = FileHeader::choose(read_header(0), read_header(1))?;

        let page_size = config.page_size;
        let buffer_pages = header.free_space.buffer_pages as u32;
        let tracked = header.free_space.tracked_pages as u32;
        let first_buffer_page = header.free_space.first_buffer_page as PageNumber;
        let current = (header.free_space.current_buffer & 1) as usize;

        let read_buffer = |index: usize| -> Result<FreeSpaceMap> {
            let start = first_buffer_page + index as u32 * buffer_pages;
            let mut bytes = Vec::with_capacity(buffer_pages as usize * page_size);
            for i in 0..buffer_pages {
                bytes.extend_from_slice(pager.get(start + i)?.as_bytes());
            }
            FreeSpaceMap::from_bytes(bytes, tracked, page_size)
        };
        let maps = [read_buffer(0)?, read_buffer(1)?];
        let mut freespace = FreeSpace {
            maps,
            current,
            disk_buffer: current,
            first_buffer_page,
            buffer_pages,
            tracked_pages: tracked,
        };

        // Replay the journal; the last committed header supersedes the file
        // header for counters and the root tree.
        let recovered = journal.recover(&header)?;
        let (last_txid, next_page, root) = match &recovered.last {
            Some(hdr) => (hdr.txid, hdr.next_page_number, hdr.root),
            None => (header.transaction_id, header.last_page_number + 1, header.root),
        };

        // Committed-but-unapplied pages are allocated even though the
        // on-disk bitmap predates them.
        for file in journal.files_snapshot().iter() {
            for (&page, _) in file.translation().iter() {
                freespace.mark_allocated(page);
            }
        }

        info!(last_txid, next_page, "environment opened");
        Ok(Arc::new(EnvCore {
            config,
            pager,
            journal,
            freespace: Mutex::new(freespace),
            meta: RwLock::new(EnvMeta { last_txid, next_page, root, journal: header.journal }),
            active: DashMap::new(),
            ticket_counter: AtomicU64::new(1),
            writer: WriteSemaphore::new(),
            pending_free: Mutex::new(Vec::new()),
            applier_lock: Mutex::new(()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        }))
    }

    /// Opens a transaction. ReadWrite transactions serialize on the writer
    /// semaphore; any number of Read transactions run concurrently.
    pub fn new_transaction(&self, kind: TransactionKind) -> Result<Transaction> {
        self.core.begin(kind)
    }

    /// Creates a named tree (idempotent).
    pub fn create_tree(&self, txn: &mut Transaction, name: &str) -> Result<Tree> {
        txn.require_writable()?;
        if name.is_empty() {
            return Err(DbError::InvalidOperation("the root tree has the empty name".into()));
        }
        if txn.lookup_tree_state(name)?.is_some() {
            return Ok(Tree::new(name));
        }
        let root_page = txn.allocate_tree_page(PAGE_LEAF)?;
        txn.set_tree_state(
            name,
            TreeState { root_page, depth: 1, page_count: 1, entry_count: 0 },
        );
        txn.mark_tree_modified(name);
        Ok(Tree::new(name))
    }

    pub fn get_tree(&self, txn: &mut Transaction, name: &str) -> Result<Option<Tree>> {
        if name.is_empty() {
            return Ok(Some(Tree::new("")));
        }
        Ok(txn.lookup_tree_state(name)?.map(|_| Tree::new(name)))
    }

    /// Deletes a named tree, releasing every page it owns.
    pub fn delete_tree(&self, txn: &mut Transaction, name: &str) -> Result<bool> {
        txn.require_writable()?;
        if name.is_empty() {
            return Err(DbError::InvalidOperation("the root tree cannot be deleted".into()));
        }
        let Some(state) = txn.lookup_tree_state(name)? else {
            return Ok(false);
        };
        tree::free_tree(txn, &state)?;
        let mut root = txn.root_state();
        let removed = tree::delete_raw(txn, &mut root, name.as_bytes())?;
        txn.set_tree_state("", root);
        txn.forget_tree(name);
        Ok(removed)
    }

    /// A read-only snapshot anchored at the current committed state.
    pub fn create_snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot { txn: self.new_transaction(TransactionKind::Read)? })
    }

    /// Streams a consistent copy of the data file: pages 0 and 1 verbatim,
    /// then every page up to the current end-of-file counter. Header
    /// mutation is fenced by an uncommitted write transaction; neither
    /// transaction commits.
    pub fn backup<W: Write>(&self, out: &mut W) -> Result<u64> {
        let fence = self.new_transaction(TransactionKind::ReadWrite)?;
        // Bring the data file up to date so raw page copies are current.
        applier::apply(&self.core)?;
        let reader = self.new_transaction(TransactionKind::Read)?;
        let next_page = self.core.meta.read().next_page;
        let page_size = self.core.pager.page_size();
        let backed = self.core.pager.number_of_allocated_pages();

        let mut written = 0u64;
        let zeroes = vec![0u8; page_size];
        for page_no in 0..next_page {
            if page_no < backed {
                out.write_all(self.core.pager.get(page_no as PageNumber)?.as_bytes())?;
            } else {
                // allocated numbering the data file does not back yet
                out.write_all(&zeroes)?;
            }
            written += page_size as u64;
        }
        drop(reader);
        fence.rollback();
        Ok(written)
    }

    /// Applies outstanding journal transactions to the data file now.
    pub fn flush_journal(&self) -> Result<bool> {
        applier::apply(&self.core)
    }

    pub fn stats(&self) -> EnvironmentStats {
        let meta = self.core.meta.read();
        EnvironmentStats {
            allocated_pages: self.core.pager.number_of_allocated_pages(),
            free_pages: self.core.freespace.lock().free_count(),
            active_transactions: self.core.active.len(),
            journal_files: self.core.journal.file_count(),
            last_transaction_id: meta.last_txid,
            next_page_number: meta.next_page,
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        *self.core.shutdown.lock() = true;
        self.core.shutdown_cv.notify_all();
        if let Some(handle) = self.applier_thread.take() {
            let _ = handle.join();
        }
        // Final flush keeps the next open cheap; failure only means a longer
        // recovery.
        if let Err(e) = applier::apply(&self.core) {
            warn!(error = %e, "final journal application failed");
        }
    }
}

/// Read-only view over the committed state, for callers that do not want to
/// manage transactions.
pub struct Snapshot {
    txn: Transaction,
}

impl Snapshot {
    pub fn get(&mut self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(state) = self.txn.lookup_tree_state(tree)? else {
            return Ok(None);
        };
        tree::get_raw(&self.txn, &state, key)
    }

    pub fn iter<'s>(&'s mut self, tree: &str) -> Result<Option<TreeIter<'s>>> {
        let Some(state) = self.txn.lookup_tree_state(tree)? else {
            return Ok(None);
        };
        Ok(Some(TreeIter::seek(&self.txn, &state, None)?))
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentStats {
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub active_transactions: usize,
    pub journal_files: usize,
    pub last_transaction_id: TxId,
    pub next_page_number: u64,
}
