//! Transaction lifecycle.
//!
//! A transaction owns its dirty pages by value (page-number indexed map),
//! the ordered list of pages it freed, its per-tree view of the affected
//! trees, and the end-of-file counter used for allocation. Read transactions
//! additionally hold the journal snapshot captured at begin, which anchors
//! snapshot isolation. Dropping a transaction without commit is a rollback:
//! nothing it allocated is published.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::common::{PageNumber, TxId};
use crate::env::EnvCore;
use crate::error::{DbError, Result};
use crate::journal::{CommitBatch, JournalSnapshot};
use crate::storage::page::{overflow_pages_needed, OwnedNode, Page};
use crate::storage::pager::PagerState;
use crate::tree::{self, PutOutcome, TreeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    ReadWrite,
}

pub struct Transaction {
    core: Arc<EnvCore>,
    ticket: u64,
    id: TxId,
    kind: TransactionKind,
    /// Next end-of-file page for allocation; published only on commit.
    next_page: u64,
    /// Dirty pages, keyed by their (new) page number. Kept sorted so the
    /// commit path writes ascending page numbers.
    dirty: BTreeMap<PageNumber, Page>,
    /// CoW translation: original page number -> current copy.
    cow: HashMap<PageNumber, PageNumber>,
    /// Pages this transaction released; registered with the free-space
    /// handler at commit, deferred past still-active readers.
    freed: Vec<PageNumber>,
    /// Pages taken from the free list; returned there on rollback.
    free_list_allocs: Vec<PageNumber>,
    /// Dirty pages that belong to overflow chains.
    overflow_pages: HashSet<PageNumber>,
    tree_states: HashMap<String, TreeState>,
    modified_trees: BTreeSet<String>,
    multi: HashMap<(String, Vec<u8>), TreeState>,
    root_state: TreeState,
    snapshots: Vec<JournalSnapshot>,
    #[allow(dead_code)]
    pager_state: Arc<PagerState>,
    committed: bool,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        core: Arc<EnvCore>,
        ticket: u64,
        id: TxId,
        kind: TransactionKind,
        next_page: u64,
        root_state: TreeState,
        snapshots: Vec<JournalSnapshot>,
    ) -> Transaction {
        let pager_state = core.pager.state();
        Transaction {
            core,
            ticket,
            id,
            kind,
            next_page,
            dirty: BTreeMap::new(),
            cow: HashMap::new(),
            freed: Vec::new(),
            free_list_allocs: Vec::new(),
            overflow_pages: HashSet::new(),
            tree_states: HashMap::new(),
            modified_trees: BTreeSet::new(),
            multi: HashMap::new(),
            root_state,
            snapshots,
            pager_state,
            committed: false,
            finished: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub(crate) fn page_size(&self) -> usize {
        self.core.pager.page_size()
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.kind != TransactionKind::ReadWrite {
            return Err(DbError::InvalidOperation(
                "read transaction cannot be written through".into(),
            ));
        }
        Ok(())
    }

    /// Read policy: the transaction's own dirty pages win, then the journal
    /// snapshot (newest file first), then the data file.
    pub(crate) fn read_page(&self, page_no: PageNumber) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_no) {
            return Ok(page.clone());
        }
        if let Some(new_no) = self.cow.get(&page_no) {
            if let Some(page) = self.dirty.get(new_no) {
                return Ok(page.clone());
            }
        }
        for snapshot in self.snapshots.iter().rev() {
            if let Some(offset) = snapshot.lookup(page_no) {
                return snapshot.read_page(offset);
            }
        }
        self.core.pager.get(page_no)
    }

    pub(crate) fn dirty_page(&self, page_no: PageNumber) -> Result<Page> {
        self.dirty.get(&page_no).cloned().ok_or_else(|| {
            DbError::Internal(format!("page {page_no} is not dirty in this transaction"))
        })
    }

    pub(crate) fn with_dirty_page<R>(
        &mut self,
        page_no: PageNumber,
        f: impl FnOnce(&mut Page) -> R,
    ) -> Result<R> {
        let page = self.dirty.get_mut(&page_no).ok_or_else(|| {
            DbError::Internal(format!("page {page_no} is not dirty in this transaction"))
        })?;
        Ok(f(page))
    }

    /// Copy-on-write. Returns the page in place when it is already dirty;
    /// otherwise re-allocates it, records old -> new in the dirty map, and
    /// schedules the old number for release.
    pub(crate) fn modify_page(&mut self, page: &Page) -> Result<PageNumber> {
        let old = page.page_number();
        if self.dirty.contains_key(&old) {
            return Ok(old);
        }
        if let Some(&new) = self.cow.get(&old) {
            return Ok(new);
        }
        let new = self.allocate(1)?;
        let mut copy = page.clone();
        copy.set_page_number(new);
        self.dirty.insert(new, copy);
        self.cow.insert(old, new);
        self.freed.push(old);
        trace!(old, new, "page copied on write");
        Ok(new)
    }

    /// Allocation policy: the free-space handler first, then the end-of-file
    /// counter (extending the backing file for multi-page runs).
    fn allocate(&mut self, count: u32) -> Result<PageNumber> {
        if let Some(no) = self.core.freespace.lock().try_allocate(count) {
            for i in 0..count {
                self.free_list_allocs.push(no + i);
            }
            return Ok(no);
        }
        if self.next_page + count as u64 > u32::MAX as u64 {
            return Err(DbError::DatabaseFull(
                "page numbers exhausted".into(),
            ));
        }
        let no = self.next_page as PageNumber;
        self.next_page += count as u64;
        if count > 1 {
            self.core.pager.ensure_continuous(no, count)?;
        }
        Ok(no)
    }

    pub(crate) fn allocate_tree_page(&mut self, flags: u8) -> Result<PageNumber> {
        let no = self.allocate(1)?;
        self.dirty.insert(no, Page::new(no, flags, self.page_size()));
        Ok(no)
    }

    pub(crate) fn allocate_overflow_run(&mut self, count: u32) -> Result<PageNumber> {
        let no = self.allocate(count)?;
        for i in 0..count {
            self.overflow_pages.insert(no + i);
        }
        Ok(no)
    }

    pub(crate) fn insert_dirty(&mut self, page_no: PageNumber, page: Page) {
        self.dirty.insert(page_no, page);
    }

    /// Releases a page. Pages allocated by this very transaction are simply
    /// withdrawn; pre-existing pages join the freed list for deferred
    /// reclamation.
    pub(crate) fn free_page(&mut self, page_no: PageNumber) {
        if self.dirty.remove(&page_no).is_some() {
            self.overflow_pages.remove(&page_no);
            if let Some(i) = self.free_list_allocs.iter().position(|&p| p == page_no) {
                self.free_list_allocs.swap_remove(i);
                self.core.freespace.lock().mark_free(page_no);
                return;
            }
        }
        self.freed.push(page_no);
    }

    /// Releases an overflow chain as one unit.
    pub(crate) fn free_overflow_chain(&mut self, start: PageNumber, total: u32) {
        let pages = overflow_pages_needed(total as usize, self.page_size());
        for i in 0..pages {
            self.free_page(start + i);
        }
    }

    // -- per-transaction tree states ------------------------------------

    pub(crate) fn tree_state(&mut self, name: &str) -> Result<TreeState> {
        match self.lookup_tree_state(name)? {
            Some(state) => Ok(state),
            None => Err(DbError::InvalidOperation(format!("tree '{name}' does not exist"))),
        }
    }

    pub(crate) fn lookup_tree_state(&mut self, name: &str) -> Result<Option<TreeState>> {
        if name.is_empty() {
            return Ok(Some(self.root_state));
        }
        if let Some(state) = self.tree_states.get(name) {
            return Ok(Some(*state));
        }
        let root = self.root_state;
        match tree::get_raw(self, &root, name.as_bytes())? {
            Some(bytes) => {
                let state = tree::tree_state_from_value(&bytes)?;
                self.tree_states.insert(name.to_string(), state);
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn set_tree_state(&mut self, name: &str, state: TreeState) {
        if name.is_empty() {
            self.root_state = state;
        } else {
            self.tree_states.insert(name.to_string(), state);
        }
    }

    pub(crate) fn mark_tree_modified(&mut self, name: &str) {
        if !name.is_empty() {
            self.modified_trees.insert(name.to_string());
        }
    }

    pub(crate) fn forget_tree(&mut self, name: &str) {
        self.tree_states.remove(name);
        self.modified_trees.remove(name);
        self.multi.retain(|(tree, _), _| tree != name);
    }

    pub(crate) fn root_state(&self) -> TreeState {
        self.root_state
    }

    // -- multi-value side table -----------------------------------------

    pub(crate) fn multi_tree_state(&self, key: &(String, Vec<u8>)) -> Option<TreeState> {
        self.multi.get(key).copied()
    }

    pub(crate) fn set_multi_tree_state(&mut self, key: (String, Vec<u8>), state: TreeState) {
        self.multi.insert(key, state);
    }

    pub(crate) fn remove_multi_tree_state(&mut self, key: &(String, Vec<u8>)) -> Option<TreeState> {
        self.multi.remove(key)
    }

    pub(crate) fn take_multi_tree_states(&mut self) -> Vec<((String, Vec<u8>), TreeState)> {
        self.multi.drain().collect()
    }

    // -- lifecycle -------------------------------------------------------

    /// Commits the transaction through the write-ahead journal. The journal
    /// header fsync is the durability point; the data file is only touched
    /// later by the background applier.
    pub fn commit(mut self) -> Result<()> {
        if self.kind == TransactionKind::Read {
            self.finish();
            return Ok(());
        }

        // 1. Multi-value sub-trees first: their roots must land in the
        //    parent leaves before tree states are published.
        tree::multi::flush_multi_trees(&mut self)?;

        // 2. Publish the state of every modified tree into the root tree.
        let modified: Vec<String> = self.modified_trees.iter().cloned().collect();
        for name in &modified {
            let state = *self.tree_states.get(name).ok_or_else(|| {
                DbError::Internal(format!("modified tree '{name}' has no recorded state"))
            })?;
            tree::validate_tree(&self, &state)?;
            let mut root = self.root_state;
            let node = OwnedNode::Data {
                key: name.clone().into_bytes(),
                value: tree::tree_state_value(&state),
                version: 0,
            };
            let (outcome, _) = tree::upsert_node(&mut self, &mut root, node)?;
            if outcome == PutOutcome::Inserted {
                root.entry_count += 1;
            }
            self.root_state = root;
        }
        let root_state = self.root_state;
        tree::validate_tree(&self, &root_state)?;

        if self.dirty.is_empty() {
            // Nothing changed; do not consume a transaction id, so journal
            // txids stay contiguous.
            self.finish();
            return Ok(());
        }

        // 3-8. Journal commit: dirty pages (ascending), transaction header
        // with CRC, fsync. The header fsync is the durability point.
        let batch = CommitBatch {
            txid: self.id,
            next_page_number: self.next_page,
            last_page_number: self.next_page.saturating_sub(1),
            root: self.root_state,
            free_space: self.core.free_space_info(),
            pages: &self.dirty,
            overflow_pages: &self.overflow_pages,
        };
        self.core.journal.commit(&batch)?;
        self.committed = true;

        // Freed pages are registered only now that the transaction is
        // durable; the free-space handler sees them once every older reader
        // has finished.
        let freed = std::mem::take(&mut self.freed);
        if !freed.is_empty() {
            self.core.pending_free.lock().push((self.id, freed));
        }
        debug!(
            txid = self.id,
            pages = self.dirty.len(),
            trees = modified.len(),
            "transaction committed"
        );

        // 9. Post-commit callback: advance the environment's counters.
        self.core.finish_commit(self.id, self.next_page, self.root_state);
        self.finish();
        Ok(())
    }

    /// Explicit abort. Equivalent to dropping the transaction.
    pub fn rollback(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.core.active.remove(&self.ticket);
        if self.kind == TransactionKind::ReadWrite {
            if !self.committed {
                // Dirty allocations were never published; hand free-list
                // pages straight back.
                let mut freespace = self.core.freespace.lock();
                for &no in &self.free_list_allocs {
                    freespace.mark_free(no);
                }
            }
            self.core.writer.release();
        }
        self.snapshots.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}
