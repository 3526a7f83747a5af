//! Copy-on-write B+ tree over byte-string keys.
//!
//! Every mutation first re-allocates the page being touched through the
//! owning transaction (`modify_page`), dirtying the whole ancestor path
//! recorded by the cursor; page numbers therefore change on every write and
//! the tree's root page number is part of the per-transaction tree state.

pub mod cursor;
pub mod multi;

use tracing::trace;

use crate::common::PageNumber;
use crate::error::{DbError, Result};
use crate::storage::page::{
    leaf_node_size, max_inline_node_size, usable_space, OwnedNode, Page, SubTreeHeader,
    PAGE_BRANCH, PAGE_HEADER_SIZE, PAGE_LEAF,
};
use crate::txn::Transaction;
use cursor::{Cursor, PathFrame};

/// Persistent state of one tree: what the root tree stores under the tree's
/// name, and what the file header stores for the root tree itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeState {
    pub root_page: PageNumber,
    pub depth: u32,
    pub page_count: u64,
    pub entry_count: u64,
}

pub const TREE_STATE_SIZE: usize = 24;

impl TreeState {
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.root_page.to_le_bytes());
        buf[4..8].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.page_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_count.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> TreeState {
        TreeState {
            root_page: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            depth: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            page_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            entry_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TREE_STATE_SIZE];
        self.write_into(&mut buf);
        buf
    }

    fn from_sub(sub: &SubTreeHeader) -> TreeState {
        TreeState {
            root_page: sub.root_page,
            depth: sub.depth,
            page_count: 0,
            entry_count: sub.entry_count,
        }
    }
}

/// Outcome of an upsert: no exception-style duplicate-key flow, the caller
/// learns whether the slot was created or rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Copy)]
pub struct PutResult {
    pub outcome: PutOutcome,
    /// Monotonically increasing per-slot version counter.
    pub version: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    pub depth: u32,
    pub page_count: u64,
    pub entry_count: u64,
}

/// Handle to a named tree within a transaction's scope. The root tree has
/// the empty name.
#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
}

impl Tree {
    pub(crate) fn new(name: impl Into<String>) -> Tree {
        Tree { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Point lookup. Returns `None` for missing keys and for keys holding a
    /// multi-value set (use `multi_iter` for those).
    pub fn get(&self, txn: &mut Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = txn.tree_state(&self.name)?;
        get_raw(txn, &state, key)
    }

    /// Upsert. Values above the inline threshold are spilled to an overflow
    /// chain transparently.
    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<PutResult> {
        txn.require_writable()?;
        let mut state = txn.tree_state(&self.name)?;
        let result = put_raw(txn, &mut state, key, value)?;
        txn.set_tree_state(&self.name, state);
        txn.mark_tree_modified(&self.name);
        Ok(result)
    }

    /// Removes a key. Returns whether it existed. A multi-value set under
    /// the key is released as a whole, including one still pending in this
    /// transaction's side table.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> Result<bool> {
        txn.require_writable()?;
        let pending_sub =
            txn.remove_multi_tree_state(&(self.name.clone(), key.to_vec()));
        if let Some(sub) = &pending_sub {
            free_tree(txn, sub)?;
        }
        let mut state = txn.tree_state(&self.name)?;
        let existed = delete_raw(txn, &mut state, key)?;
        if existed || pending_sub.is_some() {
            txn.set_tree_state(&self.name, state);
            txn.mark_tree_modified(&self.name);
        }
        Ok(existed || pending_sub.is_some())
    }

    /// Range cursor from `from` (inclusive), or from the first key.
    pub fn iter<'t>(
        &self,
        txn: &'t mut Transaction,
        from: Option<&[u8]>,
    ) -> Result<TreeIter<'t>> {
        let state = txn.tree_state(&self.name)?;
        TreeIter::seek(txn, &state, from)
    }

    /// Adds `value` to the multi-value set stored under `key`.
    pub fn multi_add(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        txn.require_writable()?;
        multi::multi_add(txn, &self.name, key, value)
    }

    /// Iterates the values of the multi-value set stored under `key`.
    pub fn multi_iter<'t>(
        &self,
        txn: &'t mut Transaction,
        key: &[u8],
    ) -> Result<multi::MultiIter<'t>> {
        multi::multi_iter(txn, &self.name, key)
    }

    pub fn stats(&self, txn: &mut Transaction) -> Result<TreeStats> {
        let state = txn.tree_state(&self.name)?;
        Ok(TreeStats {
            depth: state.depth,
            page_count: state.page_count,
            entry_count: state.entry_count,
        })
    }
}

// ---------------------------------------------------------------------------
// Internal operations, shared by named trees, the root tree, and multi-value
// sub-trees. All of them work on an explicit TreeState.
// ---------------------------------------------------------------------------

pub(crate) fn descend(txn: &Transaction, state: &TreeState, key: &[u8]) -> Result<Cursor> {
    if state.root_page == 0 {
        return Err(DbError::Internal("tree has no root page".into()));
    }
    let mut cursor = Cursor::new();
    let mut page = txn.read_page(state.root_page)?;
    loop {
        if page.is_leaf() {
            let (pos, exact) = page.search(key);
            cursor.exact = exact;
            cursor.push(page, pos);
            return Ok(cursor);
        }
        if !page.is_branch() || page.entry_count() == 0 {
            return Err(DbError::Internal(format!(
                "page {} is not a valid interior page",
                page.page_number()
            )));
        }
        let idx = page.branch_child_index(key);
        let child = page.node(idx).child_page();
        let next = txn.read_page(child)?;
        cursor.push(page, idx);
        page = next;
    }
}

/// Copies every page on the cursor path, rewriting parent child pointers to
/// the fresh page numbers and updating the tree's root.
pub(crate) fn cow_path(
    txn: &mut Transaction,
    state: &mut TreeState,
    cursor: &Cursor,
) -> Result<Vec<PathFrame>> {
    let mut path: Vec<PathFrame> = Vec::with_capacity(cursor.depth());
    for (i, frame) in cursor.frames.iter().enumerate() {
        let new_no = txn.modify_page(&frame.page)?;
        if i == 0 {
            state.root_page = new_no;
        } else {
            let parent = path[i - 1];
            txn.with_dirty_page(parent.page_no, |p| p.set_child(parent.pos, new_no))?;
        }
        path.push(PathFrame { page_no: new_no, pos: frame.pos });
    }
    Ok(path)
}

pub(crate) fn get_raw(
    txn: &Transaction,
    state: &TreeState,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if state.root_page == 0 {
        return Ok(None);
    }
    let cursor = descend(txn, state, key)?;
    if !cursor.exact {
        return Ok(None);
    }
    let leaf = cursor.leaf();
    match leaf.page.node_owned(leaf.pos) {
        OwnedNode::Data { value, .. } => Ok(Some(value)),
        OwnedNode::OverflowRef { start, total, .. } => {
            Ok(Some(read_overflow(txn, start, total)?))
        }
        OwnedNode::MultiRef { .. } => Ok(None),
        OwnedNode::PageRef { .. } => {
            Err(DbError::Internal("PageRef node found on a leaf page".into()))
        }
    }
}

pub(crate) fn put_raw(
    txn: &mut Transaction,
    state: &mut TreeState,
    key: &[u8],
    value: &[u8],
) -> Result<PutResult> {
    let page_size = txn.page_size();
    let inline_limit = max_inline_node_size(page_size);
    if leaf_node_size(key.len(), 4) > inline_limit || key.len() > u16::MAX as usize {
        return Err(DbError::InvalidOperation(format!(
            "key of {} bytes exceeds the per-page key budget",
            key.len()
        )));
    }
    let node = if leaf_node_size(key.len(), value.len()) <= inline_limit {
        OwnedNode::Data { key: key.to_vec(), value: value.to_vec(), version: 0 }
    } else {
        let start = write_overflow(txn, value)?;
        OwnedNode::OverflowRef {
            key: key.to_vec(),
            start,
            total: value.len() as u32,
            version: 0,
        }
    };
    let (outcome, version) = upsert_node(txn, state, node)?;
    if outcome == PutOutcome::Inserted {
        state.entry_count += 1;
    }
    Ok(PutResult { outcome, version })
}

/// Places `node` under its key, replacing any existing entry. The slot
/// version advances across replacements.
pub(crate) fn upsert_node(
    txn: &mut Transaction,
    state: &mut TreeState,
    mut node: OwnedNode,
) -> Result<(PutOutcome, u32)> {
    let cursor = descend(txn, state, node.key())?;
    let exact = cursor.exact;
    let mut path = cow_path(txn, state, &cursor)?;
    let leaf_level = path.len() - 1;
    let leaf_no = path[leaf_level].page_no;
    let pos = path[leaf_level].pos;

    if exact {
        let old = txn.dirty_page(leaf_no)?.node_owned(pos);
        let version = old.version().wrapping_add(1);
        if let (OwnedNode::Data { value: new_value, .. }, OwnedNode::Data { value: old_value, .. }) =
            (&node, &old)
        {
            if new_value.len() == old_value.len() {
                let v = new_value.clone();
                txn.with_dirty_page(leaf_no, |p| p.replace_value_in_place(pos, &v))?;
                return Ok((PutOutcome::Replaced, version));
            }
        }
        if let OwnedNode::OverflowRef { start, total, .. } = old {
            txn.free_overflow_chain(start, total);
        }
        node.set_version(version);
        txn.with_dirty_page(leaf_no, |p| p.remove_node(pos))?;
        insert_at(txn, state, &mut path, leaf_level, node, pos)?;
        Ok((PutOutcome::Replaced, version))
    } else {
        node.set_version(1);
        insert_at(txn, state, &mut path, leaf_level, node, pos)?;
        Ok((PutOutcome::Inserted, 1))
    }
}

/// Inserts `node` at `pos` of the page at `path[level]`, splitting the page
/// (and recursively its ancestors) when it cannot fit.
fn insert_at(
    txn: &mut Transaction,
    state: &mut TreeState,
    path: &mut Vec<PathFrame>,
    level: usize,
    node: OwnedNode,
    pos: usize,
) -> Result<()> {
    let page_no = path[level].page_no;
    let size = node.encoded_size();
    let fits = txn.with_dirty_page(page_no, |p| {
        if p.can_fit(size) {
            p.insert_node(pos, &node);
            true
        } else if p.free_space() + p.dead_space() >= size + 2 {
            p.rebuild();
            p.insert_node(pos, &node);
            true
        } else {
            false
        }
    })?;
    if fits {
        return Ok(());
    }
    split(txn, state, path, level, node, pos)
}

fn split(
    txn: &mut Transaction,
    state: &mut TreeState,
    path: &mut Vec<PathFrame>,
    mut level: usize,
    node: OwnedNode,
    pos: usize,
) -> Result<()> {
    let left_no = path[level].page_no;
    let left = txn.dirty_page(left_no)?;
    let is_branch = left.is_branch();
    let entry_count = left.entry_count();
    let flags = if is_branch { PAGE_BRANCH } else { PAGE_LEAF };
    drop(left);

    if level == 0 {
        // The root split: a fresh branch root takes over, pointing at the
        // old root with the "before all keys" sentinel.
        let new_root = txn.allocate_tree_page(PAGE_BRANCH)?;
        txn.with_dirty_page(new_root, |p| {
            p.insert_node(0, &OwnedNode::PageRef { key: Vec::new(), child: left_no })
        })?;
        state.root_page = new_root;
        state.depth += 1;
        state.page_count += 1;
        path.insert(0, PathFrame { page_no: new_root, pos: 0 });
        level = 1;
        trace!(new_root, depth = state.depth, "tree root split");
    }

    let right_no = txn.allocate_tree_page(flags)?;
    state.page_count += 1;
    let parent_level = level - 1;
    let parent_pos = path[parent_level].pos;

    // Sequential append: the new entry sorts past everything on the page.
    // The left page is left untouched and the new entry starts the right
    // page alone; a branch additionally hands its last entry over to keep
    // the implicit-minimum first entry.
    if pos == entry_count {
        let separator;
        if is_branch {
            let mut moved = txn.with_dirty_page(left_no, |p| {
                let n = p.node_owned(entry_count - 1);
                p.remove_node(entry_count - 1);
                n
            })?;
            separator = moved.key().to_vec();
            moved.set_key(Vec::new());
            txn.with_dirty_page(right_no, |p| {
                p.insert_node(0, &moved);
                p.insert_node(1, &node);
            })?;
        } else {
            separator = node.key().to_vec();
            txn.with_dirty_page(right_no, |p| p.insert_node(0, &node))?;
        }
        return insert_at(
            txn,
            state,
            path,
            parent_level,
            OwnedNode::PageRef { key: separator, child: right_no },
            parent_pos + 1,
        );
    }

    // Split in halves around the midpoint, shifting the index while the side
    // receiving the new entry would still overflow (large-entry adjustment).
    let left_page = txn.dirty_page(left_no)?;
    let usable = usable_space(left_page.page_size());
    let sizes: Vec<usize> =
        (0..entry_count).map(|i| left_page.node(i).encoded_size() + 2).collect();
    let need = node.encoded_size() + 2;
    let mut split_index = entry_count / 2;
    while split_index > 1 {
        let left_size: usize = sizes[..split_index].iter().sum::<usize>()
            + if pos < split_index { need } else { 0 };
        if left_size <= usable {
            break;
        }
        split_index -= 1;
    }
    while split_index + 1 < entry_count {
        let right_size: usize = sizes[split_index..].iter().sum::<usize>()
            + if pos >= split_index { need } else { 0 };
        if right_size <= usable {
            break;
        }
        split_index += 1;
    }

    // When the insert lands exactly at the split point the incoming key is
    // smaller than the entry there, so it becomes the separator itself and
    // the first entry of the right page.
    let at_split_point = pos == split_index;
    let separator = if at_split_point {
        node.key().to_vec()
    } else {
        left_page.node(split_index).key().to_vec()
    };
    drop(left_page);

    let mut moved = txn.with_dirty_page(left_no, |p| p.split_off(split_index))?;
    if is_branch && !at_split_point {
        moved[0].set_key(Vec::new());
    }
    txn.with_dirty_page(right_no, |p| {
        for (i, n) in moved.iter().enumerate() {
            p.insert_node(i, n);
        }
    })?;
    trace!(
        left = left_no,
        right = right_no,
        split_index,
        entries = entry_count,
        "page split"
    );

    // Separator goes to the parent first; the parent may split recursively
    // with this same algorithm.
    insert_at(
        txn,
        state,
        path,
        parent_level,
        OwnedNode::PageRef { key: separator, child: right_no },
        parent_pos + 1,
    )?;

    // Finally insert the new entry on the side chosen above.
    let mut node = node;
    if pos < split_index {
        txn.with_dirty_page(left_no, |p| {
            debug_assert!(p.can_fit(node.encoded_size()));
            p.insert_node(pos, &node);
        })?;
    } else if at_split_point {
        if is_branch {
            node.set_key(Vec::new());
        }
        txn.with_dirty_page(right_no, |p| p.insert_node(0, &node))?;
    } else {
        let idx = pos - split_index;
        txn.with_dirty_page(right_no, |p| p.insert_node(idx, &node))?;
    }
    Ok(())
}

pub(crate) fn delete_raw(
    txn: &mut Transaction,
    state: &mut TreeState,
    key: &[u8],
) -> Result<bool> {
    if state.root_page == 0 {
        return Ok(false);
    }
    let cursor = descend(txn, state, key)?;
    if !cursor.exact {
        return Ok(false);
    }
    let path = cow_path(txn, state, &cursor)?;
    let leaf_level = path.len() - 1;
    let leaf_no = path[leaf_level].page_no;
    let pos = path[leaf_level].pos;

    match txn.dirty_page(leaf_no)?.node_owned(pos) {
        OwnedNode::OverflowRef { start, total, .. } => {
            txn.free_overflow_chain(start, total);
        }
        OwnedNode::MultiRef { sub, .. } => {
            free_tree(txn, &TreeState::from_sub(&sub))?;
        }
        _ => {}
    }
    txn.with_dirty_page(leaf_no, |p| p.remove_node(pos))?;
    state.entry_count = state.entry_count.saturating_sub(1);

    // Unlink pages the delete emptied, walking back up the path.
    let mut level = leaf_level;
    while level > 0 {
        let no = path[level].page_no;
        if txn.dirty_page(no)?.entry_count() > 0 {
            break;
        }
        txn.free_page(no);
        state.page_count = state.page_count.saturating_sub(1);
        let parent = path[level - 1];
        txn.with_dirty_page(parent.page_no, |p| {
            p.remove_node(parent.pos);
            if parent.pos == 0 && p.entry_count() > 0 {
                // the surviving first entry inherits the sentinel key
                let mut first = p.node_owned(0);
                if !first.key().is_empty() {
                    first.set_key(Vec::new());
                    p.remove_node(0);
                    p.insert_node(0, &first);
                }
            }
        })?;
        level -= 1;
    }

    collapse_root(txn, state)?;
    Ok(true)
}

/// Shrinks the tree when the root degenerates: a branch root with a single
/// child hands the root over to it; a fully emptied branch root is replaced
/// with an empty leaf.
fn collapse_root(txn: &mut Transaction, state: &mut TreeState) -> Result<()> {
    loop {
        let root = txn.dirty_page(state.root_page)?;
        if !root.is_branch() {
            return Ok(());
        }
        match root.entry_count() {
            0 => {
                drop(root);
                let leaf = txn.allocate_tree_page(PAGE_LEAF)?;
                txn.free_page(state.root_page);
                state.root_page = leaf;
                state.depth = 1;
                state.page_count = 1;
                return Ok(());
            }
            1 => {
                let child = root.node(0).child_page();
                drop(root);
                txn.free_page(state.root_page);
                state.root_page = child;
                state.depth = state.depth.saturating_sub(1);
                state.page_count = state.page_count.saturating_sub(1);
            }
            _ => return Ok(()),
        }
    }
}

/// Releases every page of a tree (pages, overflow chains, nested sub-trees)
/// into the transaction's freed set.
pub(crate) fn free_tree(txn: &mut Transaction, state: &TreeState) -> Result<()> {
    if state.root_page == 0 {
        return Ok(());
    }
    let mut stack = vec![state.root_page];
    while let Some(no) = stack.pop() {
        let page = txn.read_page(no)?;
        if page.is_branch() {
            for i in 0..page.entry_count() {
                stack.push(page.node(i).child_page());
            }
        } else {
            for i in 0..page.entry_count() {
                match page.node_owned(i) {
                    OwnedNode::OverflowRef { start, total, .. } => {
                        txn.free_overflow_chain(start, total);
                    }
                    OwnedNode::MultiRef { sub, .. } => {
                        free_tree(txn, &TreeState::from_sub(&sub))?;
                    }
                    _ => {}
                }
            }
        }
        txn.free_page(no);
    }
    Ok(())
}

/// Spills a large value to a run of contiguous overflow pages and returns
/// the chain's first page number. Every chain page carries a page header;
/// the first one records the chain's total length.
pub(crate) fn write_overflow(txn: &mut Transaction, value: &[u8]) -> Result<PageNumber> {
    let page_size = txn.page_size();
    let per_page = page_size - PAGE_HEADER_SIZE;
    let pages = crate::storage::page::overflow_pages_needed(value.len(), page_size);
    let start = txn.allocate_overflow_run(pages)?;

    let mut written = 0usize;
    for i in 0..pages {
        let no = start + i;
        let mut page = Page::new(no, crate::storage::page::PAGE_OVERFLOW, page_size);
        if i == 0 {
            page.set_overflow_size(value.len() as u32);
        }
        let take = (value.len() - written).min(per_page);
        page.bytes_mut()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + take]
            .copy_from_slice(&value[written..written + take]);
        written += take;
        txn.insert_dirty(no, page);
    }
    Ok(start)
}

/// Reassembles a value from its overflow chain.
pub(crate) fn read_overflow(
    txn: &Transaction,
    start: PageNumber,
    total: u32,
) -> Result<Vec<u8>> {
    let page_size = txn.page_size();
    let per_page = page_size - PAGE_HEADER_SIZE;
    let total = total as usize;
    let mut out = Vec::with_capacity(total);
    let mut next = start;
    while out.len() < total {
        let page = txn.read_page(next)?;
        let take = (total - out.len()).min(per_page);
        out.extend_from_slice(&page.as_bytes()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + take]);
        next += 1;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Forward range iterator. Holds cheap snapshots of the pages on its path;
/// it is scoped to the transaction that produced it.
pub struct TreeIter<'t> {
    txn: &'t Transaction,
    frames: Vec<(Page, usize)>,
    failed: bool,
}

impl<'t> TreeIter<'t> {
    pub(crate) fn seek(
        txn: &'t Transaction,
        state: &TreeState,
        from: Option<&[u8]>,
    ) -> Result<TreeIter<'t>> {
        let mut frames = Vec::new();
        if state.root_page != 0 {
            let mut page = txn.read_page(state.root_page)?;
            loop {
                if page.is_leaf() {
                    let pos = match from {
                        Some(key) => page.search(key).0,
                        None => 0,
                    };
                    frames.push((page, pos));
                    break;
                }
                let idx = match from {
                    Some(key) => page.branch_child_index(key),
                    None => 0,
                };
                let child = page.node(idx).child_page();
                let next = txn.read_page(child)?;
                frames.push((page, idx));
                page = next;
            }
        }
        Ok(TreeIter { txn, frames, failed: false })
    }

    fn descend_leftmost(&mut self, child: PageNumber) -> Result<()> {
        let mut page = self.txn.read_page(child)?;
        while page.is_branch() {
            let next = self.txn.read_page(page.node(0).child_page())?;
            self.frames.push((page, 0));
            page = next;
        }
        self.frames.push((page, 0));
        Ok(())
    }

    fn decode(&self, node: OwnedNode) -> Result<(Vec<u8>, Vec<u8>)> {
        match node {
            OwnedNode::Data { key, value, .. } => Ok((key, value)),
            OwnedNode::OverflowRef { key, start, total, .. } => {
                Ok((key, read_overflow(self.txn, start, total)?))
            }
            // Multi-value sets are surfaced through `multi_iter`; the plain
            // cursor reports the key with an empty value.
            OwnedNode::MultiRef { key, .. } => Ok((key, Vec::new())),
            OwnedNode::PageRef { .. } => {
                Err(DbError::Internal("PageRef node found on a leaf page".into()))
            }
        }
    }
}

impl<'t> Iterator for TreeIter<'t> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let (page, pos) = self.frames.last_mut()?;
            if page.is_leaf() {
                if *pos < page.entry_count() {
                    let node = page.node_owned(*pos);
                    *pos += 1;
                    return Some(self.decode(node));
                }
                self.frames.pop();
                continue;
            }
            *pos += 1;
            if *pos >= page.entry_count() {
                self.frames.pop();
                continue;
            }
            let child = page.node(*pos).child_page();
            if let Err(e) = self.descend_leftmost(child) {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

/// Walks a tree and checks the structural invariants a commit relies on:
/// branch keys strictly increasing, the sentinel first entry, no duplicate
/// leaf keys, and page accounting within bounds.
pub(crate) fn validate_tree(txn: &Transaction, state: &TreeState) -> Result<()> {
    if state.root_page == 0 {
        return Ok(());
    }
    let mut stack = vec![state.root_page];
    while let Some(no) = stack.pop() {
        let page = txn.read_page(no)?;
        crate::storage::page::check_page(&page)?;
        if page.is_branch() {
            if page.entry_count() == 0 || !page.node(0).key().is_empty() {
                return Err(DbError::Internal(format!(
                    "branch page {no} lacks the before-all-keys entry"
                )));
            }
            for i in 0..page.entry_count() {
                stack.push(page.node(i).child_page());
            }
        }
        for i in 2..page.entry_count() {
            if page.node(i - 1).key() >= page.node(i).key() {
                return Err(DbError::Internal(format!("page {no} keys out of order")));
            }
        }
        if page.is_leaf() && page.entry_count() >= 2 && page.node(0).key() >= page.node(1).key() {
            return Err(DbError::Internal(format!("page {no} keys out of order")));
        }
    }
    Ok(())
}

/// Root-tree bookkeeping: tree states are stored under their names.
pub(crate) fn tree_state_value(state: &TreeState) -> Vec<u8> {
    state.to_bytes()
}

pub(crate) fn tree_state_from_value(bytes: &[u8]) -> Result<TreeState> {
    if bytes.len() != TREE_STATE_SIZE {
        return Err(DbError::InvalidFormat(format!(
            "tree state record of {} bytes",
            bytes.len()
        )));
    }
    Ok(TreeState::read_from(bytes))
}
