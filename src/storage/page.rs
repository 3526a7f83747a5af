//! Page layout and node codec.
//!
//! A page begins with a fixed 16-byte header. The node-offset array (one
//! `u16` per entry) grows upward from the header while node payloads grow
//! downward from the end of the page; the page is full when another entry
//! would make the two regions cross.
//!
//! Nodes come in three kinds: `PageRef` (branch entry carrying a child page
//! number), `Data` (leaf entry carrying an inline value or an overflow
//! reference), and `MultiValuePageRef` (leaf entry whose payload is the root
//! of an embedded sub-tree keyed by the values).

use std::sync::Arc;

use crate::common::{compare_keys, PageNumber};
use crate::error::{DbError, Result};

pub const PAGE_HEADER_SIZE: usize = 16;
pub const NODE_HEADER_SIZE: usize = 12;

// Page flags.
pub const PAGE_LEAF: u8 = 1;
pub const PAGE_BRANCH: u8 = 2;
pub const PAGE_OVERFLOW: u8 = 4;

// Node flags. The low bits select the kind; bit 7 marks a value stored in an
// overflow chain instead of inline.
const NODE_PAGE_REF: u8 = 1;
const NODE_DATA: u8 = 2;
const NODE_MULTI: u8 = 3;
const NODE_KIND_MASK: u8 = 0x7f;
pub const NODE_OVERFLOW_VALUE: u8 = 0x80;

const OFF_PAGE_NUMBER: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_LOWER: usize = 6;
const OFF_UPPER: usize = 8;
const OFF_ENTRY_COUNT: usize = 10;
const OFF_OVERFLOW_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PageRef,
    Data,
    MultiValuePageRef,
}

/// Root of an embedded multi-value sub-tree, stored in the parent node's
/// payload (16 bytes on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTreeHeader {
    pub root_page: PageNumber,
    pub depth: u32,
    pub entry_count: u64,
}

pub const SUB_TREE_HEADER_SIZE: usize = 16;

impl SubTreeHeader {
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.root_page.to_le_bytes());
        buf[4..8].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.entry_count.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> SubTreeHeader {
        SubTreeHeader {
            root_page: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            depth: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            entry_count: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// An in-memory page image.
///
/// The byte buffer is shared; cloning a `Page` is a reference-count bump, and
/// mutation copies the buffer out first (`Arc::make_mut`). Read transactions
/// therefore hold cheap snapshots of any page a writer later changes.
#[derive(Clone)]
pub struct Page {
    data: Arc<Vec<u8>>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("number", &self.page_number())
            .field("flags", &self.flags())
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl Page {
    pub fn new(page_number: PageNumber, flags: u8, page_size: usize) -> Page {
        let mut data = vec![0u8; page_size];
        data[OFF_PAGE_NUMBER..OFF_PAGE_NUMBER + 4].copy_from_slice(&page_number.to_le_bytes());
        data[OFF_FLAGS] = flags;
        let lower = PAGE_HEADER_SIZE as u16;
        let upper = page_size as u16;
        data[OFF_LOWER..OFF_LOWER + 2].copy_from_slice(&lower.to_le_bytes());
        data[OFF_UPPER..OFF_UPPER + 2].copy_from_slice(&upper.to_le_bytes());
        Page { data: Arc::new(data) }
    }

    pub fn from_bytes(data: Vec<u8>) -> Page {
        Page { data: Arc::new(data) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    fn data_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.data)
    }

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.data_mut()[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn page_number(&self) -> PageNumber {
        u32::from_le_bytes(self.data[OFF_PAGE_NUMBER..OFF_PAGE_NUMBER + 4].try_into().unwrap())
    }

    pub fn set_page_number(&mut self, n: PageNumber) {
        self.data_mut()[OFF_PAGE_NUMBER..OFF_PAGE_NUMBER + 4].copy_from_slice(&n.to_le_bytes());
    }

    pub fn flags(&self) -> u8 {
        self.data[OFF_FLAGS]
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & PAGE_LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & PAGE_BRANCH != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags() & PAGE_OVERFLOW != 0
    }

    pub fn lower(&self) -> usize {
        self.read_u16(OFF_LOWER) as usize
    }

    pub fn upper(&self) -> usize {
        self.read_u16(OFF_UPPER) as usize
    }

    pub fn entry_count(&self) -> usize {
        self.read_u16(OFF_ENTRY_COUNT) as usize
    }

    pub fn overflow_size(&self) -> u32 {
        u32::from_le_bytes(self.data[OFF_OVERFLOW_SIZE..OFF_OVERFLOW_SIZE + 4].try_into().unwrap())
    }

    pub fn set_overflow_size(&mut self, len: u32) {
        self.data_mut()[OFF_OVERFLOW_SIZE..OFF_OVERFLOW_SIZE + 4].copy_from_slice(&len.to_le_bytes());
    }

    /// Bytes still available between the offset array and the payload heap.
    pub fn free_space(&self) -> usize {
        self.upper() - self.lower()
    }

    /// Bytes that a `rebuild` would reclaim: payload space consumed by
    /// removed or superseded nodes.
    pub fn dead_space(&self) -> usize {
        let live: usize = (0..self.entry_count()).map(|i| self.node(i).encoded_size()).sum();
        (self.page_size() - self.upper()) - live
    }

    pub fn can_fit(&self, node_size: usize) -> bool {
        self.free_space() >= node_size + 2
    }

    fn node_offset(&self, idx: usize) -> usize {
        self.read_u16(PAGE_HEADER_SIZE + 2 * idx) as usize
    }

    pub fn node(&self, idx: usize) -> Node<'_> {
        debug_assert!(idx < self.entry_count());
        let off = self.node_offset(idx);
        Node { buf: &self.data[off..] }
    }

    pub fn node_owned(&self, idx: usize) -> OwnedNode {
        OwnedNode::from_node(&self.node(idx))
    }

    /// Binary search over the page's keys. Returns `(position, exact)`:
    /// for a miss, `position` is where the key would be inserted. On branch
    /// pages entry 0 carries the "before all keys" sentinel and sorts below
    /// everything.
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        let count = self.entry_count();
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ord = if self.is_branch() && mid == 0 {
                std::cmp::Ordering::Less
            } else {
                compare_keys(self.node(mid).key(), key)
            };
            match ord {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return (mid, true),
            }
        }
        (lo, false)
    }

    /// Index of the child entry to follow for `key` on a branch page: the
    /// last entry whose key compares `<=` the target, with entry 0 implicit
    /// minimum.
    pub fn branch_child_index(&self, key: &[u8]) -> usize {
        debug_assert!(self.is_branch() && self.entry_count() > 0);
        let (pos, exact) = self.search(key);
        if exact {
            pos
        } else {
            pos - 1
        }
    }

    /// Inserts `node` at slot `idx`, shifting later offsets up. The caller
    /// must have checked `can_fit`.
    pub fn insert_node(&mut self, idx: usize, node: &OwnedNode) {
        let size = node.encoded_size();
        let lower = self.lower();
        let upper = self.upper();
        let count = self.entry_count();
        debug_assert!(idx <= count);
        debug_assert!(lower + 2 + size <= upper, "page overflow on insert");

        let new_upper = upper - size;
        let slot = PAGE_HEADER_SIZE + 2 * idx;
        {
            let data = self.data_mut();
            node.write_into(&mut data[new_upper..upper]);
            data.copy_within(slot..lower, slot + 2);
        }
        self.write_u16(slot, new_upper as u16);
        self.write_u16(OFF_LOWER, (lower + 2) as u16);
        self.write_u16(OFF_UPPER, new_upper as u16);
        self.write_u16(OFF_ENTRY_COUNT, (count + 1) as u16);
    }

    /// Removes the slot at `idx`. Payload bytes are reclaimed lazily by
    /// `rebuild`.
    pub fn remove_node(&mut self, idx: usize) {
        let lower = self.lower();
        let count = self.entry_count();
        debug_assert!(idx < count);
        let slot = PAGE_HEADER_SIZE + 2 * idx;
        self.data_mut().copy_within(slot + 2..lower, slot);
        self.write_u16(OFF_LOWER, (lower - 2) as u16);
        self.write_u16(OFF_ENTRY_COUNT, (count - 1) as u16);
    }

    /// Rewrites the child page number of the `PageRef` node at `idx`.
    pub fn set_child(&mut self, idx: usize, child: PageNumber) {
        debug_assert_eq!(self.node(idx).kind(), NodeKind::PageRef);
        let off = self.node_offset(idx);
        self.data_mut()[off + 8..off + 12].copy_from_slice(&child.to_le_bytes());
    }

    /// Overwrites the inline value of the `Data` node at `idx` with a
    /// same-length value and bumps its version counter.
    pub fn replace_value_in_place(&mut self, idx: usize, value: &[u8]) {
        let off = self.node_offset(idx);
        let node = self.node(idx);
        debug_assert_eq!(node.kind(), NodeKind::Data);
        debug_assert!(!node.is_overflow_value());
        debug_assert_eq!(node.data_size() as usize, value.len());
        let key_size = node.key_size();
        let version = node.version().wrapping_add(1);
        let value_off = off + NODE_HEADER_SIZE + key_size;
        let data = self.data_mut();
        data[off + 4..off + 8].copy_from_slice(&version.to_le_bytes());
        data[value_off..value_off + value.len()].copy_from_slice(value);
    }

    /// Compacts the payload heap, reclaiming dead space while preserving
    /// entry order.
    pub fn rebuild(&mut self) {
        let nodes: Vec<OwnedNode> = (0..self.entry_count()).map(|i| self.node_owned(i)).collect();
        self.reset_entries();
        for (i, n) in nodes.iter().enumerate() {
            self.insert_node(i, n);
        }
    }

    /// Detaches entries `[idx, entry_count)` and compacts the page down to
    /// the first `idx` entries. Used by the split path.
    pub fn split_off(&mut self, idx: usize) -> Vec<OwnedNode> {
        let count = self.entry_count();
        debug_assert!(idx <= count);
        let moved: Vec<OwnedNode> = (idx..count).map(|i| self.node_owned(i)).collect();
        let kept: Vec<OwnedNode> = (0..idx).map(|i| self.node_owned(i)).collect();
        self.reset_entries();
        for (i, n) in kept.iter().enumerate() {
            self.insert_node(i, n);
        }
        moved
    }

    fn reset_entries(&mut self) {
        let page_size = self.page_size();
        self.write_u16(OFF_LOWER, PAGE_HEADER_SIZE as u16);
        self.write_u16(OFF_UPPER, page_size as u16);
        self.write_u16(OFF_ENTRY_COUNT, 0);
    }
}

/// A borrowed view of a node inside a page.
pub struct Node<'a> {
    buf: &'a [u8],
}

impl<'a> Node<'a> {
    pub fn flags(&self) -> u8 {
        self.buf[0]
    }

    pub fn kind(&self) -> NodeKind {
        match self.flags() & NODE_KIND_MASK {
            NODE_PAGE_REF => NodeKind::PageRef,
            NODE_DATA => NodeKind::Data,
            NODE_MULTI => NodeKind::MultiValuePageRef,
            other => unreachable!("unknown node kind {other}"),
        }
    }

    pub fn is_overflow_value(&self) -> bool {
        self.flags() & NODE_OVERFLOW_VALUE != 0
    }

    pub fn key_size(&self) -> usize {
        u16::from_le_bytes(self.buf[2..4].try_into().unwrap()) as usize
    }

    pub fn version(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    fn info(&self) -> u32 {
        u32::from_le_bytes(self.buf[8..12].try_into().unwrap())
    }

    pub fn key(&self) -> &'a [u8] {
        &self.buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + self.key_size()]
    }

    /// Child page number of a `PageRef` node.
    pub fn child_page(&self) -> PageNumber {
        debug_assert_eq!(self.kind(), NodeKind::PageRef);
        self.info()
    }

    /// Full value length of a `Data` node (inline or overflow).
    pub fn data_size(&self) -> u32 {
        debug_assert_eq!(self.kind(), NodeKind::Data);
        self.info()
    }

    pub fn inline_value(&self) -> &'a [u8] {
        debug_assert!(!self.is_overflow_value());
        let start = NODE_HEADER_SIZE + self.key_size();
        &self.buf[start..start + self.info() as usize]
    }

    /// First page of the overflow chain backing this node's value.
    pub fn overflow_start(&self) -> PageNumber {
        debug_assert!(self.is_overflow_value());
        let start = NODE_HEADER_SIZE + self.key_size();
        u32::from_le_bytes(self.buf[start..start + 4].try_into().unwrap())
    }

    pub fn sub_tree(&self) -> SubTreeHeader {
        debug_assert_eq!(self.kind(), NodeKind::MultiValuePageRef);
        let start = NODE_HEADER_SIZE + self.key_size();
        SubTreeHeader::read_from(&self.buf[start..start + SUB_TREE_HEADER_SIZE])
    }

    pub fn encoded_size(&self) -> usize {
        NODE_HEADER_SIZE
            + self.key_size()
            + match self.kind() {
                NodeKind::PageRef => 0,
                NodeKind::Data => {
                    if self.is_overflow_value() {
                        4
                    } else {
                        self.info() as usize
                    }
                }
                NodeKind::MultiValuePageRef => SUB_TREE_HEADER_SIZE,
            }
    }
}

/// An owned node, used when building or moving entries between pages.
#[derive(Debug, Clone)]
pub enum OwnedNode {
    PageRef { key: Vec<u8>, child: PageNumber },
    Data { key: Vec<u8>, value: Vec<u8>, version: u32 },
    OverflowRef { key: Vec<u8>, start: PageNumber, total: u32, version: u32 },
    MultiRef { key: Vec<u8>, sub: SubTreeHeader, version: u32 },
}

impl OwnedNode {
    pub fn key(&self) -> &[u8] {
        match self {
            OwnedNode::PageRef { key, .. }
            | OwnedNode::Data { key, .. }
            | OwnedNode::OverflowRef { key, .. }
            | OwnedNode::MultiRef { key, .. } => key,
        }
    }

    pub fn set_key(&mut self, new_key: Vec<u8>) {
        match self {
            OwnedNode::PageRef { key, .. }
            | OwnedNode::Data { key, .. }
            | OwnedNode::OverflowRef { key, .. }
            | OwnedNode::MultiRef { key, .. } => *key = new_key,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            OwnedNode::PageRef { .. } => 0,
            OwnedNode::Data { version, .. }
            | OwnedNode::OverflowRef { version, .. }
            | OwnedNode::MultiRef { version, .. } => *version,
        }
    }

    pub fn set_version(&mut self, v: u32) {
        match self {
            OwnedNode::PageRef { .. } => {}
            OwnedNode::Data { version, .. }
            | OwnedNode::OverflowRef { version, .. }
            | OwnedNode::MultiRef { version, .. } => *version = v,
        }
    }

    pub fn encoded_size(&self) -> usize {
        NODE_HEADER_SIZE
            + self.key().len()
            + match self {
                OwnedNode::PageRef { .. } => 0,
                OwnedNode::Data { value, .. } => value.len(),
                OwnedNode::OverflowRef { .. } => 4,
                OwnedNode::MultiRef { .. } => SUB_TREE_HEADER_SIZE,
            }
    }

    pub fn write_into(&self, buf: &mut [u8]) {
        let key = self.key();
        debug_assert!(key.len() <= u16::MAX as usize, "key too long");
        let (flags, info) = match self {
            OwnedNode::PageRef { child, .. } => (NODE_PAGE_REF, *child),
            OwnedNode::Data { value, .. } => (NODE_DATA, value.len() as u32),
            OwnedNode::OverflowRef { total, .. } => (NODE_DATA | NODE_OVERFLOW_VALUE, *total),
            OwnedNode::MultiRef { .. } => (NODE_MULTI, 0),
        };
        buf[0] = flags;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&(key.len() as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.version().to_le_bytes());
        buf[8..12].copy_from_slice(&info.to_le_bytes());
        let key_end = NODE_HEADER_SIZE + key.len();
        buf[NODE_HEADER_SIZE..key_end].copy_from_slice(key);
        match self {
            OwnedNode::PageRef { .. } => {}
            OwnedNode::Data { value, .. } => {
                buf[key_end..key_end + value.len()].copy_from_slice(value);
            }
            OwnedNode::OverflowRef { start, .. } => {
                buf[key_end..key_end + 4].copy_from_slice(&start.to_le_bytes());
            }
            OwnedNode::MultiRef { sub, .. } => {
                sub.write_into(&mut buf[key_end..key_end + SUB_TREE_HEADER_SIZE]);
            }
        }
    }

    pub fn from_node(node: &Node<'_>) -> OwnedNode {
        let key = node.key().to_vec();
        match node.kind() {
            NodeKind::PageRef => OwnedNode::PageRef { key, child: node.child_page() },
            NodeKind::Data => {
                if node.is_overflow_value() {
                    OwnedNode::OverflowRef {
                        key,
                        start: node.overflow_start(),
                        total: node.data_size(),
                        version: node.version(),
                    }
                } else {
                    OwnedNode::Data {
                        key,
                        value: node.inline_value().to_vec(),
                        version: node.version(),
                    }
                }
            }
            NodeKind::MultiValuePageRef => OwnedNode::MultiRef {
                key,
                sub: node.sub_tree(),
                version: node.version(),
            },
        }
    }
}

/// Usable space of a page, after the fixed header.
pub fn usable_space(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Largest node (header + key + inline value) stored inline. Anything above
/// goes to an overflow chain so a page can always hold at least four entries.
pub fn max_inline_node_size(page_size: usize) -> usize {
    usable_space(page_size) / 4
}

pub fn leaf_node_size(key_len: usize, value_len: usize) -> usize {
    NODE_HEADER_SIZE + key_len + value_len
}

/// Number of contiguous pages needed for an overflow chain of `total` value
/// bytes. Every chain page carries the fixed page header (so any page image
/// identifies itself, which journal recovery relies on); the first page's
/// header additionally records the total length.
pub fn overflow_pages_needed(total: usize, page_size: usize) -> u32 {
    let per_page = page_size - PAGE_HEADER_SIZE;
    (total.max(1)).div_ceil(per_page) as u32
}

/// Validates that a page image satisfies the slotted-page accounting
/// (invariant: offsets plus payloads fit in the usable space).
pub fn check_page(page: &Page) -> Result<()> {
    let lower = page.lower();
    let upper = page.upper();
    if lower < PAGE_HEADER_SIZE || upper > page.page_size() || lower > upper {
        return Err(DbError::Internal(format!(
            "page {} accounting out of bounds: lower={lower} upper={upper}",
            page.page_number()
        )));
    }
    if lower - PAGE_HEADER_SIZE != 2 * page.entry_count() {
        return Err(DbError::Internal(format!(
            "page {} offset array does not match entry count",
            page.page_number()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(key: &[u8], value: &[u8]) -> OwnedNode {
        OwnedNode::Data { key: key.to_vec(), value: value.to_vec(), version: 0 }
    }

    #[test]
    fn insert_and_search() {
        let mut page = Page::new(7, PAGE_LEAF, 4096);
        for (i, k) in [b"apple", b"grape", b"melon"].iter().enumerate() {
            page.insert_node(i, &data(*k, b"v"));
        }
        assert_eq!(page.entry_count(), 3);
        assert_eq!(page.search(b"grape"), (1, true));
        assert_eq!(page.search(b"banana"), (1, false));
        assert_eq!(page.search(b"zzz"), (3, false));
        assert_eq!(page.node(2).key(), b"melon");
        assert_eq!(page.node(0).inline_value(), b"v");
        check_page(&page).unwrap();
    }

    #[test]
    fn remove_leaves_dead_space_until_rebuild() {
        let mut page = Page::new(1, PAGE_LEAF, 4096);
        page.insert_node(0, &data(b"a", &[0u8; 100]));
        page.insert_node(1, &data(b"b", &[0u8; 100]));
        let free_before = page.free_space();
        page.remove_node(0);
        assert_eq!(page.entry_count(), 1);
        assert!(page.dead_space() >= 100);
        page.rebuild();
        assert_eq!(page.dead_space(), 0);
        assert!(page.free_space() > free_before);
        assert_eq!(page.node(0).key(), b"b");
    }

    #[test]
    fn branch_sentinel_routes_before_all_keys() {
        let mut page = Page::new(3, PAGE_BRANCH, 4096);
        page.insert_node(0, &OwnedNode::PageRef { key: vec![], child: 10 });
        page.insert_node(1, &OwnedNode::PageRef { key: b"m".to_vec(), child: 11 });
        assert_eq!(page.branch_child_index(b"a"), 0);
        assert_eq!(page.branch_child_index(b"m"), 1);
        assert_eq!(page.branch_child_index(b"z"), 1);
    }

    #[test]
    fn split_off_moves_tail() {
        let mut page = Page::new(9, PAGE_LEAF, 4096);
        for i in 0..10u8 {
            page.insert_node(i as usize, &data(&[i], b"x"));
        }
        let moved = page.split_off(6);
        assert_eq!(moved.len(), 4);
        assert_eq!(page.entry_count(), 6);
        assert_eq!(moved[0].key(), &[6]);
        assert_eq!(page.dead_space(), 0);
    }

    #[test]
    fn clone_is_snapshot() {
        let mut page = Page::new(1, PAGE_LEAF, 4096);
        page.insert_node(0, &data(b"k", b"old"));
        let snapshot = page.clone();
        page.replace_value_in_place(0, b"new");
        assert_eq!(snapshot.node(0).inline_value(), b"old");
        assert_eq!(page.node(0).inline_value(), b"new");
        assert_eq!(page.node(0).version(), 1);
    }

    #[test]
    fn overflow_page_math() {
        assert_eq!(overflow_pages_needed(100, 4096), 1);
        assert_eq!(overflow_pages_needed(4080, 4096), 1);
        assert_eq!(overflow_pages_needed(4081, 4096), 2);
        assert_eq!(overflow_pages_needed(2 * 4080, 4096), 2);
        assert_eq!(overflow_pages_needed(2 * 4080 + 1, 4096), 3);
    }
}
