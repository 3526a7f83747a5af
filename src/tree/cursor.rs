//! Cursor: the explicit root-to-leaf path used by every tree mutation.
//!
//! Parent/child page relations are never stored as object references; a
//! cursor records the pages visited on the way down together with the
//! position taken in each, which is exactly what copy-on-write needs to
//! rewrite ancestors bottom-up.

use crate::common::PageNumber;
use crate::storage::page::Page;

/// One level of the descent: the page visited and the entry position taken
/// (for branches, the child index followed; for the leaf, the search
/// position).
pub struct CursorFrame {
    pub page: Page,
    pub pos: usize,
}

/// Root-to-leaf descent path. `exact` records whether the leaf search hit
/// the key precisely, which drives upsert-versus-insert decisions on
/// subsequent operations.
pub struct Cursor {
    pub frames: Vec<CursorFrame>,
    pub exact: bool,
}

impl Cursor {
    pub fn new() -> Cursor {
        Cursor { frames: Vec::new(), exact: false }
    }

    pub fn push(&mut self, page: Page, pos: usize) {
        self.frames.push(CursorFrame { page, pos });
    }

    pub fn leaf(&self) -> &CursorFrame {
        self.frames.last().expect("cursor is empty")
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// A frame of the dirtied path after copy-on-write: ancestors are referenced
/// by page number only.
#[derive(Debug, Clone, Copy)]
pub struct PathFrame {
    pub page_no: PageNumber,
    pub pos: usize,
}
