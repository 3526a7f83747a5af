//! Multi-value sub-trees.
//!
//! A key whose value is a set is stored as a `MultiValuePageRef` node whose
//! payload points at the root of an embedded tree keyed by the individual
//! values. During a transaction the dirty sub-trees live in a side table
//! keyed by `(tree, key)`; they are flushed into their parent leaves right
//! before the rest of the commit so the parent entry carries the final root.

use crate::error::{DbError, Result};
use crate::storage::page::{OwnedNode, SubTreeHeader, PAGE_LEAF};
use crate::tree::{self, PutOutcome, TreeIter, TreeState};
use crate::txn::Transaction;

pub(crate) fn multi_add(
    txn: &mut Transaction,
    tree_name: &str,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let side_key = (tree_name.to_string(), key.to_vec());
    let mut sub = match txn.multi_tree_state(&side_key) {
        Some(state) => state,
        None => load_or_create_sub_tree(txn, tree_name, key)?,
    };
    // Sub-tree keys are the values themselves, so they must obey key limits.
    tree::put_raw(txn, &mut sub, value, &[]).map_err(|e| match e {
        DbError::InvalidOperation(_) => DbError::InvalidOperation(format!(
            "multi-value of {} bytes exceeds the per-page key budget",
            value.len()
        )),
        other => other,
    })?;
    txn.set_multi_tree_state(side_key, sub);
    Ok(())
}

/// Resolves the sub-tree for `(tree, key)`: an existing `MultiValuePageRef`
/// entry is reopened; a plain value is promoted into a fresh sub-tree as its
/// first member; a missing key starts empty.
fn load_or_create_sub_tree(
    txn: &mut Transaction,
    tree_name: &str,
    key: &[u8],
) -> Result<TreeState> {
    let parent = txn.tree_state(tree_name)?;
    let existing = if parent.root_page != 0 {
        let cursor = tree::descend(txn, &parent, key)?;
        if cursor.exact {
            let leaf = cursor.leaf();
            Some(leaf.page.node_owned(leaf.pos))
        } else {
            None
        }
    } else {
        None
    };

    let root = txn.allocate_tree_page(PAGE_LEAF)?;
    let mut sub = TreeState { root_page: root, depth: 1, page_count: 1, entry_count: 0 };
    match existing {
        Some(OwnedNode::MultiRef { sub: header, .. }) => {
            // Reopen: drop the fresh page again, the set already has a root.
            txn.free_page(root);
            return Ok(TreeState {
                root_page: header.root_page,
                depth: header.depth,
                page_count: 0,
                entry_count: header.entry_count,
            });
        }
        Some(OwnedNode::Data { value, .. }) => {
            tree::put_raw(txn, &mut sub, &value, &[])?;
        }
        Some(OwnedNode::OverflowRef { .. }) => {
            return Err(DbError::InvalidOperation(
                "cannot promote an overflow value into a multi-value set".into(),
            ));
        }
        _ => {}
    }
    Ok(sub)
}

/// Writes every dirty sub-tree's root back into its parent leaf entry and
/// promotes the parent node to `MultiValuePageRef`. Runs as the first commit
/// step.
pub(crate) fn flush_multi_trees(txn: &mut Transaction) -> Result<()> {
    let mut entries = txn.take_multi_tree_states();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for ((tree_name, key), sub) in entries {
        let mut parent = txn.tree_state(&tree_name)?;
        let node = OwnedNode::MultiRef {
            key,
            sub: SubTreeHeader {
                root_page: sub.root_page,
                depth: sub.depth,
                entry_count: sub.entry_count,
            },
            version: 0,
        };
        let (outcome, _) = tree::upsert_node(txn, &mut parent, node)?;
        if outcome == PutOutcome::Inserted {
            parent.entry_count += 1;
        }
        txn.set_tree_state(&tree_name, parent);
        txn.mark_tree_modified(&tree_name);
    }
    Ok(())
}

/// Iterator over the values of one multi-value set.
pub struct MultiIter<'t> {
    inner: MultiIterInner<'t>,
}

enum MultiIterInner<'t> {
    Empty,
    Single(Option<Vec<u8>>),
    Tree(TreeIter<'t>),
}

impl<'t> Iterator for MultiIter<'t> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            MultiIterInner::Empty => None,
            MultiIterInner::Single(v) => v.take().map(Ok),
            MultiIterInner::Tree(iter) => iter.next().map(|r| r.map(|(value, _)| value)),
        }
    }
}

pub(crate) fn multi_iter<'t>(
    txn: &'t mut Transaction,
    tree_name: &str,
    key: &[u8],
) -> Result<MultiIter<'t>> {
    let side_key = (tree_name.to_string(), key.to_vec());
    let sub = match txn.multi_tree_state(&side_key) {
        Some(state) => Some(state),
        None => {
            let parent = txn.tree_state(tree_name)?;
            if parent.root_page == 0 {
                None
            } else {
                let cursor = tree::descend(txn, &parent, key)?;
                if !cursor.exact {
                    None
                } else {
                    let leaf = cursor.leaf();
                    match leaf.page.node_owned(leaf.pos) {
                        OwnedNode::MultiRef { sub, .. } => Some(TreeState {
                            root_page: sub.root_page,
                            depth: sub.depth,
                            page_count: 0,
                            entry_count: sub.entry_count,
                        }),
                        OwnedNode::Data { value, .. } => {
                            return Ok(MultiIter {
                                inner: MultiIterInner::Single(Some(value)),
                            });
                        }
                        _ => None,
                    }
                }
            }
        }
    };
    match sub {
        Some(state) => {
            let iter = TreeIter::seek(&*txn, &state, None)?;
            Ok(MultiIter { inner: MultiIterInner::Tree(iter) })
        }
        None => Ok(MultiIter { inner: MultiIterInner::Empty }),
    }
}
