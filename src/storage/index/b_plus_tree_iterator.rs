use std::sync::Arc;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::storage::codec::{BPlusTreeLeafPageCodec, BPlusTreePageCodec};
use crate::storage::page::{BPlusTreeLeafPage, BPlusTreePage, RecordId};

use super::b_plus_tree::BPlusTreeIndex;

/// Leaf cursor over the tree in key order.
///
/// Holds the current leaf pinned under its shared latch. Advancing to the
/// next leaf latches it before the previous one is released, so the chain is
/// walked left to right without gaps. An exhausted iterator stays usable and
/// keeps yielding `None`.
#[derive(Debug)]
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    current: Option<(ReadPageGuard, BPlusTreeLeafPage)>,
    cursor: usize,
}

impl TreeIndexIterator {
    /// Cursor positioned at the first key of the tree.
    pub fn begin(index: Arc<BPlusTreeIndex>) -> VellumResult<Self> {
        let current = Self::find_first_leaf(&index)?;
        Ok(Self {
            index,
            current,
            cursor: 0,
        })
    }

    /// Cursor positioned at the first key >= `key`.
    pub fn begin_at(index: Arc<BPlusTreeIndex>, key: &[u8]) -> VellumResult<Self> {
        let root_page_id = index.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(Self::end(index));
        }
        let mut guard = index.buffer_pool.fetch_page_read(root_page_id)?;
        let leaf = loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), index.key_size, index.comparator)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    guard = index.buffer_pool.fetch_page_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => break leaf,
            }
        };
        let cursor = leaf.lower_bound(key);
        Ok(Self {
            index,
            current: Some((guard, leaf)),
            cursor,
        })
    }

    /// Cursor already past the last key.
    pub fn end(index: Arc<BPlusTreeIndex>) -> Self {
        Self {
            index,
            current: None,
            cursor: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    /// Yields the entry under the cursor and advances. At the end of a leaf
    /// the next leaf is read-latched first, then the current one is released.
    pub fn next(&mut self) -> VellumResult<Option<(Vec<u8>, RecordId)>> {
        loop {
            let Some((_, leaf)) = self.current.as_ref() else {
                return Ok(None);
            };
            if self.cursor < leaf.array.len() {
                let kv = leaf.kv_at(self.cursor).clone();
                self.cursor += 1;
                return Ok(Some(kv));
            }

            let next_page_id = leaf.header.next_page_id;
            if next_page_id == INVALID_PAGE_ID {
                self.current = None;
                return Ok(None);
            }
            let next_guard = self.index.buffer_pool.fetch_page_read(next_page_id)?;
            let (next_leaf, _) = BPlusTreeLeafPageCodec::decode(
                next_guard.data(),
                self.index.key_size,
                self.index.comparator,
            )?;
            self.current = Some((next_guard, next_leaf));
            self.cursor = 0;
        }
    }

    fn find_first_leaf(
        index: &Arc<BPlusTreeIndex>,
    ) -> VellumResult<Option<(ReadPageGuard, BPlusTreeLeafPage)>> {
        let root_page_id = index.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = index.buffer_pool.fetch_page_read(root_page_id)?;
        loop {
            let (page, _) =
                BPlusTreePageCodec::decode(guard.data(), index.key_size, index.comparator)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.value_at(0);
                    guard = index.buffer_pool.fetch_page_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(Some((guard, leaf))),
            }
        }
    }
}
