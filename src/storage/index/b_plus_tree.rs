use log::trace;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BTreeConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
};
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Insert,
    Remove,
}

/// Write guards held along the descent path, root side first. Ancestors are
/// released as soon as the child below them is proven safe for the operation.
#[derive(Debug, Default)]
struct Context {
    write_set: VecDeque<WritePageGuard>,
}

impl Context {
    fn new() -> Self {
        Self {
            write_set: VecDeque::new(),
        }
    }

    fn release_ancestors(&mut self) {
        self.write_set.clear();
    }
}

/// Concurrent B+ tree index over fixed-width byte keys.
///
/// Readers descend with shared latches, releasing each parent once the child
/// is latched. Writers descend with exclusive latches and keep the path down
/// to the last unsafe node. The root page id is assigned once, when the first
/// key creates the tree; structural changes at the root reuse the root page
/// (contents are copied up or down), so the id external references point at
/// never changes.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub buffer_pool: Arc<BufferPoolManager>,
    pub comparator: KeyComparator,
    pub key_size: usize,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    root_page_id: RwLock<PageId>,
}

impl BPlusTreeIndex {
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        key_size: usize,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf pages need at least two entries");
        assert!(
            internal_max_size >= 3,
            "internal pages need at least three children"
        );
        // a page image must fit even while one entry over capacity, right
        // before the overflowing node is split
        let leaf_bytes = 28 + (leaf_max_size as usize + 1) * (key_size + 8);
        let internal_bytes = 24 + (internal_max_size as usize + 1) * (key_size + 4);
        assert!(
            leaf_bytes <= crate::buffer::PAGE_SIZE && internal_bytes <= crate::buffer::PAGE_SIZE,
            "page capacity exceeds the 4 KiB page size"
        );
        Self {
            buffer_pool,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
        }
    }

    pub fn new_with_config(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        key_size: usize,
        config: BTreeConfig,
    ) -> Self {
        Self::new(
            buffer_pool,
            comparator,
            key_size,
            config.leaf_max_size,
            config.internal_max_size,
        )
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup with read crabbing: the parent's latch is dropped as soon
    /// as the child is latched.
    pub fn get(&self, key: &[u8]) -> VellumResult<Option<RecordId>> {
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        loop {
            let (page, _) =
                BPlusTreePageCodec::decode(guard.data(), self.key_size, self.comparator)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.look_up(key);
                    guard = self.buffer_pool.fetch_page_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => return Ok(leaf.look_up(key)),
            }
        }
    }

    /// Inserts a unique key. Returns false (not an error) when the key is
    /// already present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumResult<bool> {
        debug_assert_eq!(key.len(), self.key_size);
        if self.is_empty() {
            self.start_new_tree()?;
        }

        let mut context = Context::new();
        self.find_leaf_pessimistic(key, TreeOp::Insert, &mut context)?;
        let mut leaf_guard = context
            .write_set
            .pop_back()
            .ok_or_else(|| VellumError::Internal("descent produced no leaf".to_string()))?;
        let (mut leaf, _) =
            BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.key_size, self.comparator)?;

        if !leaf.insert(key, rid) {
            return Ok(false);
        }

        if leaf.header.current_size > leaf.header.max_size {
            self.split_and_propagate(BPlusTreePage::Leaf(leaf), leaf_guard, &mut context)?;
        } else {
            self.write_leaf(&mut leaf_guard, &leaf);
        }
        Ok(true)
    }

    /// Removes a key; absent keys are a no-op.
    pub fn remove(&self, key: &[u8]) -> VellumResult<()> {
        debug_assert_eq!(key.len(), self.key_size);
        if self.is_empty() {
            return Ok(());
        }

        let mut context = Context::new();
        self.find_leaf_pessimistic(key, TreeOp::Remove, &mut context)?;
        let mut cur_guard = context
            .write_set
            .pop_back()
            .ok_or_else(|| VellumError::Internal("descent produced no leaf".to_string()))?;
        let (mut leaf, _) =
            BPlusTreeLeafPageCodec::decode(cur_guard.data(), self.key_size, self.comparator)?;

        if !leaf.remove(key) {
            return Ok(());
        }

        let mut deleted_pages: Vec<PageId> = Vec::new();
        let mut cur_page = BPlusTreePage::Leaf(leaf);

        loop {
            if cur_page.parent_page_id() == INVALID_PAGE_ID {
                // a leaf root may hold any number of entries, including zero;
                // an internal root shrunk to a single child collapses in place
                let collapse = match &cur_page {
                    BPlusTreePage::Leaf(_) => false,
                    BPlusTreePage::Internal(internal) => internal.header.current_size < 2,
                };
                if collapse {
                    self.collapse_root(&cur_page, &mut cur_guard, &mut deleted_pages)?;
                } else {
                    self.write_page(&mut cur_guard, &cur_page);
                }
                break;
            }

            if cur_page.current_size() >= cur_page.min_size() {
                self.write_page(&mut cur_guard, &cur_page);
                break;
            }

            // underflow: rebalance against a sibling through the parent, which
            // is still latched because this node was not safe for remove
            let mut parent_guard = context.write_set.pop_back().ok_or_else(|| {
                VellumError::Internal("underflowing node has no latched parent".to_string())
            })?;
            let cur_page_id = cur_guard.page_id();
            self.write_page(&mut cur_guard, &cur_page);
            drop(cur_guard);

            let (mut parent, _) = BPlusTreeInternalPageCodec::decode(
                parent_guard.data(),
                self.key_size,
                self.comparator,
            )?;
            let cur_index = parent.child_index_of(cur_page_id).ok_or_else(|| {
                VellumError::Internal(format!(
                    "page {} missing from its parent {}",
                    cur_page_id,
                    parent_guard.page_id()
                ))
            })?;
            // prefer the right sibling; the rightmost child pairs with its left
            let left_index = if cur_index + 1 == parent.array.len() {
                cur_index - 1
            } else {
                cur_index
            };
            let left_id = parent.value_at(left_index);
            let right_id = parent.value_at(left_index + 1);

            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (left_page, _) =
                BPlusTreePageCodec::decode(left_guard.data(), self.key_size, self.comparator)?;
            let (right_page, _) =
                BPlusTreePageCodec::decode(right_guard.data(), self.key_size, self.comparator)?;

            let total = left_page.current_size() + right_page.current_size();
            if total >= 2 * left_page.min_size() {
                self.redistribute(
                    &mut parent,
                    left_index,
                    left_page,
                    right_page,
                    &mut left_guard,
                    &mut right_guard,
                )?;
                self.write_internal(&mut parent_guard, &parent);
                break;
            }

            self.merge(
                &mut parent,
                left_index,
                left_page,
                right_page,
                &mut left_guard,
            )?;
            drop(right_guard);
            deleted_pages.push(right_id);
            trace!("merged page {} into {}", right_id, left_id);

            cur_page = BPlusTreePage::Internal(parent);
            cur_guard = parent_guard;
        }

        context.release_ancestors();
        for page_id in deleted_pages {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Creates the first root as an empty leaf. Double-checked under the tree
    /// latch so concurrent first inserts race safely.
    fn start_new_tree(&self) -> VellumResult<()> {
        let mut root_page_id = self.root_page_id.write();
        if *root_page_id != INVALID_PAGE_ID {
            return Ok(());
        }
        let page_id = {
            let mut guard = self.buffer_pool.new_page()?;
            let leaf = BPlusTreeLeafPage::new(
                guard.page_id(),
                INVALID_PAGE_ID,
                self.leaf_max_size,
                self.comparator,
            );
            self.write_leaf(&mut guard, &leaf);
            guard.page_id()
        };
        *root_page_id = page_id;
        trace!("b+ tree root created at page {}", page_id);
        Ok(())
    }

    /// Descends to the leaf covering `key` with exclusive latches, leaving
    /// the latched path (leaf included) in `context.write_set`. Ancestors of
    /// a safe node are released on the way down.
    fn find_leaf_pessimistic(
        &self,
        key: &[u8],
        op: TreeOp,
        context: &mut Context,
    ) -> VellumResult<()> {
        let root_page_id = self.root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Err(VellumError::Internal(
                "pessimistic descent on an empty tree".to_string(),
            ));
        }
        let root_guard = self.buffer_pool.fetch_page_write(root_page_id)?;
        context.write_set.push_back(root_guard);

        loop {
            let current = context
                .write_set
                .back()
                .expect("descent path cannot be empty");
            let (page, _) =
                BPlusTreePageCodec::decode(current.data(), self.key_size, self.comparator)?;
            let internal = match page {
                BPlusTreePage::Leaf(_) => return Ok(()),
                BPlusTreePage::Internal(internal) => internal,
            };

            let child_id = internal.look_up(key);
            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let (child_page, _) =
                BPlusTreePageCodec::decode(child_guard.data(), self.key_size, self.comparator)?;
            let safe = match op {
                TreeOp::Insert => child_page.is_safe_for_insert(),
                TreeOp::Remove => child_page.is_safe_for_remove(),
            };
            if safe {
                context.release_ancestors();
            }
            context.write_set.push_back(child_guard);
        }
    }

    /// Splits overflowing nodes bottom-up. Each split pushes the right
    /// sibling's first key into the parent, whose guard is still held in the
    /// context; an overflowing root is first copied into a fresh child so the
    /// root page id survives.
    fn split_and_propagate(
        &self,
        page: BPlusTreePage,
        guard: WritePageGuard,
        context: &mut Context,
    ) -> VellumResult<()> {
        let mut cur_page = page;
        let mut cur_guard = guard;
        loop {
            if cur_page.current_size() <= cur_page.max_size() {
                self.write_page(&mut cur_guard, &cur_page);
                return Ok(());
            }

            if cur_page.parent_page_id() == INVALID_PAGE_ID {
                let (child_page, child_guard) =
                    self.copy_root_into_child(&cur_page, &mut cur_guard)?;
                // the old root guard becomes the parent for the child's split
                context.write_set.push_back(cur_guard);
                cur_page = child_page;
                cur_guard = child_guard;
                continue;
            }

            let (separator, right_page_id) = self.split_node(&mut cur_page)?;
            self.write_page(&mut cur_guard, &cur_page);
            drop(cur_guard);
            trace!(
                "split page {} -> right sibling {}",
                cur_page.page_id(),
                right_page_id
            );

            let parent_guard = context.write_set.pop_back().ok_or_else(|| {
                VellumError::Internal("overflowing node has no latched parent".to_string())
            })?;
            let (mut parent, _) = BPlusTreeInternalPageCodec::decode(
                parent_guard.data(),
                self.key_size,
                self.comparator,
            )?;
            parent.insert(separator, right_page_id);
            cur_page = BPlusTreePage::Internal(parent);
            cur_guard = parent_guard;
        }
    }

    /// Moves the upper half ([min_size, size)) of a node into a fresh right
    /// sibling and returns the separator to insert into the parent.
    fn split_node(&self, page: &mut BPlusTreePage) -> VellumResult<(Vec<u8>, PageId)> {
        let mut right_guard = self.buffer_pool.new_page()?;
        let right_page_id = right_guard.page_id();

        match page {
            BPlusTreePage::Leaf(left) => {
                let moved = left.split_off(left.min_size() as usize);
                let mut right = BPlusTreeLeafPage::new(
                    right_page_id,
                    left.header.parent_page_id,
                    left.header.max_size,
                    self.comparator,
                );
                right.extend(moved);
                right.header.next_page_id = left.header.next_page_id;
                left.header.next_page_id = right_page_id;

                let separator = right.first_key().to_vec();
                self.write_leaf(&mut right_guard, &right);
                Ok((separator, right_page_id))
            }
            BPlusTreePage::Internal(left) => {
                let mut moved = left.split_off(left.min_size() as usize);
                // the first moved key moves up; its slot becomes the unused key
                let separator = std::mem::take(&mut moved[0].0);
                let mut right = BPlusTreeInternalPage::new(
                    right_page_id,
                    left.header.parent_page_id,
                    left.header.max_size,
                    self.comparator,
                );
                right.extend(moved);
                self.reparent_children(&right.child_page_ids(), right_page_id)?;
                self.write_internal(&mut right_guard, &right);
                Ok((separator, right_page_id))
            }
        }
    }

    /// Root overflow: the root's payload moves into a brand-new child and the
    /// root page becomes an internal node with that single child, keeping its
    /// page id. The caller then splits the returned child.
    fn copy_root_into_child(
        &self,
        root_page: &BPlusTreePage,
        root_guard: &mut WritePageGuard,
    ) -> VellumResult<(BPlusTreePage, WritePageGuard)> {
        let root_id = root_guard.page_id();
        let mut child_guard = self.buffer_pool.new_page()?;
        let child_id = child_guard.page_id();

        let child_page = match root_page {
            BPlusTreePage::Leaf(root_leaf) => {
                let mut child = BPlusTreeLeafPage::new(
                    child_id,
                    root_id,
                    root_leaf.header.max_size,
                    self.comparator,
                );
                child.extend(root_leaf.array.clone());
                child.header.next_page_id = root_leaf.header.next_page_id;
                BPlusTreePage::Leaf(child)
            }
            BPlusTreePage::Internal(root_internal) => {
                let mut child = BPlusTreeInternalPage::new(
                    child_id,
                    root_id,
                    root_internal.header.max_size,
                    self.comparator,
                );
                child.extend(root_internal.array.clone());
                self.reparent_children(&child.child_page_ids(), child_id)?;
                BPlusTreePage::Internal(child)
            }
        };
        self.write_page(&mut child_guard, &child_page);

        let mut new_root = BPlusTreeInternalPage::new(
            root_id,
            INVALID_PAGE_ID,
            self.internal_max_size,
            self.comparator,
        );
        new_root.push_back((Vec::new(), child_id));
        self.write_internal(root_guard, &new_root);
        trace!("root page {} pushed its payload down to {}", root_id, child_id);

        Ok((child_page, child_guard))
    }

    /// Root underflow: the sole child's payload is promoted into the root
    /// page (which may turn back into a leaf) and the child is deleted.
    fn collapse_root(
        &self,
        root_page: &BPlusTreePage,
        root_guard: &mut WritePageGuard,
        deleted_pages: &mut Vec<PageId>,
    ) -> VellumResult<()> {
        let root_id = root_guard.page_id();
        let child_id = match root_page {
            BPlusTreePage::Internal(internal) => internal.value_at(0),
            BPlusTreePage::Leaf(_) => {
                return Err(VellumError::Internal(
                    "leaf root cannot collapse".to_string(),
                ))
            }
        };

        let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
        let (child, _) =
            BPlusTreePageCodec::decode(child_guard.data(), self.key_size, self.comparator)?;

        let promoted = match child {
            BPlusTreePage::Leaf(child_leaf) => {
                let mut new_root = BPlusTreeLeafPage::new(
                    root_id,
                    INVALID_PAGE_ID,
                    child_leaf.header.max_size,
                    self.comparator,
                );
                new_root.extend(child_leaf.array);
                new_root.header.next_page_id = child_leaf.header.next_page_id;
                BPlusTreePage::Leaf(new_root)
            }
            BPlusTreePage::Internal(child_internal) => {
                let mut new_root = BPlusTreeInternalPage::new(
                    root_id,
                    INVALID_PAGE_ID,
                    child_internal.header.max_size,
                    self.comparator,
                );
                let children = child_internal.child_page_ids();
                new_root.extend(child_internal.array);
                self.reparent_children(&children, root_id)?;
                BPlusTreePage::Internal(new_root)
            }
        };
        self.write_page(root_guard, &promoted);
        drop(child_guard);
        deleted_pages.push(child_id);
        trace!("root page {} absorbed its only child {}", root_id, child_id);
        Ok(())
    }

    /// Moves one entry across the left/right boundary; the parent's separator
    /// becomes the new lower bound of the right node. Moved children are
    /// re-parented.
    fn redistribute(
        &self,
        parent: &mut BPlusTreeInternalPage,
        left_index: usize,
        left_page: BPlusTreePage,
        right_page: BPlusTreePage,
        left_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
    ) -> VellumResult<()> {
        let separator_index = left_index + 1;
        match (left_page, right_page) {
            (BPlusTreePage::Leaf(mut left), BPlusTreePage::Leaf(mut right)) => {
                if left.header.current_size < right.header.current_size {
                    let kv = right.remove_at(0);
                    let tail = left.array.len();
                    left.insert_at(tail, kv);
                } else {
                    let kv = left.remove_at(left.array.len() - 1);
                    right.insert_at(0, kv);
                }
                parent.set_key_at(separator_index, right.first_key().to_vec());
                self.write_leaf(left_guard, &left);
                self.write_leaf(right_guard, &right);
                Ok(())
            }
            (BPlusTreePage::Internal(mut left), BPlusTreePage::Internal(mut right)) => {
                if left.header.current_size < right.header.current_size {
                    // right's first child shifts left; the old separator
                    // becomes its key and right's next key moves up
                    let (_, moved_child) = right.remove_at(0);
                    let old_separator = parent.key_at(separator_index).to_vec();
                    left.push_back((old_separator, moved_child));
                    let new_separator = std::mem::take(&mut right.array[0].0);
                    parent.set_key_at(separator_index, new_separator);
                    self.reparent_children(&[moved_child], left.header.page_id)?;
                } else {
                    // left's last child shifts right; its key moves up and the
                    // old separator drops onto right's former first child
                    let (moved_key, moved_child) = left.remove_at(left.array.len() - 1);
                    let old_separator = parent.key_at(separator_index).to_vec();
                    right.set_key_at(0, old_separator);
                    right.insert_at(0, (Vec::new(), moved_child));
                    parent.set_key_at(separator_index, moved_key);
                    self.reparent_children(&[moved_child], right.header.page_id)?;
                }
                self.write_internal(left_guard, &left);
                self.write_internal(right_guard, &right);
                Ok(())
            }
            _ => Err(VellumError::Internal(
                "sibling pages disagree on page type".to_string(),
            )),
        }
    }

    /// Concatenates the right sibling into the left one and drops the right
    /// child's entry from the parent. The caller deletes the right page.
    fn merge(
        &self,
        parent: &mut BPlusTreeInternalPage,
        left_index: usize,
        left_page: BPlusTreePage,
        right_page: BPlusTreePage,
        left_guard: &mut WritePageGuard,
    ) -> VellumResult<()> {
        let separator_index = left_index + 1;
        match (left_page, right_page) {
            (BPlusTreePage::Leaf(mut left), BPlusTreePage::Leaf(right)) => {
                left.header.next_page_id = right.header.next_page_id;
                left.extend(right.array);
                parent.remove_at(separator_index);
                self.write_leaf(left_guard, &left);
                Ok(())
            }
            (BPlusTreePage::Internal(mut left), BPlusTreePage::Internal(mut right)) => {
                // right's unused first key regains the separator before the move
                let separator = parent.key_at(separator_index).to_vec();
                right.set_key_at(0, separator);
                let children = right.child_page_ids();
                left.extend(right.array);
                self.reparent_children(&children, left.header.page_id)?;
                parent.remove_at(separator_index);
                self.write_internal(left_guard, &left);
                Ok(())
            }
            _ => Err(VellumError::Internal(
                "sibling pages disagree on page type".to_string(),
            )),
        }
    }

    fn reparent_children(&self, children: &[PageId], parent_id: PageId) -> VellumResult<()> {
        for child_id in children {
            let mut child_guard = self.buffer_pool.fetch_page_write(*child_id)?;
            let (mut child, _) =
                BPlusTreePageCodec::decode(child_guard.data(), self.key_size, self.comparator)?;
            child.set_parent_page_id(parent_id);
            self.write_page(&mut child_guard, &child);
        }
        Ok(())
    }

    fn write_page(&self, guard: &mut WritePageGuard, page: &BPlusTreePage) {
        guard.overwrite(&BPlusTreePageCodec::encode(page, self.key_size));
    }

    fn write_leaf(&self, guard: &mut WritePageGuard, page: &BPlusTreeLeafPage) {
        guard.overwrite(&BPlusTreeLeafPageCodec::encode(page, self.key_size));
    }

    fn write_internal(&self, guard: &mut WritePageGuard, page: &BPlusTreeInternalPage) {
        guard.overwrite(&BPlusTreeInternalPageCodec::encode(page, self.key_size));
    }
}
