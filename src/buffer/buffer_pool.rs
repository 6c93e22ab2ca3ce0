use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::page::{
    self, AtomicPageId, Frame, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID,
};
use crate::config::BufferPoolConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_manager::DiskManager;
use crate::utils::cache::lru_k::LruKReplacer;
use crate::utils::cache::Replacer;
use crate::utils::hash::ExtendibleHashTable;

pub type FrameId = usize;

const PAGE_TABLE_BUCKET_SIZE: usize = 32;

/// Fixed-size cache of on-disk pages.
///
/// The pool-wide latch serializes every page-table, free-list and replacer
/// interaction, so the pin/evict invariant (`pin_count > 0` implies not
/// evictable, exactly one frame per cached page) holds at all times. Page
/// *content* is protected by the per-frame latch instead, which callers hold
/// through the returned guards; the latch is never acquired while the pool
/// latch is blocked on it the other way around.
#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<Frame>,
    // pool-wide latch; owns the free list
    latch: Mutex<VecDeque<FrameId>>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: Mutex<LruKReplacer>,
    disk_manager: Arc<DiskManager>,
    next_page_id: AtomicPageId,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_manager,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        let num_pages = config.buffer_pool_size;
        let mut frames = Vec::with_capacity(num_pages);
        let mut free_list = VecDeque::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            frames.push(Frame::new());
            free_list.push_back(frame_id);
        }
        Self {
            frames,
            latch: Mutex::new(free_list),
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: Mutex::new(LruKReplacer::with_k(num_pages, config.lru_k_k)),
            disk_manager,
            next_page_id: AtomicPageId::new(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Number of frames currently evictable.
    pub fn evictable_count(&self) -> usize {
        self.replacer.lock().size()
    }

    /// Number of frames never used so far.
    pub fn free_frame_count(&self) -> usize {
        self.latch.lock().len()
    }

    /// Allocates a fresh page id, pins it into a zeroed frame and returns the
    /// page under its exclusive latch.
    pub fn new_page(self: &Arc<Self>) -> VellumResult<WritePageGuard> {
        let page_id = {
            let mut free_list = self.latch.lock();
            let frame_id = self.allocate_frame(&mut free_list)?;
            let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);

            self.frames[frame_id].data.write().fill(0);
            {
                let mut meta = self.frames[frame_id].meta.lock();
                meta.page_id = page_id;
                meta.pin_count = 1;
                meta.is_dirty = false;
            }
            self.page_table.insert(page_id, frame_id);
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id)?;
            replacer.set_evictable(frame_id, false)?;
            page_id
        };
        self.acquire_write_guard(page_id)
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> VellumResult<ReadPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        let guard = self.frames[frame_id].data.read_arc();
        Ok(page::new_read_guard(Arc::clone(self), page_id, guard))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> VellumResult<WritePageGuard> {
        self.pin_page(page_id)?;
        self.acquire_write_guard(page_id)
    }

    fn acquire_write_guard(self: &Arc<Self>, page_id: PageId) -> VellumResult<WritePageGuard> {
        let frame_id = {
            let _pool = self.latch.lock();
            self.page_table.find(&page_id).ok_or_else(|| {
                VellumError::Internal(format!("pinned page {} vanished from page table", page_id))
            })?
        };
        let guard = self.frames[frame_id].data.write_arc();
        Ok(page::new_write_guard(Arc::clone(self), page_id, guard))
    }

    /// Pins `page_id` into a frame, reading it from disk on a miss. Returns
    /// the frame id; the caller latches the content afterwards, outside the
    /// pool latch.
    fn pin_page(&self, page_id: PageId) -> VellumResult<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "cannot fetch the invalid page id".to_string(),
            ));
        }
        let mut free_list = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            self.frames[frame_id].meta.lock().pin_count += 1;
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id)?;
            replacer.set_evictable(frame_id, false)?;
            return Ok(frame_id);
        }

        let frame_id = self.allocate_frame(&mut free_list)?;
        let read_result = {
            let mut data = self.frames[frame_id].data.write();
            self.disk_manager.read_page(page_id, &mut data)
        };
        if let Err(e) = read_result {
            free_list.push_back(frame_id);
            return Err(e);
        }
        {
            let mut meta = self.frames[frame_id].meta.lock();
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.page_table.insert(page_id, frame_id);
        let mut replacer = self.replacer.lock();
        replacer.record_access(frame_id)?;
        replacer.set_evictable(frame_id, false)?;
        Ok(frame_id)
    }

    /// Decrements the pin; the frame becomes evictable when it reaches zero.
    /// The dirty flag is ORed in. Returns false for unknown or already
    /// zero-pinned pages.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _pool = self.latch.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let mut meta = self.frames[frame_id].meta.lock();
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        let now_unpinned = meta.pin_count == 0;
        drop(meta);
        if now_unpinned {
            if let Err(e) = self.replacer.lock().set_evictable(frame_id, true) {
                warn!("failed to mark frame {} evictable: {}", frame_id, e);
            }
        }
        true
    }

    /// Writes the page back to disk and clears its dirty bit. Returns false
    /// when the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        let _pool = self.latch.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        self.flush_frame(page_id, frame_id)?;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let _pool = self.latch.lock();
        for (frame_id, frame) in self.frames.iter().enumerate() {
            let (page_id, is_dirty) = {
                let meta = frame.meta.lock();
                (meta.page_id, meta.is_dirty)
            };
            if page_id == INVALID_PAGE_ID || !is_dirty {
                continue;
            }
            self.flush_frame(page_id, frame_id)?;
        }
        Ok(())
    }

    fn flush_frame(&self, page_id: PageId, frame_id: FrameId) -> VellumResult<()> {
        let image = {
            let data = self.frames[frame_id].data.read();
            Bytes::copy_from_slice(&data[..])
        };
        self.disk_manager.write_page(page_id, &image)?;
        self.frames[frame_id].meta.lock().is_dirty = false;
        Ok(())
    }

    /// Drops the page from the pool, freeing its frame. Pinned pages are not
    /// deleted (returns false); deleting an uncached page succeeds.
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        let mut free_list = self.latch.lock();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(true);
        };
        let is_dirty = {
            let meta = self.frames[frame_id].meta.lock();
            if meta.pin_count > 0 {
                return Ok(false);
            }
            meta.is_dirty
        };
        if is_dirty {
            self.flush_frame(page_id, frame_id)?;
        }
        self.page_table.remove(&page_id);
        self.replacer.lock().remove(frame_id);
        self.frames[frame_id].meta.lock().reset();
        self.frames[frame_id].data.write().fill(0);
        free_list.push_back(frame_id);
        Ok(true)
    }

    /// Picks a frame for reuse: free list first, then the replacer's victim.
    /// A dirty victim is written back before its frame is handed out. Must be
    /// called with the pool latch held.
    fn allocate_frame(&self, free_list: &mut VecDeque<FrameId>) -> VellumResult<FrameId> {
        if let Some(frame_id) = free_list.pop_front() {
            return Ok(frame_id);
        }
        let victim = self.replacer.lock().evict().ok_or_else(|| {
            VellumError::Storage(
                "Cannot new page because buffer pool is full and no page to evict".to_string(),
            )
        })?;
        let (page_id, is_dirty) = {
            let meta = self.frames[victim].meta.lock();
            (meta.page_id, meta.is_dirty)
        };
        if page_id != INVALID_PAGE_ID {
            if is_dirty {
                let image = {
                    let data = self.frames[victim].data.read();
                    Bytes::copy_from_slice(&data[..])
                };
                self.disk_manager.write_page(page_id, &image)?;
            }
            self.page_table.remove(&page_id);
        }
        self.frames[victim].meta.lock().reset();
        Ok(victim)
    }

    #[cfg(test)]
    pub(crate) fn frame_of(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.find(&page_id)
    }

    #[cfg(test)]
    pub(crate) fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id].meta.lock().pin_count)
    }
}
