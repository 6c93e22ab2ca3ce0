use log::error;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::buffer::buffer_pool::BufferPoolManager;

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

pub(crate) type PageData = Box<[u8; PAGE_SIZE]>;

/// Bookkeeping for one buffer frame. Pin/evict transitions happen under the
/// pool-wide latch; the per-frame mutex makes individual reads coherent.
#[derive(Debug, Clone)]
pub(crate) struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }
}

/// A buffer frame: metadata plus the 4 KiB content buffer behind the page's
/// reader/writer latch.
#[derive(Debug)]
pub(crate) struct Frame {
    pub meta: Mutex<FrameMeta>,
    pub data: Arc<RwLock<PageData>>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(FrameMeta::empty()),
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
        }
    }
}

/// A pinned page held under its shared latch. Dropping the guard releases the
/// latch first, then unpins.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    guard: Option<ArcRwLockReadGuard<RawRwLock, PageData>>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard
            .as_ref()
            .map(|g| &g[..])
            .unwrap_or(&[])
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.guard.take();
        if !self.bpm.unpin_page(self.page_id, false) {
            error!("failed to unpin page {} on read guard drop", self.page_id);
        }
    }
}

/// A pinned page held under its exclusive latch. The guard tracks whether the
/// content was touched and ORs that into the dirty bit on unpin.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    is_dirty: bool,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, PageData>>,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard
            .as_ref()
            .map(|g| &g[..])
            .unwrap_or(&[])
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        self.guard
            .as_mut()
            .map(|g| &mut g[..])
            .unwrap_or(&mut [])
    }

    /// Replaces the whole page image.
    pub fn overwrite(&mut self, image: &[u8]) {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(image);
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.guard.take();
        if !self.bpm.unpin_page(self.page_id, self.is_dirty) {
            error!("failed to unpin page {} on write guard drop", self.page_id);
        }
    }
}

pub(crate) fn new_read_guard(
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, PageData>,
) -> ReadPageGuard {
    ReadPageGuard {
        bpm,
        page_id,
        guard: Some(guard),
    }
}

pub(crate) fn new_write_guard(
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, PageData>,
) -> WritePageGuard {
    WritePageGuard {
        bpm,
        page_id,
        is_dirty: false,
        guard: Some(guard),
    }
}
