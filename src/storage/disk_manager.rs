use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::VellumResult;

/// Raw page I/O over a single database file.
///
/// Page ids map to fixed offsets (`page_id * PAGE_SIZE`); id 0 is reserved
/// for `INVALID_PAGE_ID`, so its slot is never written. Reads past the end of
/// the file yield zeroed pages, which lets the buffer pool fetch pages whose
/// ids were allocated but never flushed.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> VellumResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        debug!("disk manager opened {:?}", db_path.as_ref());
        Ok(Self {
            db_file: Mutex::new(db_file),
        })
    }

    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> VellumResult<()> {
        let mut file = self.db_file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        let readable = ((file_len - offset) as usize).min(PAGE_SIZE);
        file.read_exact(&mut buf[..readable])?;
        buf[readable..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut file = self.db_file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    pub fn db_file_len(&self) -> VellumResult<u64> {
        Ok(self.db_file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::DiskManager;
    use crate::buffer::PAGE_SIZE;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        disk_manager.write_page(3, &page).unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        disk_manager.read_page(3, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn read_past_eof_returns_zeroed_page() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        disk_manager.read_page(42, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }
}
