//! Block backends for the storage device models.
//!
//! A [`VirtualDisk`] is what a drive is attached to: a byte store with a fixed
//! capacity, addressed by byte offset, with sector helpers layered on top.
//! [`RawDisk`] is the only image format here (a 1:1 mapping onto a
//! [`StorageBackend`]); richer formats plug in behind the same trait.

mod backend;
#[cfg(unix)]
mod file;
mod raw;

pub use backend::{MemBackend, StorageBackend};
#[cfg(unix)]
pub use file::FileBackend;
pub use raw::RawDisk;

use thiserror::Error;

/// Size of one hard-disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("access at offset {offset} for {len} bytes is outside capacity {capacity}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
    #[error("capacity {0} is not a whole number of sectors")]
    UnalignedCapacity(u64),
    #[error("backend I/O failed: {0}")]
    Backend(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// A disk-shaped view over some storage.
///
/// `read_at`/`write_at` take byte offsets; the sector helpers are what the
/// IDE layer uses. Implementations must be fully synchronous — the device
/// models assume a transfer has completed when the call returns.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.capacity_bytes() / SECTOR_SIZE as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(lba * SECTOR_SIZE as u64, buf)
    }

    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        self.write_at(lba * SECTOR_SIZE as u64, data)
    }
}

pub(crate) fn check_bounds(capacity: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(DiskError::OutOfBounds { offset, len, capacity }),
    }
}
