use crate::{DiskError, Result};

/// Raw byte storage an image format sits on: a file, a memory buffer, a
/// host block device.
pub trait StorageBackend {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows (or shrinks) the backing store. Newly exposed bytes read zero.
    fn set_len(&mut self, len: u64) -> Result<()>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory backend, primarily for tests and scratch disks.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let mut backend = Self::new();
        backend.set_len(len)?;
        Ok(backend)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| DiskError::OutOfBounds {
            offset: 0,
            len: usize::MAX,
            capacity: self.data.len() as u64,
        })?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        crate::check_bounds(self.len(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        crate::check_bounds(self.len(), offset, data.len())?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}
