use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::{Result, StorageBackend};

/// A disk image backed by a host file.
pub struct FileBackend {
    file: File,
    len: u64,
}

impl FileBackend {
    /// Opens (or creates) the image file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    pub fn from_file(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        crate::check_bounds(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        crate::check_bounds(self.len, offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawDisk, VirtualDisk, SECTOR_SIZE};

    #[test]
    fn file_image_round_trips_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let backend = FileBackend::open(&path).unwrap();
        let mut disk = RawDisk::create(backend, 8 * SECTOR_SIZE as u64).unwrap();

        let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 253) as u8).collect();
        disk.write_sectors(5, &pattern).unwrap();
        disk.flush().unwrap();

        // Re-open the same image and read it back.
        let mut reopened = RawDisk::open(FileBackend::open(&path).unwrap()).unwrap();
        assert_eq!(reopened.capacity_bytes(), 8 * SECTOR_SIZE as u64);
        let mut out = vec![0u8; SECTOR_SIZE];
        reopened.read_sectors(5, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn bounds_are_enforced_on_file_images() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("tiny.img")).unwrap();
        let mut disk = RawDisk::create(backend, SECTOR_SIZE as u64).unwrap();

        let mut buf = vec![0u8; SECTOR_SIZE];
        assert!(disk.read_sectors(1, &mut buf).is_err());
    }
}
