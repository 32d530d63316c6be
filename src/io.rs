//! Memory-mapped backing file.
//!
//! The engine sees byte-addressable random-access storage that grows in
//! cluster units. The map is dropped and rebuilt around every resize; all
//! internal "pointers" are file offsets, so nothing needs reseating.
//!
//! The caller is assumed to hold exclusive access to the file for the
//! lifetime of the handle.

use crate::error::{Result, StoreError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Mapped store file. Unmapped only while the file is empty (a fresh file
/// before formatting).
pub struct StoreFile {
    file: File,
    mmap: Option<MmapMut>,
    path: PathBuf,
}

impl StoreFile {
    /// Open or create the file at `path`, mapping it if non-empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map_mut(&file)? })
        };
        Ok(StoreFile {
            file,
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn len(&self) -> u64 {
        self.mmap.as_ref().map_or(0, |m| m.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow or truncate the file and rebuild the mapping.
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        // Unmap before resizing; remapping a shrunk file is undefined.
        self.mmap = None;
        self.file.set_len(new_len)?;
        if new_len > 0 {
            self.mmap = Some(unsafe { MmapOptions::new().map_mut(&self.file)? });
        }
        Ok(())
    }

    fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let map = self.mmap.as_ref().ok_or(StoreError::OutOfBounds {
            offset,
            file_size: 0,
        })?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= map.len() as u64)
            .ok_or(StoreError::OutOfBounds {
                offset,
                file_size: map.len() as u64,
            })?;
        Ok(&map[offset as usize..end as usize])
    }

    fn slice_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8]> {
        let map = self.mmap.as_mut().ok_or(StoreError::OutOfBounds {
            offset,
            file_size: 0,
        })?;
        let file_size = map.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= file_size)
            .ok_or(StoreError::OutOfBounds { offset, file_size })?;
        Ok(&mut map[offset as usize..end as usize])
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.slice(offset, 8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.slice_mut(offset, 8)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.slice(offset, buf.len() as u64)?);
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.slice_mut(offset, data.len() as u64)?
            .copy_from_slice(data);
        Ok(())
    }

    /// Possibly-overlapping copy inside the mapping.
    pub fn move_data(&mut self, src: u64, dst: u64, len: u64) -> Result<()> {
        // Validate both ranges, then copy over the whole map.
        self.slice(src, len)?;
        self.slice(dst, len)?;
        let map = self.mmap.as_mut().ok_or(StoreError::OutOfBounds {
            offset: src,
            file_size: 0,
        })?;
        map.copy_within(src as usize..(src + len) as usize, dst as usize);
        Ok(())
    }

    /// Flush the mapping to disk.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(map) = &self.mmap {
            map.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_sized(dir: &TempDir, len: u64) -> StoreFile {
        let mut file = StoreFile::open(dir.path().join("test.dyn")).unwrap();
        file.set_len(len).unwrap();
        file
    }

    #[test]
    fn test_fresh_file_is_unmapped() {
        let dir = TempDir::new().unwrap();
        let file = StoreFile::open(dir.path().join("fresh.dyn")).unwrap();
        assert_eq!(file.len(), 0);
        assert!(file.is_empty());
        assert!(matches!(
            file.read_u64(0),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_u64_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut file = open_sized(&dir, 4096);
        file.write_u64(128, 0xFEED_FACE_CAFE_BEEF).unwrap();
        assert_eq!(file.read_u64(128).unwrap(), 0xFEED_FACE_CAFE_BEEF);
    }

    #[test]
    fn test_grow_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let mut file = open_sized(&dir, 4096);
        file.write_bytes(100, b"persist me").unwrap();
        file.set_len(8192).unwrap();
        assert_eq!(file.len(), 8192);
        let mut buf = [0u8; 10];
        file.read_bytes(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persist me");
        // Grown region reads as zeros.
        assert_eq!(file.read_u64(8000).unwrap(), 0);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dir = TempDir::new().unwrap();
        let mut file = open_sized(&dir, 4096);
        assert!(matches!(
            file.read_u64(4092),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            file.write_u64(u64::MAX - 4, 1),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_overlapping_move() {
        let dir = TempDir::new().unwrap();
        let mut file = open_sized(&dir, 4096);
        file.write_bytes(0, b"abcdefgh").unwrap();
        file.move_data(0, 4, 8).unwrap();
        let mut buf = [0u8; 12];
        file.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdabcdefgh");
    }

    #[test]
    fn test_reopen_sees_written_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.dyn");
        {
            let mut file = StoreFile::open(&path).unwrap();
            file.set_len(4096).unwrap();
            file.write_u64(64, 42).unwrap();
            file.sync().unwrap();
        }
        let file = StoreFile::open(&path).unwrap();
        assert_eq!(file.len(), 4096);
        assert_eq!(file.read_u64(64).unwrap(), 42);
    }
}
