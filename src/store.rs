//! The public storage engine.
//!
//! A `Store` exposes a flat collection of dynamically-resizable byte arrays
//! addressed by small integer handles, persisted in a single file laid out
//! as fixed-size clusters. All mutation goes through `&mut self`; the engine
//! assumes exclusive access to the file while open.

use crate::error::{Result, StoreError};
use crate::io::StoreFile;
use crate::layout::{
    cluster_align_down, offset_in_cluster, ArrayIndex, BlockType, IndexEntry, CLUSTER_SIZE,
    MAX_USER_METADATA_SIZE, META_FILE_SIZE, META_USER_METADATA,
};
use crate::tree::TreeCursor;
use std::path::Path;
use tracing::{debug, warn};

/// Single-file storage engine for dynamically-resizable byte arrays.
pub struct Store {
    pub(crate) file: StoreFile,
}

impl Store {
    /// Open the store at `path`, formatting a fresh file and verifying an
    /// existing one. An existing file that fails the structural audit is
    /// refused.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = StoreFile::open(&path)?;
        let mut store = Store { file };
        if store.file.is_empty() {
            store.format()?;
        } else if !store.load_and_check() {
            return Err(StoreError::Corrupt(format!(
                "structural audit failed for {}",
                path.as_ref().display()
            )));
        }
        Ok(store)
    }

    /// Reset the file to its initial one-cluster state: a zeroed static
    /// header, an inline index table, and the tail of cluster 0 carved into
    /// small-class free blocks so bootstrapping needs no extra cluster.
    pub fn format(&mut self) -> Result<()> {
        self.file.set_len(CLUSTER_SIZE)?;
        self.file.write_bytes(0, &[0u8; CLUSTER_SIZE as usize])?;
        self.file.write_u64(META_FILE_SIZE, CLUSTER_SIZE)?;
        // Freelist heads and user metadata are already zero from the wipe;
        // the index table starts as one inline entry-sized array.
        self.set_index_table_entry(IndexEntry {
            array_size: 8,
            payload: 0,
        })?;
        self.initialize_cluster_section(BlockType::L16, 0, 256, 512)?;
        self.initialize_cluster_section(BlockType::L32, 0, 512, 1024)?;
        self.initialize_cluster_section(BlockType::L64, 0, 1024, 2048)?;
        self.initialize_cluster_section(BlockType::L128, 0, 2048, 3072)?;
        self.initialize_cluster_section(BlockType::L256, 0, 3072, 4096)?;
        debug!(path = %self.file.path().display(), "formatted store");
        Ok(())
    }

    /// Run the structural audit; `true` means the file is consistent.
    pub fn load_and_check(&self) -> bool {
        match self.audit() {
            Ok(()) => true,
            Err(error) => {
                warn!(path = %self.file.path().display(), %error, "consistency check failed");
                false
            }
        }
    }

    /// Flush the mapping to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Bytes currently recorded in the user metadata region.
    pub fn user_metadata_len(&self) -> Result<u64> {
        self.user_metadata_size()
    }

    /// Copy the first `buf.len()` bytes of user metadata into `buf`.
    pub fn load_user_metadata(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > MAX_USER_METADATA_SIZE {
            return Err(StoreError::UserMetadataTooLarge {
                size: buf.len() as u64,
                max: MAX_USER_METADATA_SIZE,
            });
        }
        self.file.read_bytes(META_USER_METADATA, buf)
    }

    /// Replace the user metadata with `data`.
    pub fn store_user_metadata(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > MAX_USER_METADATA_SIZE {
            return Err(StoreError::UserMetadataTooLarge {
                size: data.len() as u64,
                max: MAX_USER_METADATA_SIZE,
            });
        }
        self.file.write_bytes(META_USER_METADATA, data)?;
        self.set_user_metadata_size(data.len() as u64)
    }

    /// Allocate a new zero-sized array and return its handle.
    pub fn create_array(&mut self) -> Result<ArrayIndex> {
        let index = self.allocate_index()?;
        debug!(index = index.0, "created array");
        Ok(index)
    }

    /// Release all storage owned by the array and retire its handle.
    pub fn destroy_array(&mut self, index: ArrayIndex) -> Result<()> {
        self.check_index(index)?;
        self.deallocate_index(index)?;
        debug!(index = index.0, "destroyed array");
        Ok(())
    }

    /// Current logical size of the array in bytes.
    pub fn array_size(&self, index: ArrayIndex) -> Result<u64> {
        self.check_index(index)?;
        Ok(self.index_entry(index)?.array_size)
    }

    /// Resize the array, preserving the leading `min(old, new)` bytes.
    /// Newly exposed bytes are unspecified until written.
    pub fn set_array_size(&mut self, index: ArrayIndex, new_size: u64) -> Result<()> {
        self.check_index(index)?;
        let entry = self.index_entry(index)?;
        let entry = self.resize_entry(entry, new_size)?;
        self.set_index_entry(index, entry)
    }

    /// Read `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_array(&self, index: ArrayIndex, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_index(index)?;
        if buf.is_empty() {
            return Ok(());
        }
        let entry = self.index_entry(index)?;
        self.check_range(&entry, offset, buf.len() as u64)?;
        match BlockType::for_size(entry.array_size) {
            BlockType::L8 => {
                let inline = entry.payload.to_le_bytes();
                buf.copy_from_slice(&inline[offset as usize..offset as usize + buf.len()]);
                Ok(())
            }
            BlockType::L4096Plus => {
                let mut cursor = TreeCursor::new(entry)?;
                cursor.seek_to_cluster(&self.file, cluster_align_down(offset))?;
                let mut in_cluster = offset_in_cluster(offset);
                let mut done = 0;
                while done < buf.len() {
                    let step = ((CLUSTER_SIZE - in_cluster) as usize).min(buf.len() - done);
                    self.file.read_bytes(
                        cursor.current_cluster_offset() + in_cluster,
                        &mut buf[done..done + step],
                    )?;
                    done += step;
                    if done < buf.len() {
                        cursor.goto_next_cluster(&self.file)?;
                        in_cluster = 0;
                    }
                }
                Ok(())
            }
            _ => self.file.read_bytes(entry.payload + offset, buf),
        }
    }

    /// Write `data` into the array starting at `offset`. The range must lie
    /// within the current size; writes never grow an array.
    pub fn write_array(&mut self, index: ArrayIndex, offset: u64, data: &[u8]) -> Result<()> {
        self.check_index(index)?;
        if data.is_empty() {
            return Ok(());
        }
        let entry = self.index_entry(index)?;
        self.check_range(&entry, offset, data.len() as u64)?;
        match BlockType::for_size(entry.array_size) {
            BlockType::L8 => {
                let mut inline = entry.payload.to_le_bytes();
                inline[offset as usize..offset as usize + data.len()].copy_from_slice(data);
                let mut entry = entry;
                entry.payload = u64::from_le_bytes(inline);
                self.set_index_entry(index, entry)
            }
            BlockType::L4096Plus => {
                let mut cursor = TreeCursor::new(entry)?;
                cursor.seek_to_cluster(&self.file, cluster_align_down(offset))?;
                let mut in_cluster = offset_in_cluster(offset);
                let mut done = 0;
                while done < data.len() {
                    let step = ((CLUSTER_SIZE - in_cluster) as usize).min(data.len() - done);
                    self.file.write_bytes(
                        cursor.current_cluster_offset() + in_cluster,
                        &data[done..done + step],
                    )?;
                    done += step;
                    if done < data.len() {
                        cursor.goto_next_cluster(&self.file)?;
                        in_cluster = 0;
                    }
                }
                Ok(())
            }
            _ => self.file.write_bytes(entry.payload + offset, data),
        }
    }

    fn check_index(&self, index: ArrayIndex) -> Result<()> {
        if self.is_index_valid(index)? {
            Ok(())
        } else {
            Err(StoreError::InvalidIndex(index.0))
        }
    }

    fn check_range(&self, entry: &IndexEntry, offset: u64, size: u64) -> Result<()> {
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= entry.array_size);
        if in_bounds {
            Ok(())
        } else {
            Err(StoreError::InvalidRange {
                offset,
                size,
                array_size: entry.array_size,
            })
        }
    }
}
