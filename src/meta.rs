//! Typed accessors over the static header at cluster 0.
//!
//! Both the index table's own entry and user entries go through the same
//! `read_entry_at`/`write_entry_at` primitives; only the location differs.

use crate::error::Result;
use crate::layout::{
    ArrayIndex, BlockType, IndexEntry, CLUSTER_SIZE, META_FILE_SIZE, META_FREE_CLUSTER_HEAD,
    META_FREE_INDEX_HEAD, META_INDEX_TABLE_ENTRY, META_USER_METADATA_SIZE,
};
use crate::store::Store;

impl Store {
    /// File size as recorded in the header; must match the mapped length.
    pub(crate) fn file_size_field(&self) -> Result<u64> {
        self.file.read_u64(META_FILE_SIZE)
    }

    /// Grow or truncate the backing file, keeping the header field in step.
    pub(crate) fn set_size(&mut self, new_size: u64) -> Result<()> {
        debug_assert!(new_size > 0 && new_size % CLUSTER_SIZE == 0);
        self.file.set_len(new_size)?;
        self.file.write_u64(META_FILE_SIZE, new_size)
    }

    pub(crate) fn read_entry_at(&self, offset: u64) -> Result<IndexEntry> {
        let mut bytes = [0u8; 16];
        self.file.read_bytes(offset, &mut bytes)?;
        Ok(IndexEntry::decode(bytes))
    }

    pub(crate) fn write_entry_at(&mut self, offset: u64, entry: IndexEntry) -> Result<()> {
        self.file.write_bytes(offset, &entry.encode())
    }

    pub(crate) fn index_table_entry(&self) -> Result<IndexEntry> {
        self.read_entry_at(META_INDEX_TABLE_ENTRY)
    }

    pub(crate) fn set_index_table_entry(&mut self, entry: IndexEntry) -> Result<()> {
        self.write_entry_at(META_INDEX_TABLE_ENTRY, entry)
    }

    pub(crate) fn free_index_head(&self) -> Result<ArrayIndex> {
        Ok(ArrayIndex(self.file.read_u64(META_FREE_INDEX_HEAD)?))
    }

    pub(crate) fn set_free_index_head(&mut self, head: ArrayIndex) -> Result<()> {
        self.file.write_u64(META_FREE_INDEX_HEAD, head.0)
    }

    pub(crate) fn free_block_head(&self, class: BlockType) -> Result<u64> {
        self.file.read_u64(class.freelist_head_offset())
    }

    pub(crate) fn set_free_block_head(&mut self, class: BlockType, offset: u64) -> Result<()> {
        self.file.write_u64(class.freelist_head_offset(), offset)
    }

    /// Reserved; must stay zero.
    pub(crate) fn free_cluster_head(&self) -> Result<u64> {
        self.file.read_u64(META_FREE_CLUSTER_HEAD)
    }

    pub(crate) fn user_metadata_size(&self) -> Result<u64> {
        self.file.read_u64(META_USER_METADATA_SIZE)
    }

    pub(crate) fn set_user_metadata_size(&mut self, size: u64) -> Result<()> {
        self.file.write_u64(META_USER_METADATA_SIZE, size)
    }
}
