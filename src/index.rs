//! Array handle management over the self-hosted index table.
//!
//! The table of 16-byte entries is itself an ordinary array whose entry
//! lives in the static header, resized through the same state machine as
//! user arrays. Free slots form a list threaded through their entries.

use crate::error::Result;
use crate::layout::{
    cluster_align_down, offset_in_cluster, ArrayIndex, BlockType, IndexEntry, CLUSTER_SIZE,
    FREE_INDEX_TAIL, INDEX_ENTRY_SIZE,
};
use crate::store::Store;
use crate::tree::TreeCursor;
use tracing::debug;

impl Store {
    /// File offset of slot `index`, dispatching on the table's own storage
    /// class. A tree-backed table is resolved through a cursor, the same
    /// machinery user arrays use.
    pub(crate) fn index_entry_offset(&self, index: ArrayIndex) -> Result<u64> {
        let table = self.index_table_entry()?;
        let offset_in_table = index.0 * INDEX_ENTRY_SIZE;
        debug_assert!(offset_in_table < table.array_size);
        let class = BlockType::for_size(table.array_size);
        debug_assert!(class > BlockType::L8);
        if class < BlockType::L4096Plus {
            Ok(table.payload + offset_in_table)
        } else {
            let mut cursor = TreeCursor::new(table)?;
            cursor.seek_to_cluster(&self.file, cluster_align_down(offset_in_table))?;
            Ok(cursor.current_cluster_offset() + offset_in_cluster(offset_in_table))
        }
    }

    pub(crate) fn index_entry(&self, index: ArrayIndex) -> Result<IndexEntry> {
        let offset = self.index_entry_offset(index)?;
        self.read_entry_at(offset)
    }

    pub(crate) fn set_index_entry(&mut self, index: ArrayIndex, entry: IndexEntry) -> Result<()> {
        let offset = self.index_entry_offset(index)?;
        self.write_entry_at(offset, entry)
    }

    pub(crate) fn is_index_valid(&self, index: ArrayIndex) -> Result<bool> {
        if index.0 == FREE_INDEX_TAIL {
            return Ok(false);
        }
        let table = self.index_table_entry()?;
        let in_table = index
            .0
            .checked_mul(INDEX_ENTRY_SIZE)
            .is_some_and(|offset| offset < table.array_size);
        if !in_table {
            return Ok(false);
        }
        Ok(!self.index_entry(index)?.is_free())
    }

    /// Thread the slots `[begin, end)` onto the index freelist, in reverse so
    /// allocation hands them out in ascending order. The range never crosses
    /// a cluster boundary (growth steps cap at one cluster), so slot offsets
    /// are contiguous.
    fn thread_free_slots(&mut self, begin: ArrayIndex, end: ArrayIndex) -> Result<ArrayIndex> {
        debug_assert!(begin.0 < end.0);
        let begin_offset = self.index_entry_offset(begin)?;
        let mut next_free = self.free_index_head()?;
        for slot in (begin.0..end.0).rev() {
            let entry = IndexEntry::free_slot(next_free);
            self.write_entry_at(begin_offset + (slot - begin.0) * INDEX_ENTRY_SIZE, entry)?;
            next_free = ArrayIndex(slot);
        }
        self.set_free_index_head(next_free)?;
        Ok(next_free)
    }

    /// Grow the table by `min(current size, one cluster)` and put the fresh
    /// slots on the freelist. Returns the new freelist head.
    pub(crate) fn extend_index_table(&mut self) -> Result<ArrayIndex> {
        let table = self.index_table_entry()?;
        let old_size = table.array_size;
        let new_size = old_size + old_size.min(CLUSTER_SIZE);
        debug!(old_size, new_size, "extending index table");
        let table = self.resize_entry(table, new_size)?;
        self.set_index_table_entry(table)?;
        self.thread_free_slots(
            ArrayIndex(old_size / INDEX_ENTRY_SIZE),
            ArrayIndex(new_size / INDEX_ENTRY_SIZE),
        )
    }

    /// Pop a free handle, growing the table as needed. The freshly formatted
    /// table needs two growth steps before a usable slot exists: the first
    /// one only materializes slot 0, which is the freelist tail sentinel and
    /// must never be handed out.
    pub(crate) fn allocate_index(&mut self) -> Result<ArrayIndex> {
        let mut head = self.free_index_head()?;
        while head.0 == FREE_INDEX_TAIL {
            head = self.extend_index_table()?;
        }
        let entry = self.index_entry(head)?;
        debug_assert!(entry.is_free());
        self.set_free_index_head(entry.next_free())?;
        self.set_index_entry(head, IndexEntry::empty())?;
        Ok(head)
    }

    /// Release all storage owned by the slot and push it onto the freelist.
    pub(crate) fn deallocate_index(&mut self, index: ArrayIndex) -> Result<()> {
        let entry = self.index_entry(index)?;
        self.resize_entry(entry, 0)?;
        let head = self.free_index_head()?;
        self.set_index_entry(index, IndexEntry::free_slot(head))?;
        self.set_free_index_head(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_store(dir: &TempDir) -> Store {
        Store::create(dir.path().join("index.dyn")).unwrap()
    }

    #[test]
    fn test_first_handle_is_one() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        assert_eq!(store.allocate_index().unwrap(), ArrayIndex(1));
    }

    #[test]
    fn test_handles_ascend() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        for expected in 1..=20u64 {
            assert_eq!(store.allocate_index().unwrap(), ArrayIndex(expected));
        }
    }

    #[test]
    fn test_zero_index_never_valid() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        store.allocate_index().unwrap();
        assert!(!store.is_index_valid(ArrayIndex(0)).unwrap());
    }

    #[test]
    fn test_deallocate_recycles_handle() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let a = store.allocate_index().unwrap();
        let b = store.allocate_index().unwrap();
        store.deallocate_index(a).unwrap();
        assert!(!store.is_index_valid(a).unwrap());
        assert!(store.is_index_valid(b).unwrap());
        // Freed handle comes back first.
        assert_eq!(store.allocate_index().unwrap(), a);
    }

    #[test]
    fn test_fresh_entry_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let index = store.allocate_index().unwrap();
        assert_eq!(store.index_entry(index).unwrap(), IndexEntry::empty());
    }

    #[test]
    fn test_table_outgrows_one_cluster() {
        // 300 handles push the table past 4096 bytes, moving it into the
        // tree-backed storage class; slot resolution must keep working.
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let mut handles = Vec::new();
        for _ in 0..300 {
            handles.push(store.allocate_index().unwrap());
        }
        let table = store.index_table_entry().unwrap();
        assert!(table.array_size > CLUSTER_SIZE);
        for handle in handles {
            assert!(store.is_index_valid(handle).unwrap());
        }
        assert!(store.load_and_check());
    }
}
