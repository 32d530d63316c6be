//! Structural audit run at load time.
//!
//! The freelists are the allocator's only record of ownership, so the audit
//! re-derives the full storage map: every freelist block, every live block,
//! every tree node and leaf. Any loop, misalignment, out-of-range offset, or
//! overlap between two owners is fatal to the open.

use crate::error::{Result, StoreError};
use crate::layout::{
    ArrayIndex, BlockType, IndexEntry, CLUSTER_INDEX_FANOUT, CLUSTER_INDEX_SIZE, CLUSTER_SIZE,
    FREE_BLOCK_TAIL, FREE_INDEX_TAIL, INDEX_ENTRY_SIZE, MAX_USER_METADATA_SIZE,
    STATIC_METADATA_SIZE,
};
use crate::store::Store;
use crate::tree::TreeCursor;
use std::collections::HashSet;

fn corrupt<T>(reason: impl Into<String>) -> Result<T> {
    Err(StoreError::Corrupt(reason.into()))
}

/// Overflow-safe containment check for `[offset, offset + size)`.
fn in_range(offset: u64, size: u64, file_size: u64) -> bool {
    offset >= STATIC_METADATA_SIZE
        && offset
            .checked_add(size)
            .is_some_and(|end| end <= file_size)
}

impl Store {
    /// Full structural audit; `Ok(())` means the file is consistent.
    pub(crate) fn audit(&self) -> Result<()> {
        let file_size = self.file.len();
        if file_size == 0 || file_size % CLUSTER_SIZE != 0 {
            return corrupt("file size is not a positive multiple of the cluster size");
        }
        if self.file_size_field()? != file_size {
            return corrupt("recorded file size disagrees with the actual file size");
        }

        let table = self.index_table_entry()?;
        if table.is_free() {
            return corrupt("index table entry is marked free");
        }
        if table.array_size > CLUSTER_SIZE {
            if table.array_size % CLUSTER_SIZE != 0 {
                return corrupt("tree-backed index table size is not cluster-aligned");
            }
        } else if BlockType::for_size(table.array_size).size() != table.array_size {
            return corrupt("index table size is not an exact block size");
        }

        if self.user_metadata_size()? > MAX_USER_METADATA_SIZE {
            return corrupt("user metadata size exceeds its limit");
        }
        if self.free_cluster_head()? != 0 {
            return corrupt("reserved cluster freelist head is non-zero");
        }

        // Re-derive the storage map, then check global disjointness.
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        self.audit_block_freelists(file_size, &mut ranges)?;
        self.audit_index_freelist(&table)?;
        self.audit_entry_storage(&table, file_size, &mut ranges)?;
        let capacity = table.array_size / INDEX_ENTRY_SIZE;
        for value in 1..capacity {
            let entry = self.index_entry(ArrayIndex(value))?;
            if entry.is_free() {
                continue;
            }
            self.audit_entry_storage(&entry, file_size, &mut ranges)?;
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return corrupt(format!(
                    "storage ranges overlap at offset {}",
                    pair[1].0
                ));
            }
        }
        Ok(())
    }

    fn audit_block_freelists(
        &self,
        file_size: u64,
        ranges: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        for class in BlockType::ALLOCATABLE {
            let block_size = class.size();
            let mut visited = HashSet::new();
            let mut offset = self.free_block_head(class)?;
            while offset != FREE_BLOCK_TAIL {
                if offset % block_size != 0 {
                    return corrupt(format!(
                        "free {class:?} block at {offset} is not aligned to its class"
                    ));
                }
                if !in_range(offset, block_size, file_size) {
                    return corrupt(format!("free {class:?} block at {offset} is out of range"));
                }
                if !visited.insert(offset) {
                    return corrupt(format!("loop in the {class:?} freelist at {offset}"));
                }
                ranges.push((offset, offset + block_size));
                offset = self.file.read_u64(offset)?;
            }
        }
        Ok(())
    }

    fn audit_index_freelist(&self, table: &IndexEntry) -> Result<()> {
        let capacity = table.array_size / INDEX_ENTRY_SIZE;
        let mut visited = HashSet::new();
        let mut index = self.free_index_head()?;
        while index.0 != FREE_INDEX_TAIL {
            if index.0 >= capacity {
                return corrupt(format!("index freelist reaches out-of-range slot {index}"));
            }
            if !visited.insert(index.0) {
                return corrupt(format!("loop in the index freelist at slot {index}"));
            }
            let entry = self.index_entry(index)?;
            if !entry.is_free() {
                return corrupt(format!("index freelist reaches live slot {index}"));
            }
            index = entry.next_free();
        }
        Ok(())
    }

    /// Record the byte ranges owned by one live entry, validating class
    /// alignment and, for tree-backed entries, the full hierarchy shape.
    fn audit_entry_storage(
        &self,
        entry: &IndexEntry,
        file_size: u64,
        ranges: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        let class = BlockType::for_size(entry.array_size);
        if class == BlockType::L8 {
            return Ok(());
        }
        if class < BlockType::L4096Plus {
            let block_size = class.size();
            if entry.payload % block_size != 0 {
                return corrupt(format!(
                    "live {class:?} block at {} is not aligned to its class",
                    entry.payload
                ));
            }
            if !in_range(entry.payload, block_size, file_size) {
                return corrupt(format!(
                    "live {class:?} block at {} is out of range",
                    entry.payload
                ));
            }
            ranges.push((entry.payload, entry.payload + block_size));
            return Ok(());
        }

        // Tree-backed: the depth and per-level populations are implied by
        // the size; walk the hierarchy and collect every node and leaf.
        let (counts, depth) = TreeCursor::level_counts(entry.array_size)?;
        debug_assert!(depth >= 1);
        let root_class = BlockType::for_size(counts[depth - 1] * CLUSTER_INDEX_SIZE);
        if entry.payload % root_class.size() != 0 {
            return corrupt(format!(
                "tree root at {} is not aligned to its {root_class:?} class",
                entry.payload
            ));
        }
        if !in_range(entry.payload, root_class.size(), file_size) {
            return corrupt(format!("tree root at {} is out of range", entry.payload));
        }
        ranges.push((entry.payload, entry.payload + root_class.size()));

        let mut parents = vec![entry.payload];
        for level in (0..depth).rev() {
            let child_count = counts[level];
            let mut children = Vec::with_capacity(child_count as usize);
            for (parent_index, &parent) in parents.iter().enumerate() {
                let first = parent_index as u64 * CLUSTER_INDEX_FANOUT;
                let slots = (child_count - first).min(CLUSTER_INDEX_FANOUT);
                for slot in 0..slots {
                    let child = self.file.read_u64(parent + slot * CLUSTER_INDEX_SIZE)?;
                    if child % CLUSTER_SIZE != 0 || child == 0 {
                        return corrupt(format!(
                            "tree node at {child} is not a valid cluster offset"
                        ));
                    }
                    if !in_range(child, CLUSTER_SIZE, file_size) {
                        return corrupt(format!("tree node at {child} is out of range"));
                    }
                    ranges.push((child, child + CLUSTER_SIZE));
                    children.push(child);
                }
            }
            if children.len() as u64 != child_count {
                return corrupt("tree level population disagrees with the array size");
            }
            parents = children;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{META_FILE_SIZE, META_FREE_CLUSTER_HEAD};
    use tempfile::TempDir;

    fn store_at(dir: &TempDir) -> Store {
        Store::create(dir.path().join("audit.dyn")).unwrap()
    }

    #[test]
    fn test_fresh_store_is_consistent() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir);
        assert!(store.load_and_check());
    }

    #[test]
    fn test_workload_stays_consistent() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        let mut handles = Vec::new();
        for step in 0..40u64 {
            let index = store.create_array().unwrap();
            store.set_array_size(index, step * 700).unwrap();
            handles.push(index);
        }
        for index in handles.iter().step_by(2) {
            store.destroy_array(*index).unwrap();
        }
        assert!(store.load_and_check());
    }

    #[test]
    fn test_bad_file_size_field_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        store.file.write_u64(META_FILE_SIZE, 12288).unwrap();
        assert!(!store.load_and_check());
    }

    #[test]
    fn test_reserved_cluster_head_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        store.file.write_u64(META_FREE_CLUSTER_HEAD, 4096).unwrap();
        assert!(!store.load_and_check());
    }

    #[test]
    fn test_misaligned_freelist_block_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        store.set_free_block_head(BlockType::L64, 1025).unwrap();
        assert!(!store.load_and_check());
    }

    #[test]
    fn test_freelist_loop_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        // Point the first free L16 block back at itself.
        let head = store.free_block_head(BlockType::L16).unwrap();
        store.file.write_u64(head, head).unwrap();
        assert!(!store.load_and_check());
    }

    #[test]
    fn test_double_ownership_detected() {
        let dir = TempDir::new().unwrap();
        let mut store = store_at(&dir);
        let first = store.create_array().unwrap();
        let second = store.create_array().unwrap();
        store.set_array_size(first, 200).unwrap();
        store.set_array_size(second, 200).unwrap();
        // Alias the second entry onto the first one's block.
        let stolen = store.index_entry(first).unwrap();
        store.set_index_entry(second, stolen).unwrap();
        assert!(!store.load_and_check());
    }

    #[test]
    fn test_corrupt_file_refused_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.dyn");
        {
            let mut store = Store::create(&path).unwrap();
            store.file.write_u64(META_FILE_SIZE, 0).unwrap();
            store.sync().unwrap();
        }
        assert!(matches!(
            Store::create(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
