//! Size-classed block allocator.
//!
//! Each class `L16..=L4096` keeps an intrusive freelist threaded through the
//! first eight bytes of every free block, headed by a slot in the static
//! header. An empty list is refilled by appending one cluster to the file
//! and carving it into blocks of the requested class.

use crate::error::Result;
use crate::layout::{BlockType, CLUSTER_SIZE, FREE_BLOCK_TAIL};
use crate::store::Store;
use tracing::debug;

impl Store {
    /// Append one cluster to the file; returns the new cluster's offset.
    pub(crate) fn extend_file_by_one_cluster(&mut self) -> Result<u64> {
        let old_size = self.file_size_field()?;
        self.set_size(old_size + CLUSTER_SIZE)?;
        debug!(file_size = old_size + CLUSTER_SIZE, "extended store file");
        Ok(old_size)
    }

    /// Thread `[begin, end)` of the cluster at `cluster_offset` onto the
    /// class freelist as free blocks.
    ///
    /// Blocks are pushed in descending order so the list pops ascending:
    /// after this call the head is `cluster_offset + begin`.
    pub(crate) fn initialize_cluster_section(
        &mut self,
        class: BlockType,
        cluster_offset: u64,
        begin: u64,
        end: u64,
    ) -> Result<u64> {
        debug_assert!(class > BlockType::L8 && class < BlockType::L4096Plus);
        let block_size = class.size();
        debug_assert!(begin % block_size == 0 && end % block_size == 0 && begin < end);
        let mut next_free = self.free_block_head(class)?;
        let mut offset = end - block_size;
        loop {
            self.file.write_u64(cluster_offset + offset, next_free)?;
            next_free = cluster_offset + offset;
            if offset == begin {
                break;
            }
            offset -= block_size;
        }
        self.set_free_block_head(class, next_free)?;
        Ok(next_free)
    }

    /// Carve a whole fresh cluster into class-`class` free blocks.
    pub(crate) fn initialize_cluster(&mut self, class: BlockType, cluster_offset: u64) -> Result<u64> {
        self.initialize_cluster_section(class, cluster_offset, 0, CLUSTER_SIZE)
    }

    /// Pop a block of the given class, growing the file if the list is empty.
    /// The returned offset is aligned to the class's block size.
    pub(crate) fn allocate_block(&mut self, class: BlockType) -> Result<u64> {
        debug_assert!(class > BlockType::L8 && class < BlockType::L4096Plus);
        let mut head = self.free_block_head(class)?;
        if head == FREE_BLOCK_TAIL {
            let cluster_offset = self.extend_file_by_one_cluster()?;
            head = self.initialize_cluster(class, cluster_offset)?;
        }
        debug_assert_eq!(head % class.size(), 0);
        let next = self.file.read_u64(head)?;
        self.set_free_block_head(class, next)?;
        Ok(head)
    }

    /// Push `offset` back onto its class freelist.
    pub(crate) fn deallocate_block(&mut self, class: BlockType, offset: u64) -> Result<()> {
        debug_assert!(class > BlockType::L8 && class < BlockType::L4096Plus);
        debug_assert_eq!(offset % class.size(), 0);
        let head = self.free_block_head(class)?;
        self.file.write_u64(offset, head)?;
        self.set_free_block_head(class, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_store(dir: &TempDir) -> Store {
        Store::create(dir.path().join("alloc.dyn")).unwrap()
    }

    #[test]
    fn test_format_carves_cluster_zero() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        // The first free block of each carved class sits at its section start.
        assert_eq!(store.free_block_head(BlockType::L16).unwrap(), 256);
        assert_eq!(store.free_block_head(BlockType::L32).unwrap(), 512);
        assert_eq!(store.free_block_head(BlockType::L64).unwrap(), 1024);
        assert_eq!(store.free_block_head(BlockType::L128).unwrap(), 2048);
        assert_eq!(store.free_block_head(BlockType::L256).unwrap(), 3072);
        // Higher classes start empty.
        assert_eq!(store.free_block_head(BlockType::L512).unwrap(), 0);
        assert_eq!(store.free_block_head(BlockType::L4096).unwrap(), 0);
    }

    #[test]
    fn test_allocate_pops_ascending() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        assert_eq!(store.allocate_block(BlockType::L16).unwrap(), 256);
        assert_eq!(store.allocate_block(BlockType::L16).unwrap(), 272);
        assert_eq!(store.allocate_block(BlockType::L16).unwrap(), 288);
    }

    #[test]
    fn test_deallocate_is_lifo() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let a = store.allocate_block(BlockType::L64).unwrap();
        let b = store.allocate_block(BlockType::L64).unwrap();
        store.deallocate_block(BlockType::L64, a).unwrap();
        store.deallocate_block(BlockType::L64, b).unwrap();
        assert_eq!(store.allocate_block(BlockType::L64).unwrap(), b);
        assert_eq!(store.allocate_block(BlockType::L64).unwrap(), a);
    }

    #[test]
    fn test_empty_class_grows_file() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let before = store.file.len();
        let block = store.allocate_block(BlockType::L512).unwrap();
        assert_eq!(store.file.len(), before + CLUSTER_SIZE);
        assert_eq!(block, before);
        assert_eq!(block % 512, 0);
        // The rest of the carved cluster feeds subsequent allocations.
        for k in 1..8 {
            assert_eq!(
                store.allocate_block(BlockType::L512).unwrap(),
                before + k * 512
            );
        }
        assert_eq!(store.file.len(), before + CLUSTER_SIZE);
    }

    #[test]
    fn test_exhausting_carved_blocks_grows_again() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        // Cluster 0 donates four L256 blocks.
        for _ in 0..4 {
            store.allocate_block(BlockType::L256).unwrap();
        }
        let before = store.file.len();
        let block = store.allocate_block(BlockType::L256).unwrap();
        assert_eq!(store.file.len(), before + CLUSTER_SIZE);
        assert_eq!(block, before);
    }

    #[test]
    fn test_full_cluster_class() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let a = store.allocate_block(BlockType::L4096).unwrap();
        let b = store.allocate_block(BlockType::L4096).unwrap();
        assert_eq!(a % CLUSTER_SIZE, 0);
        assert_eq!(b % CLUSTER_SIZE, 0);
        assert_ne!(a, b);
        store.deallocate_block(BlockType::L4096, a).unwrap();
        assert_eq!(store.allocate_block(BlockType::L4096).unwrap(), a);
    }
}
