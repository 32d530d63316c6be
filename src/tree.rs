//! Cluster-index tree cursor for arrays larger than one cluster.
//!
//! Data lives in full-cluster leaves located through a balanced tree of
//! cluster-index nodes. Levels count up from the leaves: level 0 is the
//! leaves themselves, each higher level indexes the one below, and the root
//! block (`entry.payload`) sits above the top stack level. Internal nodes
//! below the root are always full clusters; the root is sized to the
//! smallest block class that holds one pointer per top-level node.

use crate::error::{Result, StoreError};
use crate::io::StoreFile;
use crate::layout::{
    cluster_count, BlockType, IndexEntry, CLUSTER_INDEX_FANOUT, CLUSTER_INDEX_SIZE, CLUSTER_SIZE,
    MAX_TREE_DEPTH,
};
use crate::store::Store;

const CLUSTER_SHIFT: u32 = 12;
const FANOUT_SHIFT: u32 = 9;

#[derive(Debug, Clone, Copy, Default)]
struct Level {
    /// Live nodes at this level.
    node_count: u64,
    /// Logical index of the cached node; `u64::MAX` until the first seek.
    current_index: u64,
    /// File offset of the cached node.
    current_offset: u64,
}

impl Level {
    fn fresh(node_count: u64) -> Self {
        Level {
            node_count,
            current_index: u64::MAX,
            current_offset: 0,
        }
    }
}

/// Mutable cursor over one tree-backed array.
///
/// Holds a private copy of the entry; callers persist it (the root offset and
/// size change under grow/shrink) via [`into_entry`](Self::into_entry).
pub(crate) struct TreeCursor {
    entry: IndexEntry,
    levels: [Level; MAX_TREE_DEPTH],
    depth: usize,
    /// Offset in the array of the current leaf; `u64::MAX` before a seek.
    pos: u64,
}

impl TreeCursor {
    pub(crate) fn new(entry: IndexEntry) -> Result<Self> {
        debug_assert!(entry.array_size >= CLUSTER_SIZE);
        let (counts, depth) = Self::level_counts(entry.array_size)?;
        let mut levels = [Level::default(); MAX_TREE_DEPTH];
        for (level, slot) in levels.iter_mut().enumerate().take(depth) {
            *slot = Level::fresh(counts[level]);
        }
        Ok(TreeCursor {
            entry,
            levels,
            depth,
            pos: u64::MAX,
        })
    }

    /// Per-level node counts for an array of `size` bytes, bottom-up, and the
    /// number of levels below the root. A single-cluster array has depth 0.
    pub(crate) fn level_counts(size: u64) -> Result<([u64; MAX_TREE_DEPTH], usize)> {
        let mut counts = [1u64; MAX_TREE_DEPTH];
        let mut depth = 0;
        let mut count = cluster_count(size);
        while count > 1 {
            if depth == MAX_TREE_DEPTH {
                return Err(StoreError::Corrupt(format!(
                    "array size {size} exceeds the maximum cluster hierarchy depth"
                )));
            }
            counts[depth] = count;
            depth += 1;
            count = cluster_count(count * CLUSTER_INDEX_SIZE);
        }
        Ok((counts, depth))
    }

    pub(crate) fn into_entry(self) -> IndexEntry {
        self.entry
    }

    /// File offset of the leaf the cursor currently points at.
    pub(crate) fn current_cluster_offset(&self) -> u64 {
        if self.depth == 0 {
            // Single-leaf shape: the root is the leaf.
            self.entry.payload
        } else {
            self.levels[0].current_offset
        }
    }

    fn logic_index(offset_in_array: u64, level: usize) -> u64 {
        offset_in_array >> (CLUSTER_SHIFT + FANOUT_SHIFT * level as u32)
    }

    /// Position the cursor on the leaf containing `offset_in_array`.
    ///
    /// First pass walks bottom-up updating each level's cached logical index
    /// until one is already current; second pass refreshes node offsets
    /// top-down from the first unchanged level.
    pub(crate) fn seek_to_cluster(&mut self, file: &StoreFile, offset_in_array: u64) -> Result<()> {
        debug_assert_eq!(offset_in_array % CLUSTER_SIZE, 0);
        debug_assert!(offset_in_array < self.entry.array_size);
        let mut changed = 0;
        for level in 0..self.depth {
            let index = Self::logic_index(offset_in_array, level);
            debug_assert!(index < self.levels[level].node_count);
            if self.levels[level].current_index == index {
                break;
            }
            self.levels[level].current_index = index;
            changed = level + 1;
        }
        let mut parent = if changed == self.depth {
            self.entry.payload
        } else {
            self.levels[changed].current_offset
        };
        for level in (0..changed).rev() {
            let slot = self.levels[level].current_index % CLUSTER_INDEX_FANOUT;
            let child = file.read_u64(parent + slot * CLUSTER_INDEX_SIZE)?;
            self.levels[level].current_offset = child;
            parent = child;
        }
        self.pos = offset_in_array;
        Ok(())
    }

    pub(crate) fn goto_next_cluster(&mut self, file: &StoreFile) -> Result<()> {
        debug_assert_ne!(self.pos, u64::MAX);
        self.seek_to_cluster(file, self.pos + CLUSTER_SIZE)
    }

    /// File offset of the node with logical index `index` at `level`, where
    /// `level == depth` names the root. Walks down from the root; the tree is
    /// at most [`MAX_TREE_DEPTH`] deep so the recursion is bounded.
    fn node_offset(&self, file: &StoreFile, level: usize, index: u64) -> Result<u64> {
        if level == self.depth {
            debug_assert_eq!(index, 0);
            return Ok(self.entry.payload);
        }
        let parent = self.node_offset(file, level + 1, index >> FANOUT_SHIFT)?;
        file.read_u64(parent + (index % CLUSTER_INDEX_FANOUT) * CLUSTER_INDEX_SIZE)
    }

    fn invalidate_position(&mut self) {
        for level in self.levels.iter_mut() {
            level.current_index = u64::MAX;
            level.current_offset = 0;
        }
        self.pos = u64::MAX;
    }

    /// Reallocate the root block from class `from` to `to`, copying
    /// `copy_len` bytes of pointers.
    fn reallocate_root(
        &mut self,
        store: &mut Store,
        from: BlockType,
        to: BlockType,
        copy_len: u64,
    ) -> Result<()> {
        let new_root = store.allocate_block(to)?;
        store.file.move_data(self.entry.payload, new_root, copy_len)?;
        store.deallocate_block(from, self.entry.payload)?;
        self.entry.payload = new_root;
        Ok(())
    }

    /// Grow the tree to hold `new_size` bytes.
    ///
    /// Reshapes first (root reclass at equal depth, or a chain of new
    /// single-child levels when the tree deepens), then extends each level's
    /// node population top-down.
    pub(crate) fn expand_to_size(&mut self, store: &mut Store, new_size: u64) -> Result<()> {
        debug_assert!(new_size > self.entry.array_size);
        let (new_counts, new_depth) = Self::level_counts(new_size)?;
        let old_depth = self.depth;
        if new_depth < old_depth {
            return Err(StoreError::Corrupt(
                "cluster tree would lose levels while growing".into(),
            ));
        }
        if new_depth == old_depth {
            debug_assert!(old_depth > 0);
            let old_root_bytes = self.levels[old_depth - 1].node_count * CLUSTER_INDEX_SIZE;
            let new_root_bytes = new_counts[new_depth - 1] * CLUSTER_INDEX_SIZE;
            let old_class = BlockType::for_size(old_root_bytes);
            let new_class = BlockType::for_size(new_root_bytes);
            debug_assert!(new_class >= old_class && new_class < BlockType::L4096Plus);
            if old_class != new_class {
                self.reallocate_root(store, old_class, new_class, old_root_bytes)?;
            }
        } else {
            // The old root is demoted to an internal node, so it must become
            // a full cluster first. With depth 0 it already is one (the leaf).
            if old_depth > 0 {
                let old_root_bytes = self.levels[old_depth - 1].node_count * CLUSTER_INDEX_SIZE;
                let old_class = BlockType::for_size(old_root_bytes);
                if old_class != BlockType::L4096 {
                    self.reallocate_root(store, old_class, BlockType::L4096, old_root_bytes)?;
                }
            }
            // The demoted root is now the sole node of level `old_depth`.
            let mut prev_root = self.entry.payload;
            self.levels[old_depth] = Level::fresh(1);
            // Chain single-child full-cluster nodes up to just below the top.
            for level in (old_depth + 1)..new_depth {
                let node = store.allocate_block(BlockType::L4096)?;
                store.file.write_u64(node, prev_root)?;
                prev_root = node;
                self.levels[level] = Level::fresh(1);
            }
            // New root, sized for the final top-level population.
            let top_bytes = new_counts[new_depth - 1] * CLUSTER_INDEX_SIZE;
            let top_class = BlockType::for_size(top_bytes);
            debug_assert!(top_class > BlockType::L8 && top_class < BlockType::L4096Plus);
            let root = store.allocate_block(top_class)?;
            store.file.write_u64(root, prev_root)?;
            self.entry.payload = root;
            self.depth = new_depth;
        }
        // Populate every level top-down; parents are complete before their
        // children are attached.
        for level in (0..new_depth).rev() {
            let old_count = self.levels[level].node_count;
            for index in old_count..new_counts[level] {
                let node = store.allocate_block(BlockType::L4096)?;
                let parent = self.node_offset(&store.file, level + 1, index >> FANOUT_SHIFT)?;
                store
                    .file
                    .write_u64(parent + (index % CLUSTER_INDEX_FANOUT) * CLUSTER_INDEX_SIZE, node)?;
            }
            self.levels[level].node_count = new_counts[level];
        }
        self.entry.array_size = new_size;
        self.invalidate_position();
        Ok(())
    }

    /// Shrink the tree to hold `new_size` bytes (at least one cluster).
    ///
    /// Frees surplus nodes leaf-level upward, collapses single-child roots,
    /// and downsizes the root block to the class that fits what remains. At
    /// `new_size == CLUSTER_SIZE` the sole leaf becomes the root and the
    /// caller reclasses the entry to a plain block.
    pub(crate) fn shrink_to_size(&mut self, store: &mut Store, new_size: u64) -> Result<()> {
        debug_assert!(new_size >= CLUSTER_SIZE && new_size < self.entry.array_size);
        let (new_counts, new_depth) = Self::level_counts(new_size)?;
        debug_assert!(new_depth <= self.depth);
        let mut root_class = if self.depth > 0 {
            BlockType::for_size(self.levels[self.depth - 1].node_count * CLUSTER_INDEX_SIZE)
        } else {
            BlockType::L4096
        };
        // Free surplus children bottom-up; parents stay intact until their
        // own level is trimmed, so offsets remain resolvable.
        for level in 0..self.depth {
            let target = if level < new_depth { new_counts[level] } else { 1 };
            for index in target..self.levels[level].node_count {
                let node = self.node_offset(&store.file, level, index)?;
                store.deallocate_block(BlockType::L4096, node)?;
            }
            self.levels[level].node_count = target;
        }
        // Collapse levels whose root holds a single child.
        while self.depth > new_depth {
            let child = store.file.read_u64(self.entry.payload)?;
            store.deallocate_block(root_class, self.entry.payload)?;
            self.entry.payload = child;
            self.depth -= 1;
            // The promoted child was an internal node (or the sole leaf).
            root_class = BlockType::L4096;
        }
        if new_depth > 0 {
            let new_root_bytes = new_counts[new_depth - 1] * CLUSTER_INDEX_SIZE;
            let new_class = BlockType::for_size(new_root_bytes);
            if new_class != root_class {
                self.reallocate_root(store, root_class, new_class, new_root_bytes)?;
            }
        }
        self.entry.array_size = new_size;
        self.invalidate_position();
        Ok(())
    }
}
