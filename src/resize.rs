//! The resize state machine.
//!
//! Moves an array's payload between its three representations — inline in
//! the entry, a single freelist block, a cluster-index tree — as its size
//! crosses class boundaries. Transitions normalise downward first (a tree
//! shrinks to its sole leaf before reclassing), then reclass, then grow back
//! up, so each resize allocates at most one block per class boundary and the
//! tree path only ever starts from the one-leaf shape.

use crate::error::Result;
use crate::layout::{cluster_count, BlockType, IndexEntry, CLUSTER_SIZE, FREE_ENTRY_ARRAY_SIZE};
use crate::store::Store;
use crate::tree::TreeCursor;

impl Store {
    /// Resize a tree-backed entry, or one holding exactly one full cluster,
    /// to `new_size` (still at least one cluster's worth).
    pub(crate) fn resize_tree_entry(
        &mut self,
        entry: IndexEntry,
        new_size: u64,
    ) -> Result<IndexEntry> {
        if cluster_count(entry.array_size) == cluster_count(new_size) {
            let mut entry = entry;
            entry.array_size = new_size;
            return Ok(entry);
        }
        let mut cursor = TreeCursor::new(entry)?;
        if new_size > entry.array_size {
            cursor.expand_to_size(self, new_size)?;
        } else {
            cursor.shrink_to_size(self, new_size)?;
        }
        Ok(cursor.into_entry())
    }

    /// Move `entry` to `new_size`, migrating the payload across storage
    /// classes as needed. Returns the updated entry; the caller persists it.
    pub(crate) fn resize_entry(&mut self, entry: IndexEntry, new_size: u64) -> Result<IndexEntry> {
        let mut entry = entry;
        let old_size = entry.array_size;
        debug_assert_ne!(old_size, FREE_ENTRY_ARRAY_SIZE);
        debug_assert_ne!(new_size, FREE_ENTRY_ARRAY_SIZE);

        let old_class = BlockType::for_size(old_size);
        let new_class = BlockType::for_size(new_size);

        if old_class == new_class {
            if old_class != BlockType::L4096Plus {
                entry.array_size = new_size;
                return Ok(entry);
            }
            return self.resize_tree_entry(entry, new_size);
        }

        let mut from_class = old_class;
        let mut to_class = new_class;

        // Normalise a tree down to its sole leaf so the transition below
        // only ever sees plain blocks.
        if old_class == BlockType::L4096Plus {
            entry = self.resize_tree_entry(entry, CLUSTER_SIZE)?;
            from_class = BlockType::L4096;
        }
        if new_class == BlockType::L4096Plus {
            to_class = BlockType::L4096;
        }

        if from_class != to_class {
            if to_class == BlockType::L8 {
                // Shrinking into the entry itself.
                let data = self.file.read_u64(entry.payload)?;
                self.deallocate_block(from_class, entry.payload)?;
                entry.payload = data;
            } else {
                let destination = self.allocate_block(to_class)?;
                if from_class == BlockType::L8 {
                    self.file.write_u64(destination, entry.payload)?;
                } else {
                    self.file
                        .move_data(entry.payload, destination, old_size.min(new_size))?;
                    self.deallocate_block(from_class, entry.payload)?;
                }
                entry.payload = destination;
            }
        }

        if new_class == BlockType::L4096Plus {
            // The entry now owns exactly one full cluster; grow the tree
            // from that shape.
            entry.array_size = CLUSTER_SIZE;
            self.resize_tree_entry(entry, new_size)
        } else {
            entry.array_size = new_size;
            Ok(entry)
        }
    }
}
