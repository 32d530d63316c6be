//! On-disk layout: cluster geometry, block size classes, index entries and
//! the static header at cluster 0.
//!
//! All on-disk integers are unsigned 64-bit little-endian. Encoding happens
//! explicitly at the backing-file boundary; nothing is cast in place.

/// Unit of file growth. Cluster 0 holds the static header.
pub const CLUSTER_SIZE: u64 = 4096;

/// Size of one [`IndexEntry`] on disk.
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// Size of one child pointer in a cluster-index node.
pub const CLUSTER_INDEX_SIZE: u64 = 8;

/// Child pointers held by a full-cluster tree node.
pub const CLUSTER_INDEX_FANOUT: u64 = CLUSTER_SIZE / CLUSTER_INDEX_SIZE;

/// Deepest cluster-index hierarchy ever built (covers 512^6 * 4096 bytes).
pub const MAX_TREE_DEPTH: usize = 6;

/// Terminates every block freelist.
pub const FREE_BLOCK_TAIL: u64 = 0;

/// Terminates the index freelist. Index 0 is never a valid handle.
pub const FREE_INDEX_TAIL: u64 = 0;

/// `array_size` marker for an index slot that sits on the freelist.
pub const FREE_ENTRY_ARRAY_SIZE: u64 = u64::MAX;

/// Bytes of cluster 0 reserved for the static header; the rest is carved
/// into blocks when the file is formatted.
pub const STATIC_METADATA_SIZE: u64 = 256;

/// Capacity of the user metadata region inside the static header.
pub const MAX_USER_METADATA_SIZE: u64 = 128;

// Field offsets inside cluster 0.
pub const META_FILE_SIZE: u64 = 0;
pub const META_INDEX_TABLE_ENTRY: u64 = 8;
pub const META_FREE_INDEX_HEAD: u64 = 24;
pub const META_FREE_BLOCK_HEADS: u64 = 32;
pub const META_FREE_CLUSTER_HEAD: u64 = 104;
pub const META_USER_METADATA_SIZE: u64 = 112;
pub const META_USER_METADATA: u64 = 128;

/// Block sizes per class; the last entry is the open-ended tree class.
pub const BLOCK_SIZE_TABLE: [u64; 11] =
    [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, u64::MAX];

/// Storage class of an array, determined by its logical size.
///
/// `L8` arrays live inline in their index entry. `L16` through `L4096` occupy
/// one freelist-managed block. `L4096Plus` arrays span multiple clusters
/// located through a cluster-index tree.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockType {
    L8 = 0,
    L16,
    L32,
    L64,
    L128,
    L256,
    L512,
    L1024,
    L2048,
    L4096,
    L4096Plus,
}

impl BlockType {
    /// Classes backed by a block freelist, smallest first.
    pub const ALLOCATABLE: [BlockType; 9] = [
        BlockType::L16,
        BlockType::L32,
        BlockType::L64,
        BlockType::L128,
        BlockType::L256,
        BlockType::L512,
        BlockType::L1024,
        BlockType::L2048,
        BlockType::L4096,
    ];

    /// Smallest class whose block holds `size` bytes. Zero-sized arrays are
    /// inline; anything over one cluster is tree-backed.
    pub fn for_size(size: u64) -> BlockType {
        if size <= 8 {
            return BlockType::L8;
        }
        for class in Self::ALLOCATABLE {
            if size <= class.size() {
                return class;
            }
        }
        BlockType::L4096Plus
    }

    /// Block size in bytes; `u64::MAX` for the open-ended tree class.
    pub fn size(self) -> u64 {
        BLOCK_SIZE_TABLE[self as usize]
    }

    /// Cluster-0 offset of this class's freelist head.
    pub fn freelist_head_offset(self) -> u64 {
        debug_assert!(self > BlockType::L8 && self < BlockType::L4096Plus);
        META_FREE_BLOCK_HEADS + (self as u64 - 1) * 8
    }
}

/// Rounds a file offset down to its cluster boundary.
pub fn cluster_align_down(offset: u64) -> u64 {
    offset & !(CLUSTER_SIZE - 1)
}

/// Offset within the containing cluster.
pub fn offset_in_cluster(offset: u64) -> u64 {
    offset & (CLUSTER_SIZE - 1)
}

/// Number of clusters needed to hold `size` bytes.
pub fn cluster_count(size: u64) -> u64 {
    (size + CLUSTER_SIZE - 1) / CLUSTER_SIZE
}

/// Handle to one stored array. Zero is the freelist tail sentinel and never
/// identifies a live array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayIndex(pub u64);

impl std::fmt::Display for ArrayIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-array descriptor kept in the index table (16 bytes on disk).
///
/// `payload` is a union in spirit: inline data when the array fits in eight
/// bytes, the block or tree-root offset for larger arrays, and the next-free
/// link while the slot sits on the index freelist
/// (`array_size == FREE_ENTRY_ARRAY_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub array_size: u64,
    pub payload: u64,
}

impl IndexEntry {
    /// A freshly allocated zero-sized array.
    pub fn empty() -> Self {
        IndexEntry {
            array_size: 0,
            payload: 0,
        }
    }

    /// A slot threaded onto the index freelist.
    pub fn free_slot(next: ArrayIndex) -> Self {
        IndexEntry {
            array_size: FREE_ENTRY_ARRAY_SIZE,
            payload: next.0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.array_size == FREE_ENTRY_ARRAY_SIZE
    }

    /// Next-free link; meaningful only while [`is_free`](Self::is_free).
    pub fn next_free(&self) -> ArrayIndex {
        ArrayIndex(self.payload)
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.array_size.to_le_bytes());
        bytes[8..].copy_from_slice(&self.payload.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; 16]) -> Self {
        let mut array_size = [0u8; 8];
        let mut payload = [0u8; 8];
        array_size.copy_from_slice(&bytes[..8]);
        payload.copy_from_slice(&bytes[8..]);
        IndexEntry {
            array_size: u64::from_le_bytes(array_size),
            payload: u64::from_le_bytes(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_for_size() {
        assert_eq!(BlockType::for_size(0), BlockType::L8);
        assert_eq!(BlockType::for_size(1), BlockType::L8);
        assert_eq!(BlockType::for_size(8), BlockType::L8);
        assert_eq!(BlockType::for_size(9), BlockType::L16);
        assert_eq!(BlockType::for_size(16), BlockType::L16);
        assert_eq!(BlockType::for_size(17), BlockType::L32);
        assert_eq!(BlockType::for_size(1000), BlockType::L1024);
        assert_eq!(BlockType::for_size(4096), BlockType::L4096);
        assert_eq!(BlockType::for_size(4097), BlockType::L4096Plus);
        assert_eq!(BlockType::for_size(1 << 40), BlockType::L4096Plus);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(BlockType::L8.size(), 8);
        assert_eq!(BlockType::L256.size(), 256);
        assert_eq!(BlockType::L4096.size(), 4096);
        assert_eq!(BlockType::L4096Plus.size(), u64::MAX);
    }

    #[test]
    fn test_freelist_head_offsets() {
        assert_eq!(BlockType::L16.freelist_head_offset(), META_FREE_BLOCK_HEADS);
        assert_eq!(
            BlockType::L4096.freelist_head_offset(),
            META_FREE_BLOCK_HEADS + 8 * 8
        );
        // The L4096 head is the last slot before the reserved cluster head.
        assert_eq!(
            BlockType::L4096.freelist_head_offset() + 8,
            META_FREE_CLUSTER_HEAD
        );
    }

    #[test]
    fn test_cluster_helpers() {
        assert_eq!(cluster_align_down(0), 0);
        assert_eq!(cluster_align_down(4095), 0);
        assert_eq!(cluster_align_down(4096), 4096);
        assert_eq!(cluster_align_down(12345), 8192);
        assert_eq!(offset_in_cluster(12345), 12345 - 8192);
        assert_eq!(cluster_count(0), 0);
        assert_eq!(cluster_count(1), 1);
        assert_eq!(cluster_count(4096), 1);
        assert_eq!(cluster_count(4097), 2);
    }

    #[test]
    fn test_index_entry_round_trip() {
        let entry = IndexEntry {
            array_size: 40960,
            payload: 0xDEAD_BEEF,
        };
        assert_eq!(IndexEntry::decode(entry.encode()), entry);
    }

    #[test]
    fn test_index_entry_free_slot() {
        let entry = IndexEntry::free_slot(ArrayIndex(7));
        assert!(entry.is_free());
        assert_eq!(entry.next_free(), ArrayIndex(7));
        assert!(!IndexEntry::empty().is_free());
    }

    #[test]
    fn test_entry_encoding_is_little_endian() {
        let entry = IndexEntry {
            array_size: 0x0102_0304_0506_0708,
            payload: 0,
        };
        let bytes = entry.encode();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[7], 0x01);
    }
}
