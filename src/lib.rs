//! DynamicStore: a single-file persistent storage engine.
//!
//! A [`Store`] manages a flat collection of dynamically-resizable byte
//! arrays, each addressed by a small integer handle ([`ArrayIndex`]). The
//! engine owns its on-disk space: the backing file is a sequence of 4 KiB
//! clusters, clusters are subdivided into power-of-two blocks threaded onto
//! per-class freelists, and an array transparently migrates between storage
//! classes as it is resized.
//!
//! ## Storage classes
//!
//! - up to 8 bytes: inline in the array's index entry;
//! - up to one cluster: a single block of the smallest fitting class;
//! - beyond one cluster: full-cluster leaves located through a balanced
//!   cluster-index tree.
//!
//! The index table that maps handles to entries is itself an ordinary array
//! stored through the same machinery, bootstrapped from a descriptor in the
//! static header at cluster 0.
//!
//! ## File layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Cluster 0: static header (256 bytes)        │
//! │  - file size, index table entry             │
//! │  - freelist heads, user metadata            │
//! │  - remainder carved into L16..L256 blocks   │
//! ├─────────────────────────────────────────────┤
//! │ Cluster 1+: data leaves, cluster-index      │
//! │ nodes, or block-subdivided clusters         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! There is no allocation bitmap; the freelists are the allocator's
//! authoritative state, and a structural audit re-derives the full storage
//! map whenever an existing file is opened.
//!
//! ## Example
//!
//! ```no_run
//! use dynstore::Store;
//!
//! # fn main() -> dynstore::Result<()> {
//! let mut store = Store::create("data.dyn")?;
//! let handle = store.create_array()?;
//! store.set_array_size(handle, 16)?;
//! store.write_array(handle, 0, b"hello, clusters!")?;
//! let mut buf = [0u8; 16];
//! store.read_array(handle, 0, &mut buf)?;
//! # Ok(())
//! # }
//! ```
//!
//! The engine is single-threaded: all mutation goes through `&mut Store`,
//! and exclusive access to the backing file is assumed for the lifetime of
//! the handle.

pub mod error;
pub mod io;
pub mod layout;
pub mod store;

mod alloc;
mod check;
mod index;
mod meta;
mod resize;
mod tree;

pub use error::{Result, StoreError};
pub use layout::{ArrayIndex, BlockType, CLUSTER_SIZE, MAX_USER_METADATA_SIZE};
pub use store::Store;
