//! The layer of hash trees.
//!
//! Both the virtual block tree and the free tree are built from the same
//! parts: `TreeShape` addresses a leaf, `InnerNode`/`AllocationNode` are the
//! on-disk entries, `NodeStore` moves verified blocks between memory and disk,
//! and `CowTree` keeps the dirty part of a tree until write-back.
mod cache;
mod cow;
mod node;
mod shape;
mod store;
mod walk;

pub use self::cache::NodeCache;
pub use self::cow::CowTree;
pub use self::node::{
    AllocationNode, Digest, InnerNode, NodeBlock, NodeCodec, DIGEST_SIZE, ENTRIES_PER_BLOCK,
    INVALID_KEY_ID,
};
pub use self::shape::{TreeShape, MAX_TREE_HEIGHT};
pub use self::store::{BlockCipher, NodeStore};
pub use self::walk::{descend, translate};

/// Physical block address.
pub type Pba = u64;
/// Virtual block address.
pub type Vba = u64;
/// Generation of a committed state.
pub type Generation = u64;

pub const INVALID_PBA: Pba = u64::MAX;
pub const INVALID_VBA: Vba = u64::MAX;
pub const INVALID_GEN: Generation = u64::MAX;
