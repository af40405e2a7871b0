//! The layer of free-space management.
//!
//! Every physical block of the device has an `AllocationNode` in the free
//! tree that records where it is in its lifecycle. A block vacated by a
//! copy-on-write at generation `g` only returns to the allocator once every
//! snapshot that could still read it has been discarded.
mod free_tree;
mod lifecycle;

pub use self::free_tree::FreeTree;
pub use self::lifecycle::{BlockState, ReclaimFence};
