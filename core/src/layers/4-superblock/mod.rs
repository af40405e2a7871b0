//! The layer of the superblock ring.
mod ring;
mod superblock;

pub use self::ring::{SuperBlockRing, NUM_SUPER_BLOCKS};
pub use self::superblock::{FreeTreeRoot, KeyMaterial, SuperBlock, KEY_SIZE, NUM_KEYS};
