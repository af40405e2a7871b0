//! Consistent Block Encrypter (CBE).
//!
//! An encrypted, versioned, copy-on-write virtual block device. Logical
//! blocks are mapped through a hash tree of on-disk nodes, every sealed
//! generation is kept as an immutable snapshot, and physical blocks are
//! only recycled once no retained snapshot can still read them.
#![cfg_attr(not(feature = "std"), no_std)]
#![allow(dead_code, unused_imports)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;

extern crate alloc;

pub use self::error::{Errno, Error};
pub use self::layers::bio::{BlockId, BlockSet, Buf, BufMut, BufRef, MemDisk, BLOCK_SIZE};
pub use self::layers::disk::{
    CbeDisk, Config, Operation, Primitive, Request, RequestPool, Splitter, Tag,
};
pub use self::layers::free::{BlockState, ReclaimFence};
pub use self::layers::snapshot::{Snapshot, SnapshotDirectory};
pub use self::layers::superblock::{SuperBlock, SuperBlockRing, NUM_SUPER_BLOCKS};
pub use self::layers::tree::{
    AllocationNode, Digest, Generation, InnerNode, Pba, TreeShape, Vba, INVALID_GEN, INVALID_PBA,
    INVALID_VBA,
};
pub use self::os::{Rng, Skcipher, SkcipherIv, SkcipherKey};
pub use self::util::{RandomInit, Rng as _, Skcipher as _};
