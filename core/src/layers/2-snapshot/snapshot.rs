use crate::layers::tree::{Digest, Generation, InnerNode, Pba, INVALID_GEN, INVALID_PBA};
use crate::prelude::*;
use crate::util::codec::{get_u32, get_u64, put_u32, put_u64};

/// The id of an empty directory slot.
pub const INVALID_SNAPSHOT_ID: u32 = u32::MAX;

/// The snapshot is pinned against eviction.
pub const FLAG_KEEP: u32 = 1 << 0;

/// The size of an encoded snapshot.
///
/// ```text
/// +----------------+---------+---------+------------+-------------+---------+------------+
/// | digest: [u8;32]| pba: u64| gen: u64| leaves: u64| height: u32 | id: u32 | flags: u32 |
/// +----------------+---------+---------+------------+-------------+---------+------------+
/// 0                32        40        48           56            60        64           68
/// ```
pub const SNAPSHOT_SIZE: usize = 68;

/// An immutable, committed root of the virtual block tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub digest: Digest,
    pub pba: Pba,
    pub gen: Generation,
    pub leaves: u64,
    pub height: u32,
    pub id: u32,
    pub flags: u32,
}

impl Snapshot {
    pub const fn invalid() -> Self {
        Self {
            digest: Digest::zeroed(),
            pba: INVALID_PBA,
            gen: INVALID_GEN,
            leaves: 0,
            height: 0,
            id: INVALID_SNAPSHOT_ID,
            flags: 0,
        }
    }

    /// Creates a snapshot of the tree below `root`.
    pub fn new(root: &InnerNode, leaves: u64, height: u32, id: u32) -> Self {
        Self {
            digest: root.digest,
            pba: root.pba,
            gen: root.gen,
            leaves,
            height,
            id,
            flags: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id != INVALID_SNAPSHOT_ID
    }

    pub fn keep(&self) -> bool {
        self.flags & FLAG_KEEP != 0
    }

    pub fn set_keep(&mut self, keep: bool) {
        if keep {
            self.flags |= FLAG_KEEP;
        } else {
            self.flags &= !FLAG_KEEP;
        }
    }

    /// Returns the pointer to the root block.
    pub fn root(&self) -> InnerNode {
        InnerNode {
            pba: self.pba,
            gen: self.gen,
            digest: self.digest,
        }
    }

    /// Invalidates the snapshot.
    pub fn discard(&mut self) {
        *self = Self::invalid();
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..32].copy_from_slice(self.digest.as_bytes());
        put_u64(buf, 32, self.pba);
        put_u64(buf, 40, self.gen);
        put_u64(buf, 48, self.leaves);
        put_u32(buf, 56, self.height);
        put_u32(buf, 60, self.id);
        put_u32(buf, 64, self.flags);
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            digest: Digest::from_bytes(&buf[..32]),
            pba: get_u64(buf, 32),
            gen: get_u64(buf, 40),
            leaves: get_u64(buf, 48),
            height: get_u32(buf, 56),
            id: get_u32(buf, 60),
            flags: get_u32(buf, 64),
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::invalid()
    }
}
