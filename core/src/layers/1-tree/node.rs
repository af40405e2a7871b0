//! Tree node formats.
//!
//! A node block is an array of fixed-size entries. Each entry is encoded
//! field by field at fixed little-endian offsets and padded to a slot whose
//! size is the next power of two of the encoded size, so the fan-out of a
//! block follows from the concrete record sizes.
//!
//! ```text
//! InnerNode (48 bytes, 64-byte slot)
//! +---------+---------+----------------+
//! | pba: u64| gen: u64| digest: [u8;32]|
//! +---------+---------+----------------+
//! 0         8         16               48
//!
//! AllocationNode (37 bytes, 64-byte slot)
//! +---------+--------------+---------------+--------------+------------------+---------------+
//! | pba: u64| last_vba: u64| alloc_gen: u64| free_gen: u64| last_key_id: u32 | reserved: u8  |
//! +---------+--------------+---------------+--------------+------------------+---------------+
//! 0         8              16              24             32                 36              37
//! ```
use super::{Generation, Pba, Vba, INVALID_GEN, INVALID_PBA, INVALID_VBA};
use crate::os::sha256;
use crate::prelude::*;
use crate::util::codec::{get_u32, get_u64, put_u32, put_u64};

use core::ops::{Index, IndexMut};
use static_assertions::const_assert;

/// The size of a digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// The key id of a block that was never encrypted.
pub const INVALID_KEY_ID: u32 = u32::MAX;

/// The number of entries a node block holds, whatever its node type.
pub const ENTRIES_PER_BLOCK: usize = {
    let inner = <InnerNode as NodeCodec>::ENTRIES_PER_BLOCK;
    let alloc = <AllocationNode as NodeCodec>::ENTRIES_PER_BLOCK;
    if inner < alloc {
        inner
    } else {
        alloc
    }
};

const_assert!(<InnerNode as NodeCodec>::ENCODED_SIZE <= 64);
const_assert!(<AllocationNode as NodeCodec>::ENCODED_SIZE <= 64);
const_assert!(ENTRIES_PER_BLOCK == BLOCK_SIZE / 64);

/// SHA-256 digest of the plain content of a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Computes the digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(sha256(data))
    }

    pub const fn zeroed() -> Self {
        Self([0u8; DIGEST_SIZE])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&bytes[..DIGEST_SIZE]);
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks `data` against this digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if Self::of(data) != *self {
            return_errno_with_msg!(DigestMismatch, "block content does not match its digest");
        }
        Ok(())
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// A fixed-size record that can be stored as an entry of a node block.
pub trait NodeCodec: Clone + Debug {
    /// The number of bytes the encoded fields occupy.
    const ENCODED_SIZE: usize;
    /// The size of the slot one entry occupies in a block.
    const SLOT_SIZE: usize = Self::ENCODED_SIZE.next_power_of_two();
    /// The number of entries in one block.
    const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / Self::SLOT_SIZE;

    /// The entry of a block that has never been written.
    fn empty() -> Self;

    /// Encodes the entry into the first `ENCODED_SIZE` bytes of `buf`.
    fn encode(&self, buf: &mut [u8]);

    /// Decodes an entry from the first `ENCODED_SIZE` bytes of `buf`.
    fn decode(buf: &[u8]) -> Self;
}

/// A pointer from a node to a child block, authenticated by the child's digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InnerNode {
    pub pba: Pba,
    pub gen: Generation,
    pub digest: Digest,
}

impl InnerNode {
    pub const fn invalid() -> Self {
        Self {
            pba: INVALID_PBA,
            gen: INVALID_GEN,
            digest: Digest::zeroed(),
        }
    }

    /// Whether the node points at a block.
    pub fn is_valid(&self) -> bool {
        self.pba != INVALID_PBA
    }
}

impl Default for InnerNode {
    fn default() -> Self {
        Self::invalid()
    }
}

impl NodeCodec for InnerNode {
    const ENCODED_SIZE: usize = 48;

    fn empty() -> Self {
        Self::invalid()
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.pba);
        put_u64(buf, 8, self.gen);
        buf[16..48].copy_from_slice(self.digest.as_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            pba: get_u64(buf, 0),
            gen: get_u64(buf, 8),
            digest: Digest::from_bytes(&buf[16..48]),
        }
    }
}

/// The allocation record of one physical block, kept one level above the
/// leaves of the free tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationNode {
    pub pba: Pba,
    pub last_vba: Vba,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub last_key_id: u32,
    pub reserved: bool,
}

impl Default for AllocationNode {
    fn default() -> Self {
        Self::empty()
    }
}

impl NodeCodec for AllocationNode {
    const ENCODED_SIZE: usize = 37;

    fn empty() -> Self {
        Self {
            pba: INVALID_PBA,
            last_vba: INVALID_VBA,
            alloc_gen: INVALID_GEN,
            free_gen: INVALID_GEN,
            last_key_id: INVALID_KEY_ID,
            reserved: false,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.pba);
        put_u64(buf, 8, self.last_vba);
        put_u64(buf, 16, self.alloc_gen);
        put_u64(buf, 24, self.free_gen);
        put_u32(buf, 32, self.last_key_id);
        buf[36] = self.reserved as u8;
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            pba: get_u64(buf, 0),
            last_vba: get_u64(buf, 8),
            alloc_gen: get_u64(buf, 16),
            free_gen: get_u64(buf, 24),
            last_key_id: get_u32(buf, 32),
            reserved: buf[36] != 0,
        }
    }
}

/// The decoded entries of one node block.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeBlock<N> {
    entries: Vec<N>,
}

impl<N: NodeCodec> NodeBlock<N> {
    /// Creates a block whose entries are all empty.
    pub fn new() -> Self {
        Self {
            entries: alloc::vec![N::empty(); N::ENTRIES_PER_BLOCK],
        }
    }

    /// Decodes a block.
    ///
    /// # Panics
    ///
    /// The length of `block` must be `BLOCK_SIZE`.
    pub fn decode(block: &[u8]) -> Self {
        assert_eq!(block.len(), BLOCK_SIZE);
        let entries = block
            .chunks_exact(N::SLOT_SIZE)
            .map(|slot| N::decode(slot))
            .collect();
        Self { entries }
    }

    /// Decodes the `idx`-th entry of an encoded block.
    pub fn decode_entry(block: &[u8], idx: usize) -> N {
        N::decode(&block[idx * N::SLOT_SIZE..(idx + 1) * N::SLOT_SIZE])
    }

    /// Encodes the block into `block`, zeroing the padding of every slot.
    pub fn encode(&self, block: &mut [u8]) {
        assert_eq!(block.len(), BLOCK_SIZE);
        block.fill(0);
        for (slot, entry) in block.chunks_exact_mut(N::SLOT_SIZE).zip(self.entries.iter()) {
            entry.encode(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &N> {
        self.entries.iter()
    }
}

impl<N: NodeCodec> Default for NodeBlock<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Index<usize> for NodeBlock<N> {
    type Output = N;

    fn index(&self, idx: usize) -> &N {
        &self.entries[idx]
    }
}

impl<N> IndexMut<usize> for NodeBlock<N> {
    fn index_mut(&mut self, idx: usize) -> &mut N {
        &mut self.entries[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_follows_sizes() {
        assert_eq!(InnerNode::SLOT_SIZE, 64);
        assert_eq!(AllocationNode::SLOT_SIZE, 64);
        assert_eq!(InnerNode::ENTRIES_PER_BLOCK, 64);
        assert_eq!(AllocationNode::ENTRIES_PER_BLOCK, 64);
        assert_eq!(ENTRIES_PER_BLOCK, 64);
    }

    #[test]
    fn inner_node_layout() {
        let node = InnerNode {
            pba: 0x0102,
            gen: 7,
            digest: Digest::of(b"node"),
        };
        let mut slot = [0xaau8; 64];
        node.encode(&mut slot);
        assert_eq!(&slot[0..8], &0x0102u64.to_le_bytes());
        assert_eq!(&slot[8..16], &7u64.to_le_bytes());
        assert_eq!(&slot[16..48], node.digest.as_bytes());
        assert_eq!(InnerNode::decode(&slot), node);

        let invalid = InnerNode::decode(&[0xffu8; 64]);
        assert!(!invalid.is_valid());
        assert_eq!(invalid.gen, INVALID_GEN);
    }

    #[test]
    fn allocation_node_layout() {
        let node = AllocationNode {
            pba: 42,
            last_vba: 3,
            alloc_gen: 5,
            free_gen: INVALID_GEN,
            last_key_id: 1,
            reserved: true,
        };
        let mut slot = [0u8; 64];
        node.encode(&mut slot);
        assert_eq!(&slot[24..32], &[0xff; 8]);
        assert_eq!(&slot[32..36], &1u32.to_le_bytes());
        assert_eq!(slot[36], 1);
        assert!(slot[37..].iter().all(|b| *b == 0));
        assert_eq!(AllocationNode::decode(&slot), node);
    }

    #[test]
    fn node_block() {
        let mut block = NodeBlock::<InnerNode>::new();
        assert_eq!(block.len(), 64);
        assert!(block.iter().all(|node| !node.is_valid()));

        block[63] = InnerNode {
            pba: 9,
            gen: 1,
            digest: Digest::of(&[1u8; 10]),
        };
        let mut buf = alloc::vec![0u8; BLOCK_SIZE];
        block.encode(&mut buf);
        assert_eq!(NodeBlock::<InnerNode>::decode_entry(&buf, 63), block[63]);
        assert_eq!(NodeBlock::<InnerNode>::decode(&buf), block);
    }

    #[test]
    fn digest_verify() {
        let data = [3u8; BLOCK_SIZE];
        let digest = Digest::of(&data);
        assert!(digest.verify(&data).is_ok());
        assert_eq!(
            digest.verify(&[4u8; BLOCK_SIZE]).unwrap_err().errno(),
            crate::Errno::DigestMismatch
        );
    }
}
