//! The superblock.
//!
//! The on-disk layout of a superblock slot (all integers little-endian):
//!
//! ```text
//! offset  size  field
//! 0       136   keys[2]: { value: [u8; 64], id: u32 }
//! 136     3264  snapshots[48]: Snapshot
//! 3400    8     last_secured_gen
//! 3408    4     active_snapshot_id
//! 3412    4     next_snapshot_id
//! 3416    4     tree_degree
//! 3420    64    free_tree: { gen: u64, pba: u64, digest: [u8; 32],
//!                            height: u32, degree: u32, leaves: u64 }
//! 3484    4     magic
//! 3488    4     version
//! ...           zero
//! 4064    32    SHA-256 of bytes 0..4064
//! ```
//!
//! A slot only counts if its magic, version and checksum are intact and its
//! `last_secured_gen` is valid. A torn write of a slot fails the checksum.
use crate::layers::snapshot::{SnapshotDirectory, SNAPSHOT_SIZE};
use crate::layers::tree::{Digest, Generation, InnerNode, TreeShape, INVALID_GEN};
use crate::os::{sha256, SkcipherKey};
use crate::prelude::*;
use crate::util::codec::{get_u32, get_u64, put_u32, put_u64};

use static_assertions::const_assert;

/// The number of key slots.
pub const NUM_KEYS: usize = 2;
/// The size of the value of a key slot.
pub const KEY_SIZE: usize = 64;

const KEY_RECORD_SIZE: usize = KEY_SIZE + 4;
const SNAPSHOTS_OFFSET: usize = NUM_KEYS * KEY_RECORD_SIZE;
const LAST_SECURED_GEN_OFFSET: usize = SNAPSHOTS_OFFSET + SnapshotDirectory::ENCODED_SIZE;
const ACTIVE_ID_OFFSET: usize = LAST_SECURED_GEN_OFFSET + 8;
const NEXT_ID_OFFSET: usize = ACTIVE_ID_OFFSET + 4;
const TREE_DEGREE_OFFSET: usize = NEXT_ID_OFFSET + 4;
const FREE_TREE_OFFSET: usize = TREE_DEGREE_OFFSET + 4;
const FREE_TREE_SIZE: usize = 64;
const MAGIC_OFFSET: usize = FREE_TREE_OFFSET + FREE_TREE_SIZE;
const VERSION_OFFSET: usize = MAGIC_OFFSET + 4;
const CHECKSUM_OFFSET: usize = BLOCK_SIZE - 32;

const SUPERBLOCK_MAGIC: u32 = u32::from_le_bytes(*b"CBE\x01");
const SUPERBLOCK_VERSION: u32 = 1;

const_assert!(SNAPSHOTS_OFFSET == 136);
const_assert!(LAST_SECURED_GEN_OFFSET == 136 + 48 * SNAPSHOT_SIZE);
const_assert!(LAST_SECURED_GEN_OFFSET == 3400);
const_assert!(VERSION_OFFSET + 4 <= CHECKSUM_OFFSET);

/// A key slot of the superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMaterial {
    pub value: [u8; KEY_SIZE],
    pub id: u32,
}

impl KeyMaterial {
    /// The id of an unused key slot.
    pub const INVALID_ID: u32 = 0;

    pub const fn empty() -> Self {
        Self {
            value: [0u8; KEY_SIZE],
            id: Self::INVALID_ID,
        }
    }

    /// Creates a random key with `id`.
    pub fn random(id: u32) -> Result<Self> {
        let mut value = [0u8; KEY_SIZE];
        crate::os::Rng::new(&[]).fill_bytes(&mut value)?;
        Ok(Self { value, id })
    }

    /// Returns the block cipher key held by this slot.
    pub fn skcipher_key(&self) -> SkcipherKey {
        let mut key = SkcipherKey::default();
        let len = key.len();
        key.copy_from_slice(&self.value[..len]);
        key
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[..KEY_SIZE].copy_from_slice(&self.value);
        put_u32(buf, KEY_SIZE, self.id);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut value = [0u8; KEY_SIZE];
        value.copy_from_slice(&buf[..KEY_SIZE]);
        Self {
            value,
            id: get_u32(buf, KEY_SIZE),
        }
    }
}

/// The root of the free tree, with its shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeTreeRoot {
    pub node: InnerNode,
    pub height: u32,
    pub degree: u32,
    pub leaves: u64,
}

impl FreeTreeRoot {
    pub fn new(node: InnerNode, shape: &TreeShape) -> Self {
        Self {
            node,
            height: shape.height(),
            degree: shape.degree(),
            leaves: shape.leaves(),
        }
    }

    pub fn shape(&self) -> Result<TreeShape> {
        TreeShape::new(self.degree, self.height, self.leaves)
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.node.gen);
        put_u64(buf, 8, self.node.pba);
        buf[16..48].copy_from_slice(self.node.digest.as_bytes());
        put_u32(buf, 48, self.height);
        put_u32(buf, 52, self.degree);
        put_u64(buf, 56, self.leaves);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            node: InnerNode {
                gen: get_u64(buf, 0),
                pba: get_u64(buf, 8),
                digest: Digest::from_bytes(&buf[16..48]),
            },
            height: get_u32(buf, 48),
            degree: get_u32(buf, 52),
            leaves: get_u64(buf, 56),
        }
    }
}

/// The root record of the whole store.
#[derive(Clone, Debug, PartialEq)]
pub struct SuperBlock {
    pub keys: [KeyMaterial; NUM_KEYS],
    pub snapshots: SnapshotDirectory,
    pub last_secured_gen: Generation,
    pub next_snapshot_id: u32,
    /// The degree of the virtual block tree.
    pub tree_degree: u32,
    pub free_tree: FreeTreeRoot,
}

impl SuperBlock {
    /// Whether the superblock holds a committed state.
    pub fn valid(&self) -> bool {
        self.last_secured_gen != INVALID_GEN
    }

    /// Encodes the superblock into a block, sealing it with a checksum.
    pub fn encode(&self, block: &mut [u8]) {
        assert_eq!(block.len(), BLOCK_SIZE);
        block.fill(0);
        for (nth, key) in self.keys.iter().enumerate() {
            key.encode(&mut block[nth * KEY_RECORD_SIZE..(nth + 1) * KEY_RECORD_SIZE]);
        }
        self.snapshots.encode(&mut block[SNAPSHOTS_OFFSET..]);
        put_u64(block, LAST_SECURED_GEN_OFFSET, self.last_secured_gen);
        put_u32(block, ACTIVE_ID_OFFSET, self.snapshots.active_id());
        put_u32(block, NEXT_ID_OFFSET, self.next_snapshot_id);
        put_u32(block, TREE_DEGREE_OFFSET, self.tree_degree);
        self.free_tree
            .encode(&mut block[FREE_TREE_OFFSET..FREE_TREE_OFFSET + FREE_TREE_SIZE]);
        put_u32(block, MAGIC_OFFSET, SUPERBLOCK_MAGIC);
        put_u32(block, VERSION_OFFSET, SUPERBLOCK_VERSION);

        let checksum = sha256(&block[..CHECKSUM_OFFSET]);
        block[CHECKSUM_OFFSET..].copy_from_slice(&checksum);
    }

    /// Decodes a superblock slot. Returns `None` unless the slot is intact
    /// and valid.
    pub fn decode(block: &[u8]) -> Option<Self> {
        if block.len() != BLOCK_SIZE
            || get_u32(block, MAGIC_OFFSET) != SUPERBLOCK_MAGIC
            || get_u32(block, VERSION_OFFSET) != SUPERBLOCK_VERSION
            || sha256(&block[..CHECKSUM_OFFSET])[..] != block[CHECKSUM_OFFSET..]
        {
            return None;
        }

        let keys = array_init::array_init(|nth| {
            KeyMaterial::decode(&block[nth * KEY_RECORD_SIZE..(nth + 1) * KEY_RECORD_SIZE])
        });
        let snapshots = SnapshotDirectory::decode(
            &block[SNAPSHOTS_OFFSET..LAST_SECURED_GEN_OFFSET],
            get_u32(block, ACTIVE_ID_OFFSET),
        );
        let superblock = Self {
            keys,
            snapshots,
            last_secured_gen: get_u64(block, LAST_SECURED_GEN_OFFSET),
            next_snapshot_id: get_u32(block, NEXT_ID_OFFSET),
            tree_degree: get_u32(block, TREE_DEGREE_OFFSET),
            free_tree: FreeTreeRoot::decode(
                &block[FREE_TREE_OFFSET..FREE_TREE_OFFSET + FREE_TREE_SIZE],
            ),
        };
        superblock.valid().then_some(superblock)
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::layers::snapshot::Snapshot;

    pub fn superblock(gen: Generation) -> SuperBlock {
        let mut snapshots = SnapshotDirectory::new();
        let root = InnerNode {
            pba: 20 + gen,
            gen,
            digest: Digest::of(&gen.to_le_bytes()),
        };
        snapshots.insert(Snapshot::new(&root, 4096, 2, gen as u32)).unwrap();
        SuperBlock {
            keys: [KeyMaterial::random(1).unwrap(), KeyMaterial::empty()],
            snapshots,
            last_secured_gen: gen,
            next_snapshot_id: gen as u32 + 1,
            tree_degree: 64,
            free_tree: FreeTreeRoot {
                node: InnerNode {
                    pba: 9,
                    gen,
                    digest: Digest::of(b"free"),
                },
                height: 2,
                degree: 64,
                leaves: 1024,
            },
        }
    }

    #[test]
    fn superblock_layout() {
        let superblock = superblock(3);
        let mut block = alloc::vec![0u8; BLOCK_SIZE];
        superblock.encode(&mut block);

        assert_eq!(&block[..KEY_SIZE], &superblock.keys[0].value[..]);
        assert_eq!(get_u32(&block, KEY_SIZE), 1);
        assert_eq!(get_u64(&block, 3400), 3);
        assert_eq!(get_u32(&block, 3408), 3);
        assert_eq!(get_u32(&block, 3412), 4);
        assert_eq!(get_u32(&block, 3416), 64);
        assert_eq!(get_u64(&block, 3428), 9);
        assert_eq!(get_u64(&block, 3476), 1024);

        let decoded = SuperBlock::decode(&block).unwrap();
        assert_eq!(decoded, superblock);
        assert_eq!(decoded.snapshots.snapshot_slot(), 0);
        assert_eq!(decoded.free_tree.shape().unwrap().height(), 2);
    }

    #[test]
    fn reject_damaged_slots() {
        let mut block = alloc::vec![0u8; BLOCK_SIZE];
        assert!(SuperBlock::decode(&block).is_none());

        superblock(3).encode(&mut block);
        for offset in [0, 200, 3400, 3484, 4000, 4064, 4095] {
            let mut damaged = block.clone();
            damaged[offset] ^= 0x80;
            assert!(SuperBlock::decode(&damaged).is_none());
        }

        let mut never_committed = superblock(3);
        never_committed.last_secured_gen = INVALID_GEN;
        never_committed.encode(&mut block);
        assert!(SuperBlock::decode(&block).is_none());
    }

    #[test]
    fn cipher_key_from_key_material() {
        let key = KeyMaterial::random(1).unwrap();
        assert_eq!(&key.skcipher_key()[..], &key.value[..16]);
        assert_ne!(key, KeyMaterial::random(1).unwrap());
    }
}
