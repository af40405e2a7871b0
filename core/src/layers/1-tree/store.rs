//! Encrypted and verified block I/O for tree nodes and data leaves.
//!
//! Every block below the superblock ring is stored encrypted with
//! AES-128-CTR. The IV is derived from the physical address, the generation
//! and the digest of the plain content, all of which the parent entry holds,
//! so two different contents never share a keystream.
use super::{Digest, Generation, InnerNode, NodeCache, Pba, INVALID_PBA};
use crate::layers::bio::{BlockSet, Buf, BufMut, BufRef};
use crate::os::{sha256, Skcipher, SkcipherIv, SkcipherKey};
use crate::prelude::*;

/// The cipher of all blocks below the superblock ring.
pub struct BlockCipher {
    key: SkcipherKey,
}

impl BlockCipher {
    pub fn new(key: SkcipherKey) -> Self {
        Self { key }
    }

    fn iv(pba: Pba, gen: Generation, digest: &Digest) -> SkcipherIv {
        let mut material = [0u8; 48];
        material[..8].copy_from_slice(&pba.to_le_bytes());
        material[8..16].copy_from_slice(&gen.to_le_bytes());
        material[16..].copy_from_slice(digest.as_bytes());

        let mut iv = SkcipherIv::default();
        let len = iv.len();
        iv.copy_from_slice(&sha256(&material)[..len]);
        iv
    }

    pub fn encrypt(&self, node: &InnerNode, plain: &[u8], cipher: &mut [u8]) -> Result<()> {
        let iv = Self::iv(node.pba, node.gen, &node.digest);
        Skcipher::new().encrypt(plain, &self.key, &iv, cipher)
    }

    pub fn decrypt(&self, node: &InnerNode, cipher: &[u8], plain: &mut [u8]) -> Result<()> {
        let iv = Self::iv(node.pba, node.gen, &node.digest);
        Skcipher::new().decrypt(cipher, &self.key, &iv, plain)
    }
}

/// Reads and writes blocks addressed by tree entries.
///
/// A block is only handed out after its plain content matched the digest of
/// the entry pointing at it.
pub struct NodeStore<'a, D> {
    disk: &'a D,
    cache: &'a NodeCache,
    cipher: &'a BlockCipher,
}

impl<'a, D: BlockSet> NodeStore<'a, D> {
    pub fn new(disk: &'a D, cache: &'a NodeCache, cipher: &'a BlockCipher) -> Self {
        Self {
            disk,
            cache,
            cipher,
        }
    }

    /// Reads the node block `node` points at.
    pub fn read_node(&self, node: &InnerNode) -> Result<Arc<[u8]>> {
        debug_assert!(node.is_valid());
        if let Some(block) = self.cache.get(node.pba, &node.digest) {
            return Ok(block);
        }

        let mut plain = Buf::alloc(1)?;
        self.read_block(node, plain.as_mut())?;
        let block: Arc<[u8]> = Arc::from(plain.as_slice());
        self.cache.put(node.pba, node.digest, block.clone());
        Ok(block)
    }

    /// Writes a node block at `pba` of generation `gen`, returning the entry
    /// that points at it.
    pub fn write_node(&self, pba: Pba, gen: Generation, plain: &[u8]) -> Result<InnerNode> {
        let node = self.write_block(pba, gen, BufRef::try_from(plain)?)?;
        self.cache.put(pba, node.digest, Arc::from(plain));
        Ok(node)
    }

    /// Reads the data block `node` points at into `buf`. An invalid entry
    /// reads as zeros.
    pub fn read_data(&self, node: &InnerNode, mut buf: BufMut) -> Result<()> {
        if node.pba == INVALID_PBA {
            buf.as_mut_slice().fill(0);
            return Ok(());
        }
        self.read_block(node, buf)
    }

    /// Writes a data block at `pba` of generation `gen`.
    pub fn write_data(&self, pba: Pba, gen: Generation, buf: BufRef) -> Result<InnerNode> {
        self.cache.invalidate(pba);
        self.write_block(pba, gen, buf)
    }

    fn read_block(&self, node: &InnerNode, mut plain: BufMut) -> Result<()> {
        debug_assert_eq!(plain.nblocks(), 1);
        let mut cipher = Buf::alloc(1)?;
        self.disk.read(node.pba as BlockId, cipher.as_mut())?;
        self.cipher
            .decrypt(node, cipher.as_slice(), plain.as_mut_slice())?;
        if let Err(e) = node.digest.verify(plain.as_slice()) {
            error!(
                "[NodeStore] block {} of generation {} failed verification",
                node.pba, node.gen
            );
            return Err(e);
        }
        Ok(())
    }

    fn write_block(&self, pba: Pba, gen: Generation, plain: BufRef) -> Result<InnerNode> {
        debug_assert_eq!(plain.nblocks(), 1);
        let node = InnerNode {
            pba,
            gen,
            digest: Digest::of(plain.as_slice()),
        };
        let mut cipher = Buf::alloc(1)?;
        self.cipher
            .encrypt(&node, plain.as_slice(), cipher.as_mut_slice())?;
        self.disk.write(pba as BlockId, cipher.as_ref())?;
        Ok(node)
    }
}
