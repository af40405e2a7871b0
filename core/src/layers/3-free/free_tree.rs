//! The free tree.
//!
//! A copy-on-write tree over every physical block of the device: the leaf
//! `pba` is the block `pba`, its `AllocationNode` lives in a level-1 block,
//! and the upper levels are `InnerNode`s. Level-1 blocks that were never
//! written describe unallocated blocks only, so a fresh tree costs nothing
//! but the blocks holding the reserved head of the device.
//!
//! The blocks of the free tree are allocated from the free tree itself.
//! Relocating a dirty block allocates a new one and vacates the old one,
//! which may dirty further blocks; `flush` repeats until nothing is left to
//! relocate. Each block moves at most once per generation, so this ends.
use super::{BlockState, ReclaimFence};
use crate::layers::bio::BlockSet;
use crate::layers::tree::{
    AllocationNode, CowTree, Generation, InnerNode, NodeCodec, NodeStore, Pba, TreeShape, Vba,
    INVALID_KEY_ID, INVALID_VBA,
};
use crate::prelude::*;

/// The allocator of physical blocks.
pub struct FreeTree {
    tree: CowTree<AllocationNode>,
    /// Where the next-fit search for a free block starts.
    cursor: Pba,
    /// The blocks at the head of the device that are never allocated.
    reserved: u64,
}

impl FreeTree {
    /// Creates a free tree over `nblocks` blocks, of which the first
    /// `reserved` are held back. Nothing is written before `flush`.
    pub fn format<D: BlockSet>(
        store: &NodeStore<'_, D>,
        nblocks: u64,
        degree: u32,
        reserved: u64,
    ) -> Result<Self> {
        if reserved >= nblocks {
            return_errno_with_msg!(InvalidArgs, "no block left to allocate");
        }
        let shape = TreeShape::fit(degree, nblocks)?;
        let mut new_self = Self::open(shape, InnerNode::invalid(), reserved);
        for pba in 0..reserved {
            new_self.tree.entry_mut(store, pba)?.reserve(pba);
        }
        Ok(new_self)
    }

    /// Opens the free tree below `root`.
    pub fn open(shape: TreeShape, root: InnerNode, reserved: u64) -> Self {
        Self {
            tree: CowTree::new(shape, root),
            cursor: reserved,
            reserved,
        }
    }

    pub fn shape(&self) -> &TreeShape {
        self.tree.shape()
    }

    /// Returns the pointer to the root block as of the last flush.
    pub fn root(&self) -> &InnerNode {
        self.tree.root()
    }

    pub fn is_dirty(&self) -> bool {
        self.tree.is_dirty()
    }

    /// Returns the allocation record of `pba`.
    pub fn node<D: BlockSet>(&self, store: &NodeStore<'_, D>, pba: Pba) -> Result<AllocationNode> {
        Ok(self
            .tree
            .lookup(store, pba)?
            .unwrap_or_else(AllocationNode::empty))
    }

    pub fn state<D: BlockSet>(
        &self,
        store: &NodeStore<'_, D>,
        pba: Pba,
        fence: &ReclaimFence,
    ) -> Result<BlockState> {
        Ok(self.node(store, pba)?.state(fence))
    }

    /// Allocates a block at generation `gen` for the virtual block `vba`,
    /// reusing a reclaimable block if that is the next one found.
    pub fn alloc<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        fence: &ReclaimFence,
        gen: Generation,
        vba: Vba,
        key_id: u32,
    ) -> Result<Pba> {
        let Some(pba) = self.find_free(store, fence)? else {
            return_errno_with_msg!(OutOfDisk, "no unallocated or reclaimable block left");
        };

        let entry = self.tree.entry_mut(store, pba)?;
        if entry.state(fence) == BlockState::Reclaimable {
            trace!(
                "[FreeTree] reclaim block {} vacated at generation {}",
                pba,
                entry.free_gen
            );
            entry.reclaim(fence);
        }
        entry.allocate(pba, gen, vba, key_id);

        self.cursor = pba + 1;
        if self.cursor >= self.shape().leaves() {
            self.cursor = self.reserved;
        }
        Ok(pba)
    }

    /// Marks the live block `pba` as superseded at generation `gen`.
    pub fn vacate<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        pba: Pba,
        gen: Generation,
    ) -> Result<()> {
        self.tree.entry_mut(store, pba)?.vacate(gen);
        Ok(())
    }

    /// Takes back the block `pba` allocated at generation `gen`, which
    /// nothing points at. The next search starts from it again.
    pub fn release<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        pba: Pba,
        gen: Generation,
    ) -> Result<()> {
        self.tree.entry_mut(store, pba)?.release(gen);
        self.cursor = pba;
        Ok(())
    }

    /// Writes the free tree back in generation `gen` and returns its new root.
    pub fn flush<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        fence: &ReclaimFence,
        gen: Generation,
    ) -> Result<InnerNode> {
        let mut rounds = 0;
        loop {
            let pending = self.tree.pending_relocations(gen);
            if pending.is_empty() {
                break;
            }
            rounds += 1;
            for (level, pos) in pending {
                let pba = self.alloc(store, fence, gen, INVALID_VBA, INVALID_KEY_ID)?;
                let old = self.tree.relocate(level, pos, pba, gen);
                if old.is_valid() {
                    self.vacate(store, old.pba, gen)?;
                }
            }
        }
        debug!(
            "[FreeTree] flush generation {} with {} dirty blocks after {} rounds",
            gen,
            self.tree.num_dirty(),
            rounds
        );
        self.tree.write_back(store, gen)
    }

    /// Finds the next allocatable block from the cursor on, wrapping around.
    fn find_free<D: BlockSet>(
        &self,
        store: &NodeStore<'_, D>,
        fence: &ReclaimFence,
    ) -> Result<Option<Pba>> {
        let total = self.shape().leaves();
        let degree = self.shape().degree() as u64;
        let mut pba = self.cursor;
        let mut scanned = 0;
        while scanned < total {
            let pos = pba / degree;
            let end = ((pos + 1) * degree).min(total);
            let block = self.tree.bottom_block(store, pos)?;
            for candidate in pba..end {
                let free = match block.as_ref() {
                    Some(block) => block[(candidate % degree) as usize].is_allocatable(fence),
                    None => true,
                };
                if free {
                    return Ok(Some(candidate));
                }
            }
            scanned += end - pba;
            pba = if end == total { 0 } else { end };
        }
        Ok(None)
    }
}
