//! The copy-on-write tree.
//!
//! `CowTree` keeps every block that has been modified since the last
//! write-back in memory, keyed by `(level, position)`. A block is dirty only
//! if its parent is dirty too, so the pointer to any dirty block is always
//! found in memory: in its dirty parent, or in the root.
//!
//! Before write-back, each dirty block needs a home. A block already written
//! in the generation being sealed is rewritten in place, since no committed
//! state references it. Any other block is relocated by the caller, which
//! allocates a new physical block and vacates the old one.
use super::{walk, Generation, InnerNode, NodeBlock, NodeCodec, NodeStore, Pba, TreeShape, Vba};
use crate::layers::bio::{BlockSet, Buf};
use crate::os::BTreeMap;
use crate::prelude::*;

use alloc::borrow::Cow;

/// A tree whose level-1 blocks hold entries of type `L`, and whose upper
/// blocks hold `InnerNode`s.
pub struct CowTree<L> {
    shape: TreeShape,
    root: InnerNode,
    /// Dirty blocks above level 1.
    inner: BTreeMap<(u32, u64), NodeBlock<InnerNode>>,
    /// Dirty level-1 blocks, keyed by position.
    bottom: BTreeMap<u64, NodeBlock<L>>,
}

/// Where the level-1 block on a path lives.
enum Bottom<'a, L> {
    Dirty(&'a NodeBlock<L>),
    OnDisk(InnerNode),
    Unwritten,
}

impl<L: NodeCodec> CowTree<L> {
    /// Creates a clean tree below `root`.
    pub fn new(shape: TreeShape, root: InnerNode) -> Self {
        Self {
            shape,
            root,
            inner: BTreeMap::new(),
            bottom: BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    /// Returns the pointer to the root block.
    pub fn root(&self) -> &InnerNode {
        &self.root
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.is_empty() || !self.bottom.is_empty()
    }

    pub fn num_dirty(&self) -> usize {
        self.inner.len() + self.bottom.len()
    }

    /// Looks up the level-1 entry of `vba`, seeing dirty blocks first.
    ///
    /// Returns `None` if the entry lives in a block that was never written.
    pub fn lookup<D: BlockSet>(&self, store: &NodeStore<'_, D>, vba: Vba) -> Result<Option<L>> {
        self.shape.check_vba(vba)?;
        let idx = self.shape.index(vba, 1);
        let entry = match self.locate_bottom(store, vba)? {
            Bottom::Dirty(block) => Some(block[idx].clone()),
            Bottom::OnDisk(node) => {
                let block = store.read_node(&node)?;
                Some(NodeBlock::<L>::decode_entry(&block, idx))
            }
            Bottom::Unwritten => None,
        };
        Ok(entry)
    }

    /// Returns the level-1 block at `pos`, or `None` if it was never written.
    pub fn bottom_block<D: BlockSet>(
        &self,
        store: &NodeStore<'_, D>,
        pos: u64,
    ) -> Result<Option<Cow<'_, NodeBlock<L>>>> {
        let vba = self.shape.first_leaf(pos, 1);
        self.shape.check_vba(vba)?;
        let block = match self.locate_bottom(store, vba)? {
            Bottom::Dirty(block) => Some(Cow::Borrowed(block)),
            Bottom::OnDisk(node) => Some(Cow::Owned(NodeBlock::decode(&store.read_node(&node)?))),
            Bottom::Unwritten => None,
        };
        Ok(block)
    }

    /// Returns the level-1 entry of `vba` for modification, marking every
    /// block on its path dirty.
    pub fn entry_mut<D: BlockSet>(&mut self, store: &NodeStore<'_, D>, vba: Vba) -> Result<&mut L> {
        self.shape.check_vba(vba)?;
        for level in (1..=self.shape.height()).rev() {
            self.load_block(store, level, self.shape.position(vba, level))?;
        }
        let idx = self.shape.index(vba, 1);
        let block = self.bottom.entry(self.shape.position(vba, 1)).or_default();
        Ok(&mut block[idx])
    }

    /// Marks the root block dirty, creating it if the tree is empty.
    pub fn touch_root<D: BlockSet>(&mut self, store: &NodeStore<'_, D>) -> Result<()> {
        self.load_block(store, self.shape.height(), 0)
    }

    /// Returns the dirty blocks that must be relocated before write-back in
    /// generation `gen`, top-down.
    pub fn pending_relocations(&self, gen: Generation) -> Vec<(u32, u64)> {
        let needs_home = |node: InnerNode| !node.is_valid() || node.gen != gen;
        let mut pending: Vec<(u32, u64)> = self
            .inner
            .keys()
            .rev()
            .copied()
            .filter(|&(level, pos)| needs_home(self.node(level, pos)))
            .collect();
        pending.extend(
            self.bottom
                .keys()
                .copied()
                .filter(|&pos| needs_home(self.node(1, pos)))
                .map(|pos| (1, pos)),
        );
        pending
    }

    /// Moves the dirty block at `(level, pos)` to `pba` of generation `gen`.
    /// Returns the previous pointer to the block.
    ///
    /// # Panics
    ///
    /// The block must be dirty.
    pub fn relocate(&mut self, level: u32, pos: u64, pba: Pba, gen: Generation) -> InnerNode {
        assert!(self.is_dirty_block(level, pos), "only dirty blocks relocate");
        let node = self.node_mut(level, pos);
        let old = *node;
        node.pba = pba;
        node.gen = gen;
        old
    }

    /// Writes every dirty block back bottom-up, filling the digest of each
    /// block into its parent. Returns the new root pointer.
    ///
    /// # Panics
    ///
    /// Every dirty block must have been relocated to generation `gen`.
    pub fn write_back<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        gen: Generation,
    ) -> Result<InnerNode> {
        debug_assert!(self.pending_relocations(gen).is_empty());
        let mut buf = Buf::alloc(1)?;

        let positions: Vec<u64> = self.bottom.keys().copied().collect();
        for pos in positions {
            self.bottom[&pos].encode(buf.as_mut_slice());
            self.write_block(store, 1, pos, gen, &buf)?;
        }

        // Keys are ordered by level, so children go before their parents
        let keys: Vec<(u32, u64)> = self.inner.keys().copied().collect();
        for (level, pos) in keys {
            self.inner[&(level, pos)].encode(buf.as_mut_slice());
            self.write_block(store, level, pos, gen, &buf)?;
        }

        self.inner.clear();
        self.bottom.clear();
        Ok(self.root)
    }

    fn write_block<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        level: u32,
        pos: u64,
        gen: Generation,
        buf: &Buf,
    ) -> Result<()> {
        let node = self.node(level, pos);
        assert!(
            node.is_valid() && node.gen == gen,
            "dirty block ({}, {}) was not relocated",
            level,
            pos
        );
        *self.node_mut(level, pos) = store.write_node(node.pba, gen, buf.as_slice())?;
        Ok(())
    }

    fn is_dirty_block(&self, level: u32, pos: u64) -> bool {
        if level == 1 {
            self.bottom.contains_key(&pos)
        } else {
            self.inner.contains_key(&(level, pos))
        }
    }

    /// Loads the block at `(level, pos)` into the dirty set. Its parent must
    /// be dirty already.
    fn load_block<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        level: u32,
        pos: u64,
    ) -> Result<()> {
        if self.is_dirty_block(level, pos) {
            return Ok(());
        }
        let node = self.node(level, pos);
        let block = if node.is_valid() {
            Some(store.read_node(&node)?)
        } else {
            None
        };
        if level == 1 {
            let block = block.map_or_else(NodeBlock::new, |block| NodeBlock::decode(&block));
            self.bottom.insert(pos, block);
        } else {
            let block = block.map_or_else(NodeBlock::new, |block| NodeBlock::decode(&block));
            self.inner.insert((level, pos), block);
        }
        Ok(())
    }

    fn locate_bottom<D: BlockSet>(&self, store: &NodeStore<'_, D>, vba: Vba) -> Result<Bottom<'_, L>> {
        let mut node = self.root;
        for level in (2..=self.shape.height()).rev() {
            match self.inner.get(&(level, self.shape.position(vba, level))) {
                Some(block) => node = block[self.shape.index(vba, level)],
                None => {
                    // Nothing below a clean block is dirty
                    let bottom = walk::descend(store, &self.shape, node, level, vba)?;
                    return Ok(bottom.map_or(Bottom::Unwritten, Bottom::OnDisk));
                }
            }
        }
        if let Some(block) = self.bottom.get(&self.shape.position(vba, 1)) {
            return Ok(Bottom::Dirty(block));
        }
        Ok(if node.is_valid() {
            Bottom::OnDisk(node)
        } else {
            Bottom::Unwritten
        })
    }

    /// Returns the pointer to the block at `(level, pos)`, whose parent is dirty.
    fn node(&self, level: u32, pos: u64) -> InnerNode {
        if level == self.shape.height() {
            debug_assert_eq!(pos, 0);
            return self.root;
        }
        let (parent, slot) = self.shape.parent(pos);
        self.inner
            .get(&(level + 1, parent))
            .map_or(InnerNode::invalid(), |block| block[slot])
    }

    fn node_mut(&mut self, level: u32, pos: u64) -> &mut InnerNode {
        if level == self.shape.height() {
            return &mut self.root;
        }
        let (parent, slot) = self.shape.parent(pos);
        let block = self
            .inner
            .get_mut(&(level + 1, parent))
            .expect("the parent of a dirty block is dirty");
        &mut block[slot]
    }
}
