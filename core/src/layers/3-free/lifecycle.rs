//! The lifecycle of a physical block.
//!
//! ```text
//!             allocate                vacate(g)
//! UNALLOCATED ---------> LIVE ----------------------> VACATED(g)
//!      ^                                                  |
//!      |  reclaim                  every retained snapshot|
//!      +--------------- RECLAIMABLE <---------------------+
//!                                   is younger than g
//! ```
//!
//! `RECLAIMABLE` is never stored. It is derived from the free generation
//! and the `ReclaimFence` of the moment.
use crate::layers::snapshot::SnapshotDirectory;
use crate::layers::tree::{AllocationNode, Generation, Pba, Vba, INVALID_GEN, INVALID_KEY_ID, INVALID_VBA};
use crate::prelude::*;

/// The state of a physical block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Unallocated,
    Live,
    Vacated(Generation),
    Reclaimable,
}

/// Decides which vacated blocks may be reused.
///
/// A block vacated at generation `g` is reclaimable iff `g` is strictly
/// lower than the generation of every retained snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimFence {
    min_retained: Option<Generation>,
}

impl ReclaimFence {
    /// Creates a fence for the given lowest retained generation, `None` if
    /// no snapshot is retained.
    pub fn new(min_retained: Option<Generation>) -> Self {
        Self { min_retained }
    }

    /// Creates the fence of the snapshots retained by any of `directories`.
    pub fn from_directories<'a>(
        directories: impl IntoIterator<Item = &'a SnapshotDirectory>,
    ) -> Self {
        let min_retained = directories
            .into_iter()
            .filter_map(|directory| directory.min_retained_gen())
            .min();
        Self { min_retained }
    }

    pub fn min_retained(&self) -> Option<Generation> {
        self.min_retained
    }

    /// Whether a block vacated at `free_gen` may be reused.
    pub fn is_reclaimable(&self, free_gen: Generation) -> bool {
        free_gen != INVALID_GEN && self.min_retained.map_or(true, |min| free_gen < min)
    }
}

impl AllocationNode {
    pub fn state(&self, fence: &ReclaimFence) -> BlockState {
        if self.alloc_gen == INVALID_GEN {
            BlockState::Unallocated
        } else if self.free_gen == INVALID_GEN {
            BlockState::Live
        } else if fence.is_reclaimable(self.free_gen) {
            BlockState::Reclaimable
        } else {
            BlockState::Vacated(self.free_gen)
        }
    }

    /// Whether the allocator may hand out the block.
    pub fn is_allocatable(&self, fence: &ReclaimFence) -> bool {
        !self.reserved
            && matches!(
                self.state(fence),
                BlockState::Unallocated | BlockState::Reclaimable
            )
    }

    /// Holds the block back from allocation.
    pub fn reserve(&mut self, pba: Pba) {
        debug_assert_eq!(self.alloc_gen, INVALID_GEN);
        self.pba = pba;
        self.reserved = true;
    }

    /// Binds the unallocated block `pba` at generation `gen`.
    ///
    /// # Panics
    ///
    /// The block must be unallocated and not reserved.
    pub fn allocate(&mut self, pba: Pba, gen: Generation, vba: Vba, key_id: u32) {
        assert!(!self.reserved, "allocate reserved block {}", pba);
        assert_eq!(self.alloc_gen, INVALID_GEN, "allocate block {} twice", pba);
        self.pba = pba;
        self.last_vba = vba;
        self.alloc_gen = gen;
        self.free_gen = INVALID_GEN;
        self.last_key_id = key_id;
    }

    /// Marks the live block as superseded by a copy-on-write at `gen`.
    ///
    /// # Panics
    ///
    /// The block must be live.
    pub fn vacate(&mut self, gen: Generation) {
        assert!(
            self.alloc_gen != INVALID_GEN && self.free_gen == INVALID_GEN,
            "vacate block {} that is not live",
            self.pba
        );
        assert!(gen != INVALID_GEN && gen >= self.alloc_gen);
        self.free_gen = gen;
    }

    /// Takes back an allocation of generation `gen` before anything pointed
    /// at the block, as if it had never been handed out.
    ///
    /// # Panics
    ///
    /// The block must be live since generation `gen`.
    pub fn release(&mut self, gen: Generation) {
        assert!(
            self.alloc_gen == gen && self.free_gen == INVALID_GEN,
            "release block {} not allocated at generation {}",
            self.pba,
            gen
        );
        self.last_vba = INVALID_VBA;
        self.alloc_gen = INVALID_GEN;
        self.last_key_id = INVALID_KEY_ID;
    }

    /// Returns the reclaimable block to the unallocated state.
    ///
    /// # Panics
    ///
    /// Reusing a block that a retained snapshot may still read would alias
    /// two different contents, so the block must be reclaimable.
    pub fn reclaim(&mut self, fence: &ReclaimFence) {
        assert_eq!(
            self.state(fence),
            BlockState::Reclaimable,
            "reuse of block {} that is not reclaimable",
            self.pba
        );
        self.last_vba = INVALID_VBA;
        self.alloc_gen = INVALID_GEN;
        self.free_gen = INVALID_GEN;
        self.last_key_id = INVALID_KEY_ID;
        self.reserved = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::snapshot::Snapshot;
    use crate::layers::tree::{InnerNode, NodeCodec};
    use proptest::prelude::*;

    #[test]
    fn lifecycle() {
        let mut node = AllocationNode::empty();
        let fence = ReclaimFence::new(Some(3));
        assert_eq!(node.state(&fence), BlockState::Unallocated);
        assert!(node.is_allocatable(&fence));

        node.allocate(9, 1, 4, 1);
        assert_eq!(node.state(&fence), BlockState::Live);
        assert!(!node.is_allocatable(&fence));

        node.vacate(3);
        assert_eq!(node.state(&fence), BlockState::Vacated(3));
        // A snapshot of generation 3 is still retained
        assert!(!fence.is_reclaimable(3));

        let fence = ReclaimFence::new(Some(4));
        assert_eq!(node.state(&fence), BlockState::Reclaimable);
        node.reclaim(&fence);
        assert_eq!(node.state(&fence), BlockState::Unallocated);
        assert_eq!(node.last_vba, INVALID_VBA);
        assert_eq!(node.last_key_id, INVALID_KEY_ID);
    }

    #[test]
    fn release_unused_allocation() {
        let fence = ReclaimFence::new(Some(1));
        let mut node = AllocationNode::empty();
        node.allocate(9, 2, 4, 1);
        node.release(2);
        assert_eq!(node.state(&fence), BlockState::Unallocated);
        assert!(node.is_allocatable(&fence));
        node.allocate(9, 2, 5, 1);
        assert_eq!(node.last_vba, 5);
    }

    #[test]
    #[should_panic(expected = "not allocated at generation")]
    fn release_older_allocation() {
        let mut node = AllocationNode::empty();
        node.allocate(9, 1, 4, 1);
        node.release(2);
    }

    #[test]
    #[should_panic(expected = "not reclaimable")]
    fn reuse_live_block() {
        let mut node = AllocationNode::empty();
        node.allocate(9, 1, 4, 1);
        node.reclaim(&ReclaimFence::new(None));
    }

    #[test]
    #[should_panic(expected = "not reclaimable")]
    fn reuse_vacated_block() {
        let mut node = AllocationNode::empty();
        node.allocate(9, 1, 4, 1);
        node.vacate(2);
        node.reclaim(&ReclaimFence::new(Some(1)));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn allocate_reserved_block() {
        let mut node = AllocationNode::empty();
        node.reserve(0);
        assert!(!node.is_allocatable(&ReclaimFence::new(None)));
        node.allocate(0, 1, 0, 1);
    }

    #[test]
    fn fence_of_directories() {
        let mut newer = SnapshotDirectory::new();
        let mut older = SnapshotDirectory::new();
        let root = InnerNode::invalid();
        for (id, gen) in [(0, 4), (1, 6)] {
            newer.insert(Snapshot::new(&InnerNode { gen, ..root }, 1, 1, id)).unwrap();
        }
        older.insert(Snapshot::new(&InnerNode { gen: 2, ..root }, 1, 1, 9)).unwrap();

        let fence = ReclaimFence::from_directories([&newer, &older]);
        assert_eq!(fence.min_retained(), Some(2));
        let fence = ReclaimFence::from_directories([&newer]);
        assert_eq!(fence.min_retained(), Some(4));
        assert!(fence.is_reclaimable(3));
        assert!(!fence.is_reclaimable(4));
        assert!(!fence.is_reclaimable(INVALID_GEN));
        let fence = ReclaimFence::from_directories([&SnapshotDirectory::new()]);
        assert_eq!(fence, ReclaimFence::new(None));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        Vacate(usize),
        Seal,
        Keep(usize),
        Discard(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..8usize).prop_map(Op::Alloc),
            3 => (0..8usize).prop_map(Op::Vacate),
            2 => Just(Op::Seal),
            1 => (0..48usize).prop_map(Op::Keep),
            2 => (0..48usize).prop_map(Op::Discard),
        ]
    }

    fn is_allowed(from: BlockState, to: BlockState) -> bool {
        use BlockState::*;
        match (from, to) {
            (a, b) if a == b => true,
            (Unallocated, Live) | (Live, Vacated(_)) | (Reclaimable, Unallocated) => true,
            (Vacated(_), Reclaimable) => true,
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn histories_follow_the_lifecycle(ops in proptest::collection::vec(op(), 1..200)) {
            let mut blocks = [AllocationNode::empty(); 8];
            let mut directory = SnapshotDirectory::new();
            let root = InnerNode::invalid();
            directory
                .insert(Snapshot::new(&InnerNode { gen: 0, ..root }, 1, 1, 0))
                .unwrap();
            let mut gen: Generation = 1;
            let mut next_id = 1;

            for op in ops {
                let fence = ReclaimFence::from_directories([&directory]);
                let before: Vec<BlockState> = blocks.iter().map(|b| b.state(&fence)).collect();
                let mut reclaimed = [false; 8];

                match op {
                    Op::Alloc(i) => {
                        if blocks[i].is_allocatable(&fence) {
                            if blocks[i].state(&fence) == BlockState::Reclaimable {
                                blocks[i].reclaim(&fence);
                                reclaimed[i] = true;
                            }
                            blocks[i].allocate(i as Pba, gen, 0, 1);
                        }
                    }
                    Op::Vacate(i) => {
                        if blocks[i].state(&fence) == BlockState::Live && blocks[i].alloc_gen < gen {
                            blocks[i].vacate(gen);
                        }
                    }
                    Op::Seal => {
                        if directory.can_insert() {
                            let sealed = InnerNode { gen, ..root };
                            directory.insert(Snapshot::new(&sealed, 1, 1, next_id)).unwrap();
                            next_id += 1;
                            gen += 1;
                        }
                    }
                    Op::Keep(slot) => {
                        let id = directory.iter().nth(slot).map(|s| s.id);
                        if let Some(id) = id {
                            directory.set_keep(id, true).unwrap();
                        }
                    }
                    Op::Discard(slot) => {
                        let id = directory.iter().nth(slot).map(|s| s.id);
                        if let Some(id) = id.filter(|id| *id != directory.active_id()) {
                            directory.discard(id).unwrap();
                        }
                    }
                }

                let fence = ReclaimFence::from_directories([&directory]);
                for (i, block) in blocks.iter().enumerate() {
                    let after = block.state(&fence);
                    if reclaimed[i] {
                        prop_assert_eq!(before[i], BlockState::Reclaimable);
                        prop_assert_eq!(after, BlockState::Live);
                    } else {
                        prop_assert!(
                            is_allowed(before[i], after),
                            "{:?} -> {:?}", before[i], after
                        );
                    }

                    // No retained snapshot that may read the block's old
                    // content can coexist with its reclamation
                    if after == BlockState::Reclaimable {
                        prop_assert!(directory.iter().all(|s| s.gen > block.free_gen));
                    }
                }
            }
        }
    }
}
