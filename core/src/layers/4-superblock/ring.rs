//! The superblock ring.
//!
//! The superblock is replicated over `NUM_SUPER_BLOCKS` slots at the head of
//! the device. Each commit writes the slot after the last committed one, so
//! the previous commit is never touched while a new one is in flight. On
//! mount, the intact slot of the highest generation wins.
use super::SuperBlock;
use crate::layers::bio::{BlockSet, Buf};
use crate::prelude::*;

/// The number of superblock slots.
pub const NUM_SUPER_BLOCKS: usize = 8;

/// The round-robin replicas of the superblock.
pub struct SuperBlockRing<D> {
    region: D,
    /// The slot of the last commit.
    cursor: usize,
}

impl<D: BlockSet> SuperBlockRing<D> {
    /// Formats the ring in `region`: `superblock` goes to slot 0 and every
    /// other slot is cleared.
    pub fn format(region: D, superblock: &SuperBlock) -> Result<Self> {
        Self::check_region(&region)?;
        let zeroed = Buf::alloc(NUM_SUPER_BLOCKS - 1)?;
        region.write(1, zeroed.as_ref())?;

        let mut new_self = Self {
            region,
            cursor: NUM_SUPER_BLOCKS - 1,
        };
        new_self.commit(superblock)?;
        Ok(new_self)
    }

    /// Recovers the ring, returning the most recent intact superblock.
    pub fn recover(region: D) -> Result<(Self, SuperBlock)> {
        Self::check_region(&region)?;
        let mut slots = Buf::alloc(NUM_SUPER_BLOCKS)?;
        region.read(0, slots.as_mut())?;

        let latest = slots
            .as_slice()
            .chunks_exact(BLOCK_SIZE)
            .enumerate()
            .filter_map(|(slot, block)| SuperBlock::decode(block).map(|sb| (slot, sb)))
            .max_by_key(|(_, sb)| sb.last_secured_gen);
        let Some((cursor, superblock)) = latest else {
            error!("[SuperBlockRing] no valid superblock among {} slots", NUM_SUPER_BLOCKS);
            return_errno_with_msg!(NoValidSuperBlock, "no valid superblock in the ring");
        };

        info!(
            "[SuperBlockRing] recovered generation {} from slot {}",
            superblock.last_secured_gen, cursor
        );
        Ok((Self { region, cursor }, superblock))
    }

    /// Commits `superblock` to the next slot and flushes it.
    ///
    /// # Panics
    ///
    /// The superblock must be valid.
    pub fn commit(&mut self, superblock: &SuperBlock) -> Result<()> {
        assert!(superblock.valid());
        let slot = (self.cursor + 1) % NUM_SUPER_BLOCKS;
        let mut block = Buf::alloc(1)?;
        superblock.encode(block.as_mut_slice());
        self.region.write(slot, block.as_ref())?;
        self.region.flush()?;

        self.cursor = slot;
        debug!(
            "[SuperBlockRing] committed generation {} to slot {}",
            superblock.last_secured_gen, slot
        );
        Ok(())
    }

    /// Returns the slot of the last commit.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn check_region(region: &D) -> Result<()> {
        if region.nblocks() < NUM_SUPER_BLOCKS {
            return_errno_with_msg!(InvalidArgs, "region too small for the superblock ring");
        }
        Ok(())
    }
}
