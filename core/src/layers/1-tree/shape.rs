//! Tree addressing.
//!
//! A tree of degree `d` and height `h` maps a virtual block address to one
//! child slot per level. Level `h` is the root block and level 1 is the
//! block whose entries point at the leaves. The slot of `vba` within a
//! level-`l` block is
//!
//! ```text
//! (vba >> (log2(d) * (l - 1))) & (d - 1)
//! ```
//!
//! which only selects the right bits when `d` is an exact power of two.
use super::{Vba, ENTRIES_PER_BLOCK};
use crate::prelude::*;

/// The maximum height of any tree.
pub const MAX_TREE_HEIGHT: u32 = 6;

/// The immutable shape of a tree: degree, height and number of leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeShape {
    degree: u32,
    height: u32,
    leaves: u64,
    log2_degree: u32,
}

impl TreeShape {
    /// Creates a new shape.
    ///
    /// The degree must be a power of two no larger than the number of entries
    /// a block holds, the height must lie in `1..=MAX_TREE_HEIGHT`, and the
    /// leaves must fit in `degree^height`.
    pub fn new(degree: u32, height: u32, leaves: u64) -> Result<Self> {
        let Some(log2_degree) = Self::log2(degree) else {
            return_errno_with_msg!(InvalidArgs, "tree degree is not a power of two");
        };
        if degree as usize > ENTRIES_PER_BLOCK {
            return_errno_with_msg!(InvalidArgs, "tree degree exceeds the entries of a block");
        }
        if height == 0 || height > MAX_TREE_HEIGHT {
            return_errno_with_msg!(InvalidArgs, "tree height out of range");
        }
        let shape = Self {
            degree,
            height,
            leaves,
            log2_degree,
        };
        if leaves == 0 || leaves > shape.capacity() {
            return_errno_with_msg!(InvalidArgs, "tree leaves exceed the capacity of the shape");
        }
        Ok(shape)
    }

    /// Creates the lowest shape of the given degree that covers `leaves`.
    pub fn fit(degree: u32, leaves: u64) -> Result<Self> {
        let Some(log2_degree) = Self::log2(degree) else {
            return_errno_with_msg!(InvalidArgs, "tree degree is not a power of two");
        };
        if leaves == 0 {
            return_errno_with_msg!(InvalidArgs, "tree without leaves");
        }
        let mut height = 1;
        while height < MAX_TREE_HEIGHT && (leaves - 1) >> (log2_degree * height) > 0 {
            height += 1;
        }
        Self::new(degree, height, leaves)
    }

    /// Returns `log2(degree)`, or `None` if `degree` is zero or not a power of two.
    pub fn log2(degree: u32) -> Option<u32> {
        if degree == 0 || !degree.is_power_of_two() {
            return None;
        }
        Some(degree.trailing_zeros())
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn leaves(&self) -> u64 {
        self.leaves
    }

    /// Returns `degree^height`, the number of leaves the shape can address.
    pub fn capacity(&self) -> u64 {
        let bits = self.log2_degree * self.height;
        if bits >= u64::BITS {
            u64::MAX
        } else {
            1u64 << bits
        }
    }

    /// Returns the child slot of `vba` at the 1-based `level`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `level` is not within `1..=height`.
    pub fn index(&self, vba: Vba, level: u32) -> usize {
        debug_assert!(level >= 1 && level <= self.height);
        ((vba >> (self.log2_degree * (level - 1))) & (self.degree as u64 - 1)) as usize
    }

    /// Returns the position of the level-`level` block on the path of `vba`,
    /// counting blocks of that level from left to right.
    pub fn position(&self, vba: Vba, level: u32) -> u64 {
        let shift = self.log2_degree * level;
        if shift >= u64::BITS {
            0
        } else {
            vba >> shift
        }
    }

    /// Returns the position of the parent of the block at `pos`, and the
    /// slot of that block within its parent.
    pub fn parent(&self, pos: u64) -> (u64, usize) {
        (
            pos >> self.log2_degree,
            (pos & (self.degree as u64 - 1)) as usize,
        )
    }

    /// Returns the first leaf addressed by the level-`level` block at `pos`.
    pub fn first_leaf(&self, pos: u64, level: u32) -> Vba {
        pos << (self.log2_degree * level)
    }

    /// Checks that `vba` is one of the leaves.
    pub fn check_vba(&self, vba: Vba) -> Result<()> {
        if vba >= self.leaves {
            return_errno_with_msg!(InvalidArgs, "virtual block address out of range");
        }
        Ok(())
    }
}
