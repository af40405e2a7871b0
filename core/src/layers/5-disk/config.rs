//! The configuration of a new disk.
use crate::layers::tree::{TreeShape, ENTRIES_PER_BLOCK};
use crate::prelude::*;

use core::num::NonZeroUsize;
use serde::{Deserialize, Serialize};

/// How a disk is formatted.
///
/// The geometry ends up in the superblock and in every snapshot, so a
/// `Config` is only consulted by `CbeDisk::format`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The degree of the virtual block tree.
    pub vbd_degree: u32,
    /// The height of the virtual block tree.
    pub vbd_height: u32,
    /// The number of virtual blocks.
    pub vbd_leaves: u64,
    /// The degree of the free tree, whose height fits the device.
    pub free_tree_degree: u32,
    /// The number of node blocks kept in memory.
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vbd_degree: ENTRIES_PER_BLOCK as u32,
            vbd_height: 2,
            vbd_leaves: 4096,
            free_tree_degree: ENTRIES_PER_BLOCK as u32,
            cache_capacity: 1024,
        }
    }
}

impl Config {
    pub fn vbd_degree(mut self, degree: u32) -> Self {
        self.vbd_degree = degree;
        self
    }

    pub fn vbd_height(mut self, height: u32) -> Self {
        self.vbd_height = height;
        self
    }

    pub fn vbd_leaves(mut self, leaves: u64) -> Self {
        self.vbd_leaves = leaves;
        self
    }

    pub fn free_tree_degree(mut self, degree: u32) -> Self {
        self.free_tree_degree = degree;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Returns the shape of the virtual block tree.
    pub fn vbd_shape(&self) -> Result<TreeShape> {
        TreeShape::new(self.vbd_degree, self.vbd_height, self.vbd_leaves)
    }

    pub(super) fn cache_capacity_nonzero(&self) -> Result<NonZeroUsize> {
        let Some(capacity) = NonZeroUsize::new(self.cache_capacity) else {
            return_errno_with_msg!(InvalidArgs, "node cache without capacity");
        };
        Ok(capacity)
    }

    /// Checks that the configuration describes a valid disk.
    pub fn validate(&self) -> Result<()> {
        let _ = self.vbd_shape()?;
        // The height of the free tree depends on the device, so only the
        // degree is checked here.
        let _ = TreeShape::new(self.free_tree_degree, 1, 1)?;
        let _ = self.cache_capacity_nonzero()?;
        Ok(())
    }
}
