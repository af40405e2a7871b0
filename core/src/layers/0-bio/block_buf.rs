//! This module provides API to represent buffers whose
//! sizes are block aligned. The advantage of using the
//! APIs provided this module over Rust std's counterparts
//! is to ensure the invariance of block-aligned length
//! at type level, eliminating the need for runtime check.
//!
//! There are three main types:
//! * `Buf`: A owned buffer backed by `Vec<u8>`.
//! * `BufRef`: An immutably-borrowed buffer backed by `&[u8]`.
//! * `BufMut`: A mutably-borrowed buffer backed by `&mut [u8]`.
use crate::prelude::*;

use core::convert::TryFrom;

/// A owned buffer whose length is a multiple of the block size.
pub struct Buf(Vec<u8>);

impl Buf {
    /// Allocate specific number of blocks as memory buffer.
    pub fn alloc(num_blocks: usize) -> Result<Self> {
        if num_blocks == 0 {
            return_errno_with_msg!(
                InvalidArgs,
                "num_blocks must be greater than 0 for allocation"
            )
        }
        Ok(Self(alloc::vec![0u8; num_blocks * BLOCK_SIZE]))
    }

    /// Returns the number of blocks of owned buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }

    /// Returns the immutable slice of owned buffer.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Returns the mutable slice of owned buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }

    /// Converts to immutably-borrowed buffer `BufRef`.
    pub fn as_ref(&self) -> BufRef<'_> {
        BufRef(self.as_slice())
    }

    /// Coverts to mutably-borrowed buffer `BufMut`.
    pub fn as_mut(&mut self) -> BufMut<'_> {
        BufMut(self.as_mut_slice())
    }
}

impl Clone for Buf {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// An immutably-borrowed buffer whose length is a multiple of the block size.
#[derive(Clone, Copy)]
pub struct BufRef<'a>(&'a [u8]);

impl<'a> BufRef<'a> {
    /// Returns the immutable slice of borrowed buffer.
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    /// Returns the number of blocks of borrowed buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }

    /// Returns an iterator for immutable buffers of `BLOCK_SIZE`.
    pub fn iter(&self) -> BufIter<'a> {
        BufIter {
            buf: BufRef(self.as_slice()),
            offset: 0,
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for BufRef<'a> {
    type Error = crate::error::Error;

    fn try_from(buf: &'a [u8]) -> Result<Self> {
        if buf.is_empty() {
            return_errno_with_msg!(InvalidArgs, "empty buf in `BufRef::try_from`");
        }
        if buf.len() % BLOCK_SIZE != 0 {
            return_errno_with_msg!(
                NotBlockSizeAligned,
                "buf not block size aligned `BufRef::try_from`"
            );
        }
        Ok(Self(buf))
    }
}

/// A mutably-borrowed buffer whose length is a multiple of the block size.
pub struct BufMut<'a>(&'a mut [u8]);

impl<'a> BufMut<'a> {
    /// Returns the immutable slice of borrowed buffer.
    pub fn as_slice(&self) -> &[u8] {
        &*self.0
    }

    /// Returns the mutable slice of borrowed buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut *self.0
    }

    /// Returns the number of blocks of borrowed buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }
}

impl<'a> TryFrom<&'a mut [u8]> for BufMut<'a> {
    type Error = crate::error::Error;

    fn try_from(buf: &'a mut [u8]) -> Result<Self> {
        if buf.is_empty() {
            return_errno_with_msg!(InvalidArgs, "empty buf in `BufMut::try_from`");
        }
        if buf.len() % BLOCK_SIZE != 0 {
            return_errno_with_msg!(
                NotBlockSizeAligned,
                "buf not block size aligned `BufMut::try_from`"
            );
        }
        Ok(Self(buf))
    }
}

/// Iterator for immutable buffers of `BLOCK_SIZE`.
pub struct BufIter<'a> {
    buf: BufRef<'a>,
    offset: usize,
}

impl<'a> Iterator for BufIter<'a> {
    type Item = BufRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.0.len() {
            return None;
        }

        let offset = self.offset;
        self.offset += BLOCK_SIZE;
        BufRef::try_from(&self.buf.0[offset..offset + BLOCK_SIZE]).ok()
    }
}
