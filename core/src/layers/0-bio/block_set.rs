use super::{Buf, BufMut, BufRef};
use crate::os::Mutex;
use crate::prelude::*;

use core::ops::Range;
use inherit_methods_macro::inherit_methods;

/// A fixed set of data blocks that can support random reads and writes.
///
/// # Thread safety
///
/// `BlockSet` is a data structure of interior mutability.
/// It is ok to perform I/O on a `BlockSet` concurrently in multiple threads.
/// `BlockSet` promises the atomicity of reading and writing individual blocks.
pub trait BlockSet: Sync + Send {
    /// Read one or multiple blocks at a specified position.
    fn read(&self, pos: BlockId, buf: BufMut) -> Result<()>;

    /// Write one or multiple blocks at a specified position.
    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()>;

    /// Get a subset of the blocks in the block set.
    fn subset(&self, range: Range<BlockId>) -> Result<Self>
    where
        Self: Sized;

    /// Ensure that blocks are persisted to the disk.
    fn flush(&self) -> Result<()>;

    /// Returns the number of blocks.
    fn nblocks(&self) -> usize;
}

macro_rules! impl_blockset_pointer {
    ($typ:ty,$from:tt,$wrap:path) => {
        #[inherit_methods(from = $from)]
        impl<T: BlockSet> BlockSet for $typ {
            fn read(&self, pos: BlockId, buf: BufMut) -> Result<()>;
            fn write(&self, pos: BlockId, buf: BufRef) -> Result<()>;
            fn flush(&self) -> Result<()>;
            fn nblocks(&self) -> usize;

            fn subset(&self, range: Range<BlockId>) -> Result<Self> {
                (**self).subset(range).map($wrap)
            }
        }
    };
}

impl_blockset_pointer!(Box<T>, "(**self)", Box::new);
impl_blockset_pointer!(Arc<T>, "(**self)", Arc::new);

/// A disk that impl `BlockSet`.
///
/// The `region` is the accessible subset.
#[derive(Clone)]
pub struct MemDisk {
    disk: Arc<Mutex<Buf>>,
    region: Range<BlockId>,
}

impl MemDisk {
    /// Create a `MemDisk` with the number of blocks.
    pub fn create(num_blocks: usize) -> Result<Self> {
        let blocks = Buf::alloc(num_blocks)?;
        Ok(Self {
            disk: Arc::new(Mutex::new(blocks)),
            region: Range {
                start: 0,
                end: num_blocks,
            },
        })
    }

    fn check_range(&self, pos: BlockId, nblocks: usize) -> Result<Range<usize>> {
        if pos + nblocks > self.region.len() {
            return_errno_with_msg!(IoFailed, "access beyond the end of `MemDisk`");
        }
        let start = (self.region.start + pos) * BLOCK_SIZE;
        Ok(start..start + nblocks * BLOCK_SIZE)
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pos: BlockId, mut buf: BufMut) -> Result<()> {
        let range = self.check_range(pos, buf.nblocks())?;
        let disk = self.disk.lock();
        buf.as_mut_slice().copy_from_slice(&disk.as_slice()[range]);
        Ok(())
    }

    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
        let range = self.check_range(pos, buf.nblocks())?;
        let mut disk = self.disk.lock();
        disk.as_mut_slice()[range].copy_from_slice(buf.as_slice());
        Ok(())
    }

    fn subset(&self, range: Range<BlockId>) -> Result<Self> {
        if self.region.start + range.end > self.region.end || range.start >= range.end {
            return_errno_with_msg!(InvalidArgs, "invalid range for `MemDisk::subset`");
        }
        Ok(Self {
            disk: self.disk.clone(),
            region: Range {
                start: self.region.start + range.start,
                end: self.region.start + range.end,
            },
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nblocks(&self) -> usize {
        self.region.len()
    }
}
