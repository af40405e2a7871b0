//! The Consistent Block Encrypter as a block device.
//!
//! API: format(), open(), read(), write(), sync(), read_snapshot(),
//! snapshots(), keep_snapshot(), release_snapshot(), discard_snapshot(),
//! submit(), total_blocks()
//!
//! Responsible for managing the virtual block tree, the free tree that
//! allocates its blocks, the snapshot directory and the superblock ring.
//! Writes go to blocks of the current, unsealed generation; `sync` seals
//! the generation into a snapshot and commits it to the next superblock
//! slot, which is the only point where a new state becomes durable.
use super::{Config, Operation, Primitive, Request, RequestPool, Splitter};
use crate::layers::bio::{BlockSet, BufMut, BufRef};
use crate::layers::free::{FreeTree, ReclaimFence};
use crate::layers::snapshot::{Snapshot, SnapshotDirectory, INVALID_SNAPSHOT_ID};
use crate::layers::superblock::{
    FreeTreeRoot, KeyMaterial, SuperBlock, SuperBlockRing, NUM_KEYS, NUM_SUPER_BLOCKS,
};
use crate::layers::tree::{
    translate, BlockCipher, CowTree, Generation, InnerNode, NodeCache, NodeStore, TreeShape, Vba,
    INVALID_KEY_ID, INVALID_VBA,
};
use crate::os::{Mutex, RwLock};
use crate::prelude::*;

use core::ops::Range;

/// The id of the first data key.
const FIRST_KEY_ID: u32 = 1;

/// An encrypted, versioned, copy-on-write block device.
pub struct CbeDisk<D: BlockSet> {
    inner: Arc<DiskInner<D>>,
}

struct DiskInner<D: BlockSet> {
    disk: D,
    cache: NodeCache,
    cipher: BlockCipher,
    keys: [KeyMaterial; NUM_KEYS],
    /// The degree of the virtual block tree, shared by every snapshot.
    tree_degree: u32,
    /// The snapshots retained in memory. Snapshot readers hold it shared,
    /// so a snapshot cannot be discarded while it is being read.
    directory: RwLock<SnapshotDirectory>,
    state: Mutex<WriterState<D>>,
    pool: Mutex<RequestPool>,
}

/// Everything only the single writer touches.
struct WriterState<D> {
    trees: Trees,
    ring: SuperBlockRing<D>,
    /// The snapshots of the last committed superblock.
    committed: SnapshotDirectory,
}

/// The two trees of the current generation.
struct Trees {
    vbd: CowTree<InnerNode>,
    free: FreeTree,
    current_gen: Generation,
    next_snapshot_id: u32,
}

impl<D: BlockSet> CbeDisk<D> {
    /// Creates a new device on `disk`.
    ///
    /// Generation 0, an empty tree, is committed before this returns.
    pub fn format(disk: D, config: Config) -> Result<Self> {
        config.validate()?;
        let vbd_shape = config.vbd_shape()?;
        if disk.nblocks() <= NUM_SUPER_BLOCKS {
            return_errno_with_msg!(InvalidArgs, "disk too small for the superblock ring");
        }

        let keys = [KeyMaterial::random(FIRST_KEY_ID)?, KeyMaterial::empty()];
        let cache = NodeCache::new(config.cache_capacity_nonzero()?);
        let cipher = BlockCipher::new(keys[0].skcipher_key());

        let (trees, superblock) = {
            let store = NodeStore::new(&disk, &cache, &cipher);
            let free = FreeTree::format(
                &store,
                disk.nblocks() as u64,
                config.free_tree_degree,
                NUM_SUPER_BLOCKS as u64,
            )?;
            let mut trees = Trees {
                vbd: CowTree::new(vbd_shape, InnerNode::invalid()),
                free,
                current_gen: 0,
                next_snapshot_id: 0,
            };
            let empty = SnapshotDirectory::new();
            let superblock = trees.seal(&store, &empty, &empty, &keys)?;
            trees.current_gen = superblock.last_secured_gen + 1;
            trees.next_snapshot_id = superblock.next_snapshot_id;
            (trees, superblock)
        };
        disk.flush()?;
        let ring = SuperBlockRing::format(disk.subset(0..NUM_SUPER_BLOCKS)?, &superblock)?;
        info!(
            "[CbeDisk] formatted {} blocks with {} virtual blocks",
            disk.nblocks(),
            vbd_shape.leaves()
        );

        Ok(Self::new(disk, cache, cipher, keys, ring, superblock, trees))
    }

    /// Opens the device on `disk` at its last committed generation.
    ///
    /// The geometry comes from the superblock; of `config`, only the cache
    /// capacity applies.
    pub fn open(disk: D, config: Config) -> Result<Self> {
        let cache = NodeCache::new(config.cache_capacity_nonzero()?);
        let (ring, superblock) = SuperBlockRing::recover(disk.subset(0..NUM_SUPER_BLOCKS)?)?;
        let Some(active) = superblock.snapshots.active().copied() else {
            error!(
                "[CbeDisk] active snapshot {} of generation {} not found",
                superblock.snapshots.active_id(),
                superblock.last_secured_gen
            );
            return_errno_with_msg!(NoValidSuperBlock, "superblock without active snapshot");
        };

        let vbd_shape = TreeShape::new(superblock.tree_degree, active.height, active.leaves)?;
        let free_shape = superblock.free_tree.shape()?;
        if free_shape.leaves() > disk.nblocks() as u64 {
            return_errno_with_msg!(InvalidArgs, "disk smaller than its free tree");
        }

        let trees = Trees {
            vbd: CowTree::new(vbd_shape, active.root()),
            free: FreeTree::open(
                free_shape,
                superblock.free_tree.node,
                NUM_SUPER_BLOCKS as u64,
            ),
            current_gen: superblock.last_secured_gen + 1,
            next_snapshot_id: superblock.next_snapshot_id,
        };
        let keys = superblock.keys;
        let cipher = BlockCipher::new(keys[0].skcipher_key());
        {
            let store = NodeStore::new(&disk, &cache, &cipher);
            let roots = [
                ("virtual block", active.root()),
                ("free", superblock.free_tree.node),
            ];
            for (tree, root) in roots {
                if !root.is_valid() || store.read_node(&root).is_err() {
                    error!(
                        "[CbeDisk] root of the {} tree at block {} of generation {} is damaged",
                        tree, root.pba, superblock.last_secured_gen
                    );
                    return_errno_with_msg!(NoValidSuperBlock, "damaged tree root");
                }
            }
        }
        info!(
            "[CbeDisk] opened generation {} at snapshot {}",
            superblock.last_secured_gen, active.id
        );

        Ok(Self::new(disk, cache, cipher, keys, ring, superblock, trees))
    }

    fn new(
        disk: D,
        cache: NodeCache,
        cipher: BlockCipher,
        keys: [KeyMaterial; NUM_KEYS],
        ring: SuperBlockRing<D>,
        superblock: SuperBlock,
        trees: Trees,
    ) -> Self {
        let inner = DiskInner {
            disk,
            cache,
            cipher,
            keys,
            tree_degree: superblock.tree_degree,
            directory: RwLock::new(superblock.snapshots.clone()),
            state: Mutex::new(WriterState {
                trees,
                ring,
                committed: superblock.snapshots,
            }),
            pool: Mutex::new(RequestPool::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Reads the blocks starting at `vba` of the current generation.
    ///
    /// Blocks that were never written read as zeros.
    pub fn read(&self, vba: Vba, mut buf: BufMut) -> Result<()> {
        let store = self.inner.store();
        let state = self.inner.state.lock();
        let vbd = &state.trees.vbd;
        check_range(vbd.shape(), vba, buf.nblocks())?;

        for (nth, block) in buf
            .as_mut_slice()
            .chunks_exact_mut(BLOCK_SIZE)
            .enumerate()
        {
            let node = vbd
                .lookup(&store, vba + nth as u64)?
                .unwrap_or_else(InnerNode::invalid);
            store.read_data(&node, BufMut::try_from(block)?)?;
        }
        Ok(())
    }

    /// Writes the blocks starting at `vba`. The write is durable after the
    /// next `sync`.
    pub fn write(&self, vba: Vba, buf: BufRef) -> Result<()> {
        let store = self.inner.store();
        let mut state = self.inner.state.lock();
        check_range(state.trees.vbd.shape(), vba, buf.nblocks())?;

        let fence = self.inner.fence(&state);
        let key_id = self.inner.keys[0].id;
        for (nth, block) in buf.iter().enumerate() {
            state
                .trees
                .write_block(&store, &fence, key_id, vba + nth as u64, block)?;
        }
        Ok(())
    }

    /// Seals the current generation into a new snapshot and commits it.
    ///
    /// If every snapshot of the directory is kept, this fails with
    /// `SnapshotDirFull` and changes nothing. Other failures before the
    /// commit leave the generation open, so a retry seals it again. A failed
    /// commit may still have reached the disk, so the generation is closed
    /// anyway and writes move on to the next one.
    pub fn sync(&self) -> Result<()> {
        let store = self.inner.store();
        let mut state = self.inner.state.lock();
        let mut directory = self.inner.directory.write();

        let gen = state.trees.current_gen;
        let WriterState {
            trees,
            ring,
            committed,
        } = &mut *state;
        let superblock = trees.seal(&store, &directory, committed, &self.inner.keys)?;
        self.inner.disk.flush()?;
        if let Err(e) = ring.commit(&superblock) {
            // The slot may have taken the generation anyway, so nothing of it
            // is rewritten in place from now on
            error!("[CbeDisk] commit of generation {} failed: {}", gen, e);
            trees.current_gen = gen + 1;
            trees.next_snapshot_id = superblock.next_snapshot_id;
            return Err(e);
        }

        *directory = superblock.snapshots.clone();
        *committed = superblock.snapshots;
        trees.current_gen = gen + 1;
        trees.next_snapshot_id = superblock.next_snapshot_id;
        debug!(
            "[CbeDisk] sealed generation {} into snapshot {}",
            gen,
            directory.active_id()
        );
        Ok(())
    }

    /// Reads the blocks starting at `vba` as of the snapshot `id`.
    pub fn read_snapshot(&self, id: u32, vba: Vba, mut buf: BufMut) -> Result<()> {
        let store = self.inner.store();
        let directory = self.inner.directory.read();
        let Some(snapshot) = directory.get(id) else {
            return_errno_with_msg!(NotFound, "snapshot to read not found");
        };
        let shape = TreeShape::new(self.inner.tree_degree, snapshot.height, snapshot.leaves)?;
        check_range(&shape, vba, buf.nblocks())?;

        let root = snapshot.root();
        for (nth, block) in buf
            .as_mut_slice()
            .chunks_exact_mut(BLOCK_SIZE)
            .enumerate()
        {
            let node = translate::<InnerNode, D>(&store, &shape, &root, vba + nth as u64)?
                .unwrap_or_else(InnerNode::invalid);
            store.read_data(&node, BufMut::try_from(block)?)?;
        }
        Ok(())
    }

    /// Returns the retained snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.inner.directory.read().iter().copied().collect();
        snapshots.sort_by_key(|snapshot| (snapshot.gen, snapshot.id));
        snapshots
    }

    /// Pins the snapshot `id` against eviction.
    pub fn keep_snapshot(&self, id: u32) -> Result<()> {
        self.inner.directory.write().set_keep(id, true)
    }

    /// Unpins the snapshot `id`.
    pub fn release_snapshot(&self, id: u32) -> Result<()> {
        self.inner.directory.write().set_keep(id, false)
    }

    /// Discards the snapshot `id`. Its blocks become reusable once a later
    /// `sync` has committed the discard.
    pub fn discard_snapshot(&self, id: u32) -> Result<()> {
        let mut directory = self.inner.directory.write();
        if id == directory.active_id() {
            warn!("[CbeDisk] refuse to discard the active snapshot {}", id);
            return_errno_with_msg!(InvalidArgs, "cannot discard the active snapshot");
        }
        let discarded = directory.discard(id)?;
        debug!(
            "[CbeDisk] discard snapshot {} of generation {}",
            discarded.id, discarded.gen
        );
        Ok(())
    }

    /// Executes a client request over the payload `buf`, returning the
    /// request with its completion status.
    ///
    /// The payload of a read or write lies at `request.offset` in `buf`.
    pub fn submit(&self, request: Request, buf: &mut [u8]) -> Result<Request> {
        let primitives = Splitter::new().split(&request)?;
        if request.operation != Operation::Sync {
            let last = request.block_number + request.count as u64 - 1;
            let _ = payload_range(&request, last, buf.len())?;
        }
        self.inner.pool.lock().alloc(request)?;

        let mut completed = None;
        for mut prim in primitives {
            match self.execute(&request, &prim, buf) {
                Ok(()) => prim.success = true,
                Err(e) => {
                    warn!(
                        "[CbeDisk] {:?} primitive of block {} failed: {}",
                        prim.operation, prim.block_number, e
                    );
                    prim.success = false;
                }
            }
            completed = self.inner.pool.lock().mark_completed(&prim)?;
        }
        let Some(completed) = completed else {
            return_errno_with_msg!(InvalidArgs, "request left incomplete");
        };
        Ok(completed)
    }

    fn execute(&self, request: &Request, prim: &Primitive, buf: &mut [u8]) -> Result<()> {
        match prim.operation {
            Operation::Read => {
                let range = payload_range(request, prim.block_number, buf.len())?;
                self.read(prim.block_number, BufMut::try_from(&mut buf[range])?)
            }
            Operation::Write => {
                let range = payload_range(request, prim.block_number, buf.len())?;
                self.write(prim.block_number, BufRef::try_from(&buf[range])?)
            }
            Operation::Sync => self.sync(),
            Operation::Invalid => return_errno_with_msg!(InvalidArgs, "invalid primitive"),
        }
    }

    /// Returns the number of virtual blocks.
    pub fn total_blocks(&self) -> usize {
        self.inner.state.lock().trees.vbd.shape().leaves() as usize
    }

    /// Returns the generation writes currently go to.
    pub fn current_generation(&self) -> Generation {
        self.inner.state.lock().trees.current_gen
    }
}

impl<D: BlockSet> Clone for CbeDisk<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: BlockSet> DiskInner<D> {
    fn store(&self) -> NodeStore<'_, D> {
        NodeStore::new(&self.disk, &self.cache, &self.cipher)
    }

    /// Returns the fence of the snapshots retained in memory or by the last
    /// commit. A crash falls back to the latter, so its snapshots stay
    /// readable until a newer commit drops them.
    fn fence(&self, state: &WriterState<D>) -> ReclaimFence {
        let directory = self.directory.read();
        ReclaimFence::from_directories([&*directory, &state.committed])
    }
}

impl Trees {
    /// Writes one block at `vba` in the current generation.
    fn write_block<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        fence: &ReclaimFence,
        key_id: u32,
        vba: Vba,
        block: BufRef,
    ) -> Result<()> {
        let gen = self.current_gen;
        let old = self
            .vbd
            .lookup(store, vba)?
            .unwrap_or_else(InnerNode::invalid);
        // No committed state references a block of the current generation
        if old.is_valid() && old.gen == gen {
            *self.vbd.entry_mut(store, vba)? = store.write_data(old.pba, gen, block)?;
            return Ok(());
        }

        let pba = self.free.alloc(store, fence, gen, vba, key_id)?;
        let written = store.write_data(pba, gen, block).and_then(|node| {
            *self.vbd.entry_mut(store, vba)? = node;
            Ok(())
        });
        if let Err(e) = written {
            self.free.release(store, pba, gen)?;
            return Err(e);
        }
        // Vacate last, so a failure leaks the old block instead of freeing it
        // while the tree still points at it
        if old.is_valid() {
            self.free.vacate(store, old.pba, gen)?;
        }
        Ok(())
    }

    /// Writes back both trees in the current generation and returns the
    /// superblock to commit. `directory` is the working directory, which
    /// gets the new snapshot.
    fn seal<D: BlockSet>(
        &mut self,
        store: &NodeStore<'_, D>,
        directory: &SnapshotDirectory,
        committed: &SnapshotDirectory,
        keys: &[KeyMaterial; NUM_KEYS],
    ) -> Result<SuperBlock> {
        let gen = self.current_gen;
        if !directory.can_insert() {
            warn!(
                "[CbeDisk] cannot seal generation {}: every snapshot is kept",
                gen
            );
            return_errno_with_msg!(SnapshotDirFull, "every snapshot of the directory is kept");
        }
        let fence = ReclaimFence::from_directories([directory, committed]);

        // Every snapshot gets a root of its own generation
        self.vbd.touch_root(store)?;
        for (level, pos) in self.vbd.pending_relocations(gen) {
            let pba = self
                .free
                .alloc(store, &fence, gen, INVALID_VBA, INVALID_KEY_ID)?;
            let old = self.vbd.relocate(level, pos, pba, gen);
            if old.is_valid() {
                self.free.vacate(store, old.pba, gen)?;
            }
        }
        let root = self.vbd.write_back(store, gen)?;

        let shape = *self.vbd.shape();
        let id = unused_snapshot_id(self.next_snapshot_id, [directory, committed]);
        let mut snapshots = directory.clone();
        let snapshot = Snapshot::new(&root, shape.leaves(), shape.height(), id);
        if let Some(evicted) = snapshots.insert(snapshot)? {
            info!(
                "[CbeDisk] snapshot {} of generation {} evicted by generation {}",
                evicted.id, evicted.gen, gen
            );
        }

        let free_root = self.free.flush(store, &fence, gen)?;
        Ok(SuperBlock {
            keys: *keys,
            snapshots,
            last_secured_gen: gen,
            next_snapshot_id: id.wrapping_add(1),
            tree_degree: shape.degree(),
            free_tree: FreeTreeRoot::new(free_root, self.free.shape()),
        })
    }
}

/// Returns the first id from `start` on, wrapping around, that is valid and
/// not taken by a snapshot of `directories`.
fn unused_snapshot_id(start: u32, directories: [&SnapshotDirectory; 2]) -> u32 {
    let mut id = start;
    while id == INVALID_SNAPSHOT_ID || directories.iter().any(|dir| dir.get(id).is_some()) {
        id = id.wrapping_add(1);
    }
    id
}

fn check_range(shape: &TreeShape, vba: Vba, nblocks: usize) -> Result<()> {
    match vba.checked_add(nblocks as u64) {
        Some(end) if end <= shape.leaves() => Ok(()),
        _ => return_errno_with_msg!(InvalidArgs, "virtual blocks out of range"),
    }
}

/// Returns where the payload of block `block_number` of `request` lies in
/// a buffer of `len` bytes.
fn payload_range(request: &Request, block_number: u64, len: usize) -> Result<Range<usize>> {
    let start = block_number
        .checked_sub(request.block_number)
        .and_then(|nth| nth.checked_mul(BLOCK_SIZE as u64))
        .and_then(|off| off.checked_add(request.offset));
    match start {
        Some(start) if start + BLOCK_SIZE as u64 <= len as u64 => {
            Ok(start as usize..start as usize + BLOCK_SIZE)
        }
        _ => return_errno_with_msg!(InvalidArgs, "request payload out of the buffer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::{Buf, MemDisk};
    use crate::layers::free::BlockState;
    use crate::layers::snapshot::NUM_SNAPSHOTS;
    use crate::layers::tree::Pba;

    fn small_config() -> Config {
        Config::default()
            .vbd_degree(4)
            .vbd_height(2)
            .vbd_leaves(16)
    }

    fn filled(byte: u8) -> Result<Buf> {
        let mut buf = Buf::alloc(1)?;
        buf.as_mut_slice().fill(byte);
        Ok(buf)
    }

    fn read_block<D: BlockSet>(disk: &CbeDisk<D>, vba: Vba) -> Result<Buf> {
        let mut buf = Buf::alloc(1)?;
        disk.read(vba, buf.as_mut())?;
        Ok(buf)
    }

    fn read_snapshot_block<D: BlockSet>(disk: &CbeDisk<D>, id: u32, vba: Vba) -> Result<Buf> {
        let mut buf = Buf::alloc(1)?;
        disk.read_snapshot(id, vba, buf.as_mut())?;
        Ok(buf)
    }

    fn snapshot_ids<D: BlockSet>(disk: &CbeDisk<D>) -> Vec<u32> {
        disk.snapshots().iter().map(|snapshot| snapshot.id).collect()
    }

    fn pba_of<D: BlockSet>(disk: &CbeDisk<D>, vba: Vba) -> Result<Pba> {
        let store = disk.inner.store();
        let state = disk.inner.state.lock();
        Ok(state.trees.vbd.lookup(&store, vba)?.unwrap().pba)
    }

    fn state_of<D: BlockSet>(disk: &CbeDisk<D>, pba: Pba) -> Result<BlockState> {
        let store = disk.inner.store();
        let state = disk.inner.state.lock();
        let fence = disk.inner.fence(&state);
        state.trees.free.state(&store, pba, &fence)
    }

    fn num_live<D: BlockSet>(disk: &CbeDisk<D>) -> Result<usize> {
        let mut live = 0;
        for pba in 0..disk.inner.disk.nblocks() as Pba {
            if state_of(disk, pba)? == BlockState::Live {
                live += 1;
            }
        }
        Ok(live)
    }

    /// The next failures to inject, as the number of calls to let through
    /// before failing one.
    #[derive(Default)]
    struct Faults {
        write: Option<usize>,
        flush: Option<usize>,
    }

    /// A `MemDisk` that fails a write or a flush on demand. Subsets share
    /// the faults of the disk they come from.
    #[derive(Clone)]
    struct FaultyDisk {
        inner: MemDisk,
        faults: Arc<Mutex<Faults>>,
    }

    impl FaultyDisk {
        fn new(inner: MemDisk) -> Self {
            Self {
                inner,
                faults: Arc::new(Mutex::new(Faults::default())),
            }
        }

        fn fail_write(&self, skip: usize) {
            self.faults.lock().write = Some(skip);
        }

        fn fail_flush(&self, skip: usize) {
            self.faults.lock().flush = Some(skip);
        }
    }

    fn trips(fault: &mut Option<usize>) -> bool {
        match fault {
            Some(0) => {
                *fault = None;
                true
            }
            Some(skip) => {
                *skip -= 1;
                false
            }
            None => false,
        }
    }

    impl BlockSet for FaultyDisk {
        fn read(&self, pos: BlockId, buf: BufMut) -> Result<()> {
            self.inner.read(pos, buf)
        }

        fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
            if trips(&mut self.faults.lock().write) {
                return_errno_with_msg!(IoFailed, "write failure of the faulty disk");
            }
            self.inner.write(pos, buf)
        }

        fn subset(&self, range: Range<BlockId>) -> Result<Self> {
            Ok(Self {
                inner: self.inner.subset(range)?,
                faults: self.faults.clone(),
            })
        }

        fn flush(&self) -> Result<()> {
            if trips(&mut self.faults.lock().flush) {
                return_errno_with_msg!(IoFailed, "flush failure of the faulty disk");
            }
            self.inner.flush()
        }

        fn nblocks(&self) -> usize {
            self.inner.nblocks()
        }
    }

    #[test]
    fn write_sync_and_reopen() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let disk = CbeDisk::format(mem.clone(), small_config())?;
        assert_eq!(disk.total_blocks(), 16);
        assert_eq!(disk.current_generation(), 1);
        assert_eq!(read_block(&disk, 1)?.as_slice(), filled(0)?.as_slice());

        disk.write(1, filled(0xa1)?.as_ref())?;
        assert_eq!(read_block(&disk, 1)?.as_slice(), filled(0xa1)?.as_slice());
        disk.sync()?;
        disk.write(2, filled(0xb2)?.as_ref())?;
        drop(disk);

        let disk = CbeDisk::open(mem.clone(), small_config())?;
        assert_eq!(disk.current_generation(), 2);
        assert_eq!(snapshot_ids(&disk), vec![0, 1]);
        assert_eq!(read_block(&disk, 1)?.as_slice(), filled(0xa1)?.as_slice());
        assert_eq!(read_block(&disk, 2)?.as_slice(), filled(0)?.as_slice());

        disk.write(15, filled(0xc3)?.as_ref())?;
        disk.sync()?;
        let disk = CbeDisk::open(mem.clone(), small_config().cache_capacity(7))?;
        assert_eq!(disk.inner.cache.capacity(), 7);
        assert_eq!(read_block(&disk, 15)?.as_slice(), filled(0xc3)?.as_slice());
        assert_eq!(read_block(&disk, 1)?.as_slice(), filled(0xa1)?.as_slice());

        let no_cache = small_config().cache_capacity(0);
        let err = CbeDisk::open(mem, no_cache).err().unwrap();
        assert_eq!(err.errno(), InvalidArgs);
        Ok(())
    }

    #[test]
    fn multi_block_io() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(64)?, small_config())?;
        let mut data = Buf::alloc(4)?;
        for (nth, block) in data.as_mut_slice().chunks_mut(BLOCK_SIZE).enumerate() {
            block.fill(nth as u8 + 1);
        }
        disk.write(6, data.as_ref())?;
        // Rewriting within a generation reuses the same blocks
        disk.write(6, data.as_ref())?;

        let mut out = Buf::alloc(4)?;
        disk.read(6, out.as_mut())?;
        assert_eq!(out.as_slice(), data.as_slice());

        assert_eq!(disk.read(14, out.as_mut()).unwrap_err().errno(), InvalidArgs);
        assert_eq!(disk.write(13, data.as_ref()).unwrap_err().errno(), InvalidArgs);
        Ok(())
    }

    #[test]
    fn read_older_snapshots() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(64)?, small_config())?;
        disk.write(3, filled(1)?.as_ref())?;
        disk.sync()?;
        disk.write(3, filled(2)?.as_ref())?;
        disk.sync()?;
        disk.write(3, filled(3)?.as_ref())?;

        assert_eq!(read_block(&disk, 3)?.as_slice(), filled(3)?.as_slice());
        assert_eq!(read_snapshot_block(&disk, 2, 3)?.as_slice(), filled(2)?.as_slice());
        assert_eq!(read_snapshot_block(&disk, 1, 3)?.as_slice(), filled(1)?.as_slice());
        assert_eq!(read_snapshot_block(&disk, 0, 3)?.as_slice(), filled(0)?.as_slice());

        let generations: Vec<Generation> = disk.snapshots().iter().map(|s| s.gen).collect();
        assert_eq!(generations, vec![0, 1, 2]);

        disk.discard_snapshot(1)?;
        let err = read_snapshot_block(&disk, 1, 3).unwrap_err();
        assert_eq!(err.errno(), NotFound);
        Ok(())
    }

    #[test]
    fn manage_snapshots() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(64)?, small_config())?;
        disk.sync()?;
        disk.sync()?;
        assert_eq!(snapshot_ids(&disk), vec![0, 1, 2]);

        assert_eq!(disk.discard_snapshot(2).unwrap_err().errno(), InvalidArgs);
        assert_eq!(disk.discard_snapshot(7).unwrap_err().errno(), NotFound);
        assert_eq!(disk.keep_snapshot(7).unwrap_err().errno(), NotFound);

        disk.keep_snapshot(1)?;
        assert!(disk.snapshots()[1].keep());
        disk.release_snapshot(1)?;
        assert!(!disk.snapshots()[1].keep());

        disk.discard_snapshot(0)?;
        assert_eq!(snapshot_ids(&disk), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn evict_oldest_snapshots() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(512)?, small_config())?;
        disk.keep_snapshot(0)?;
        for _ in 0..NUM_SNAPSHOTS + 1 {
            disk.sync()?;
        }
        let ids = snapshot_ids(&disk);
        assert_eq!(ids.len(), NUM_SNAPSHOTS);
        assert_eq!(ids[0], 0);
        assert!(!ids.contains(&1) && !ids.contains(&2));
        assert_eq!(*ids.last().unwrap(), NUM_SNAPSHOTS as u32 + 1);
        Ok(())
    }

    #[test]
    fn full_directory_fails_the_sync() -> Result<()> {
        let mem = MemDisk::create(512)?;
        let disk = CbeDisk::format(mem.clone(), small_config())?;
        for _ in 1..NUM_SNAPSHOTS {
            disk.sync()?;
        }
        for id in snapshot_ids(&disk) {
            disk.keep_snapshot(id)?;
        }

        disk.write(0, filled(0x55)?.as_ref())?;
        assert_eq!(disk.sync().unwrap_err().errno(), SnapshotDirFull);
        assert_eq!(disk.snapshots().len(), NUM_SNAPSHOTS);
        assert_eq!(read_block(&disk, 0)?.as_slice(), filled(0x55)?.as_slice());

        disk.release_snapshot(5)?;
        disk.sync()?;
        let ids = snapshot_ids(&disk);
        assert!(!ids.contains(&5));
        assert!(ids.contains(&(NUM_SNAPSHOTS as u32)));

        let disk = CbeDisk::open(mem, small_config())?;
        assert_eq!(read_block(&disk, 0)?.as_slice(), filled(0x55)?.as_slice());
        Ok(())
    }

    #[test]
    fn vacated_blocks_wait_for_discards() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(64)?, small_config())?;
        disk.write(0, filled(1)?.as_ref())?;
        disk.sync()?;
        let pba = pba_of(&disk, 0)?;
        assert_eq!(state_of(&disk, pba)?, BlockState::Live);

        disk.write(0, filled(2)?.as_ref())?;
        assert_eq!(state_of(&disk, pba)?, BlockState::Vacated(2));
        disk.sync()?;

        // Reuse waits until every retained snapshot is newer than generation 2
        disk.discard_snapshot(0)?;
        disk.discard_snapshot(1)?;
        disk.sync()?;
        assert_eq!(state_of(&disk, pba)?, BlockState::Vacated(2));

        // Until the discard is committed
        disk.discard_snapshot(2)?;
        assert_eq!(state_of(&disk, pba)?, BlockState::Vacated(2));

        disk.sync()?;
        assert_eq!(state_of(&disk, pba)?, BlockState::Reclaimable);
        Ok(())
    }

    #[test]
    fn space_is_recycled() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(128)?, small_config())?;
        let mut latest = [0u8; 16];
        for round in 0..200u32 {
            let vba = (round * 7 % 16) as Vba;
            let byte = (round % 251) as u8 + 1;
            disk.write(vba, filled(byte)?.as_ref())?;
            latest[vba as usize] = byte;
            disk.sync()?;

            let active = disk.inner.directory.read().active_id();
            for snapshot in disk.snapshots() {
                if snapshot.id != active {
                    disk.discard_snapshot(snapshot.id)?;
                }
            }
        }
        for (vba, byte) in latest.iter().enumerate() {
            assert_eq!(
                read_block(&disk, vba as Vba)?.as_slice(),
                filled(*byte)?.as_slice()
            );
        }
        Ok(())
    }

    #[test]
    fn out_of_disk() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(24)?, small_config())?;
        let data = Buf::alloc(16)?;
        assert_eq!(disk.write(0, data.as_ref()).unwrap_err().errno(), OutOfDisk);
        assert!(CbeDisk::format(MemDisk::create(8)?, small_config()).is_err());
        Ok(())
    }

    #[test]
    fn tampered_block_fails_verification() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let disk = CbeDisk::format(mem.clone(), small_config())?;
        disk.write(4, filled(0x44)?.as_ref())?;
        disk.sync()?;

        let pba = pba_of(&disk, 4)?;
        mem.write(pba as BlockId, filled(0x00)?.as_ref())?;
        assert_eq!(
            read_block(&disk, 4).unwrap_err().errno(),
            DigestMismatch
        );
        Ok(())
    }

    #[test]
    fn damaged_root_fails_mount() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let disk = CbeDisk::format(mem.clone(), small_config())?;
        disk.write(0, filled(1)?.as_ref())?;
        disk.sync()?;
        let vbd_root = disk.snapshots().last().unwrap().root();
        let free_root = *disk.inner.state.lock().trees.free.root();
        drop(disk);

        for root in [vbd_root, free_root] {
            let pba = root.pba as BlockId;
            let mut saved = Buf::alloc(1)?;
            mem.read(pba, saved.as_mut())?;
            mem.write(pba, filled(0)?.as_ref())?;
            let err = CbeDisk::open(mem.clone(), small_config()).err().unwrap();
            assert_eq!(err.errno(), NoValidSuperBlock);

            mem.write(pba, saved.as_ref())?;
            let disk = CbeDisk::open(mem.clone(), small_config())?;
            assert_eq!(read_block(&disk, 0)?.as_slice(), filled(1)?.as_slice());
        }
        Ok(())
    }

    #[test]
    fn failed_data_write_is_rolled_back() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let faulty = FaultyDisk::new(mem.clone());
        let disk = CbeDisk::format(faulty.clone(), small_config())?;
        disk.write(0, filled(1)?.as_ref())?;
        disk.sync()?;
        let old = pba_of(&disk, 0)?;
        let live = num_live(&disk)?;

        faulty.fail_write(0);
        let err = disk.write(0, filled(2)?.as_ref()).unwrap_err();
        assert_eq!(err.errno(), IoFailed);
        // Neither the new block leaks nor the old one is vacated
        assert_eq!(pba_of(&disk, 0)?, old);
        assert_eq!(state_of(&disk, old)?, BlockState::Live);
        assert_eq!(num_live(&disk)?, live);
        assert_eq!(read_block(&disk, 0)?.as_slice(), filled(1)?.as_slice());

        disk.write(0, filled(3)?.as_ref())?;
        assert_ne!(pba_of(&disk, 0)?, old);
        assert_eq!(state_of(&disk, old)?, BlockState::Vacated(2));
        assert_eq!(num_live(&disk)?, live);
        disk.sync()?;
        assert_eq!(read_snapshot_block(&disk, 1, 0)?.as_slice(), filled(1)?.as_slice());

        let disk = CbeDisk::open(mem, small_config())?;
        assert_eq!(read_block(&disk, 0)?.as_slice(), filled(3)?.as_slice());
        Ok(())
    }

    #[test]
    fn failed_seal_is_retried() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let faulty = FaultyDisk::new(mem.clone());
        let disk = CbeDisk::format(faulty.clone(), small_config())?;
        disk.write(0, filled(1)?.as_ref())?;
        disk.sync()?;

        let mut data = Buf::alloc(4)?;
        for (nth, block) in data.as_mut_slice().chunks_mut(BLOCK_SIZE).enumerate() {
            block.fill(nth as u8 + 0x10);
        }
        disk.write(4, data.as_ref())?;
        // The second node written back fails
        faulty.fail_write(1);
        assert_eq!(disk.sync().unwrap_err().errno(), IoFailed);
        assert_eq!(disk.current_generation(), 2);

        // Nothing of generation 2 reached the ring
        let reopened = CbeDisk::open(mem.clone(), small_config())?;
        assert_eq!(reopened.current_generation(), 2);
        assert_eq!(read_block(&reopened, 0)?.as_slice(), filled(1)?.as_slice());
        assert_eq!(read_block(&reopened, 4)?.as_slice(), filled(0)?.as_slice());
        drop(reopened);

        disk.sync()?;
        assert_eq!(disk.current_generation(), 3);
        let reopened = CbeDisk::open(mem, small_config())?;
        let mut out = Buf::alloc(4)?;
        reopened.read(4, out.as_mut())?;
        assert_eq!(out.as_slice(), data.as_slice());
        assert_eq!(snapshot_ids(&reopened), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn failed_commit_moves_to_next_generation() -> Result<()> {
        let mem = MemDisk::create(64)?;
        let faulty = FaultyDisk::new(mem.clone());
        let disk = CbeDisk::format(faulty.clone(), small_config())?;
        disk.write(0, filled(1)?.as_ref())?;

        // The first flush is of the trees, the second of the superblock slot
        // that was written already
        faulty.fail_flush(1);
        assert_eq!(disk.sync().unwrap_err().errno(), IoFailed);
        assert_eq!(disk.current_generation(), 2);
        let reopened = CbeDisk::open(mem.clone(), small_config())?;
        assert_eq!(reopened.current_generation(), 2);
        assert_eq!(read_block(&reopened, 0)?.as_slice(), filled(1)?.as_slice());
        drop(reopened);

        // Generation 1 may be on disk, so its blocks stay untouched
        disk.write(0, filled(2)?.as_ref())?;
        let reopened = CbeDisk::open(mem.clone(), small_config())?;
        assert_eq!(read_block(&reopened, 0)?.as_slice(), filled(1)?.as_slice());
        drop(reopened);

        disk.sync()?;
        let reopened = CbeDisk::open(mem, small_config())?;
        assert_eq!(reopened.current_generation(), 3);
        assert_eq!(read_block(&reopened, 0)?.as_slice(), filled(2)?.as_slice());
        assert_eq!(snapshot_ids(&reopened), vec![0, 2]);
        Ok(())
    }

    #[test]
    fn snapshot_ids_wrap_around() -> Result<()> {
        let mem = MemDisk::create(128)?;
        let disk = CbeDisk::format(mem.clone(), small_config())?;
        disk.inner.state.lock().trees.next_snapshot_id = INVALID_SNAPSHOT_ID - 1;
        for _ in 0..3 {
            disk.sync()?;
        }
        let ids = vec![0, INVALID_SNAPSHOT_ID - 1, 1, 2];
        assert_eq!(snapshot_ids(&disk), ids);

        let disk = CbeDisk::open(mem, small_config())?;
        assert_eq!(snapshot_ids(&disk), ids);
        disk.sync()?;
        assert_eq!(*snapshot_ids(&disk).last().unwrap(), 3);
        Ok(())
    }

    #[test]
    fn blank_disk_has_no_superblock() -> Result<()> {
        let err = CbeDisk::open(MemDisk::create(64)?, small_config())
            .err()
            .unwrap();
        assert_eq!(err.errno(), NoValidSuperBlock);
        Ok(())
    }

    #[test]
    fn submit_requests() -> Result<()> {
        let disk = CbeDisk::format(MemDisk::create(64)?, small_config())?;

        let mut payload = alloc::vec![0u8; 4 * BLOCK_SIZE];
        for (nth, block) in payload[BLOCK_SIZE..].chunks_mut(BLOCK_SIZE).enumerate() {
            block.fill(nth as u8 + 1);
        }
        let write = Request::new(Operation::Write, 5, 3, 1).offset(BLOCK_SIZE as u64);
        let done = disk.submit(write, &mut payload)?;
        assert!(done.matches(&write) && done.success);

        let mut out = alloc::vec![0u8; 3 * BLOCK_SIZE];
        let done = disk.submit(Request::new(Operation::Read, 5, 3, 2), &mut out)?;
        assert!(done.success);
        assert_eq!(&out[..], &payload[BLOCK_SIZE..]);

        let done = disk.submit(Request::new(Operation::Sync, 0, 0, 3), &mut [])?;
        assert!(done.success);
        assert_eq!(disk.snapshots().len(), 2);

        // The primitive beyond the last virtual block fails the request
        let beyond = Request::new(Operation::Read, 15, 2, 4);
        let done = disk.submit(beyond, &mut out[..2 * BLOCK_SIZE])?;
        assert!(!done.success);

        let invalid = Request::new(Operation::Invalid, 0, 1, 5);
        assert_eq!(disk.submit(invalid, &mut out).unwrap_err().errno(), InvalidArgs);
        let short = Request::new(Operation::Read, 0, 4, 6);
        assert_eq!(disk.submit(short, &mut out).unwrap_err().errno(), InvalidArgs);
        Ok(())
    }
}
