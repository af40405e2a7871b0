//! The snapshot directory.
//!
//! A fixed array of snapshot slots, scanned linearly. A new snapshot takes
//! the free slot with the lowest index. If no slot is free, one snapshot
//! without `FLAG_KEEP` is evicted: the one of the lowest generation, then
//! of the lowest id, then in the lowest slot.
use super::{Snapshot, INVALID_SNAPSHOT_ID, SNAPSHOT_SIZE};
use crate::layers::tree::Generation;
use crate::prelude::*;

/// The number of slots of a directory.
pub const NUM_SNAPSHOTS: usize = 48;

/// The slot returned when no slot matches.
pub const INVALID_SNAPSHOT_SLOT: usize = NUM_SNAPSHOTS;

/// A bounded set of snapshots keyed by id.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotDirectory {
    slots: [Snapshot; NUM_SNAPSHOTS],
    /// The id of the snapshot the current state descends from.
    active_id: u32,
}

impl SnapshotDirectory {
    /// The size of the encoded slots.
    pub const ENCODED_SIZE: usize = NUM_SNAPSHOTS * SNAPSHOT_SIZE;

    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            slots: [Snapshot::invalid(); NUM_SNAPSHOTS],
            active_id: INVALID_SNAPSHOT_ID,
        }
    }

    pub fn active_id(&self) -> u32 {
        self.active_id
    }

    /// Returns the slot of the active snapshot, or `INVALID_SNAPSHOT_SLOT`
    /// if the active id is stale.
    pub fn snapshot_slot(&self) -> usize {
        self.slot_of(self.active_id)
    }

    /// Returns the slot of the snapshot `id`, or `INVALID_SNAPSHOT_SLOT`.
    pub fn slot_of(&self, id: u32) -> usize {
        if id == INVALID_SNAPSHOT_ID {
            return INVALID_SNAPSHOT_SLOT;
        }
        self.slots
            .iter()
            .position(|snapshot| snapshot.id == id)
            .unwrap_or(INVALID_SNAPSHOT_SLOT)
    }

    pub fn get(&self, id: u32) -> Option<&Snapshot> {
        self.slots.get(self.slot_of(id))
    }

    /// Returns the active snapshot.
    pub fn active(&self) -> Option<&Snapshot> {
        self.slots.get(self.snapshot_slot())
    }

    /// Returns the valid snapshots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.slots.iter().filter(|snapshot| snapshot.is_valid())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the snapshot of the highest generation.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.iter().max_by_key(|snapshot| snapshot.gen)
    }

    /// Returns the lowest generation any retained snapshot belongs to.
    pub fn min_retained_gen(&self) -> Option<Generation> {
        self.iter().map(|snapshot| snapshot.gen).min()
    }

    /// Whether `insert` would succeed.
    pub fn can_insert(&self) -> bool {
        self.target_slot().is_some()
    }

    /// Inserts a newly sealed snapshot and makes it active. Returns the
    /// snapshot evicted to make room, if any.
    ///
    /// # Panics
    ///
    /// The snapshot must be valid and its id must not be in the directory.
    pub fn insert(&mut self, snapshot: Snapshot) -> Result<Option<Snapshot>> {
        assert!(snapshot.is_valid());
        assert_eq!(self.slot_of(snapshot.id), INVALID_SNAPSHOT_SLOT);

        let Some(slot) = self.target_slot() else {
            return_errno_with_msg!(
                SnapshotDirFull,
                "every snapshot of the directory is kept"
            );
        };
        let evicted = self.slots[slot].is_valid().then(|| self.slots[slot]);
        if let Some(evicted) = evicted.as_ref() {
            debug!(
                "[SnapshotDirectory] evict snapshot {} of generation {} from slot {}",
                evicted.id, evicted.gen, slot
            );
        }
        self.slots[slot] = snapshot;
        self.active_id = snapshot.id;
        Ok(evicted)
    }

    /// Discards the snapshot `id`.
    pub fn discard(&mut self, id: u32) -> Result<Snapshot> {
        let slot = self.slot_of(id);
        if slot == INVALID_SNAPSHOT_SLOT {
            return_errno_with_msg!(NotFound, "snapshot to discard not found");
        }
        let discarded = self.slots[slot];
        self.slots[slot].discard();
        Ok(discarded)
    }

    /// Sets or clears `FLAG_KEEP` of the snapshot `id`.
    pub fn set_keep(&mut self, id: u32, keep: bool) -> Result<()> {
        let slot = self.slot_of(id);
        if slot == INVALID_SNAPSHOT_SLOT {
            return_errno_with_msg!(NotFound, "snapshot to keep not found");
        }
        self.slots[slot].set_keep(keep);
        Ok(())
    }

    /// Returns the slot the next snapshot goes to.
    fn target_slot(&self) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(|snapshot| !snapshot.is_valid()) {
            return Some(free);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, snapshot)| !snapshot.keep())
            .min_by_key(|(slot, snapshot)| (snapshot.gen, snapshot.id, *slot))
            .map(|(slot, _)| slot)
    }

    /// Encodes the slots into `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        for (snapshot, chunk) in self
            .slots
            .iter()
            .zip(buf[..Self::ENCODED_SIZE].chunks_exact_mut(SNAPSHOT_SIZE))
        {
            snapshot.encode(chunk);
        }
    }

    /// Decodes the slots from `buf`.
    pub fn decode(buf: &[u8], active_id: u32) -> Self {
        let slots = array_init::array_init(|slot| {
            Snapshot::decode(&buf[slot * SNAPSHOT_SIZE..(slot + 1) * SNAPSHOT_SIZE])
        });
        Self { slots, active_id }
    }
}

impl Default for SnapshotDirectory {
    fn default() -> Self {
        Self::new()
    }
}
