//! The layer of snapshots.
mod directory;
mod snapshot;

pub use self::directory::{SnapshotDirectory, INVALID_SNAPSHOT_SLOT, NUM_SNAPSHOTS};
pub use self::snapshot::{Snapshot, FLAG_KEEP, INVALID_SNAPSHOT_ID, SNAPSHOT_SIZE};
