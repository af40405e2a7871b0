//! OS-specific or OS-dependent APIs.

#[cfg(feature = "std")]
mod std;
#[cfg(feature = "std")]
pub use self::std::{
    sha256, Arc, BTreeMap, BTreeSet, Box, HashMap, HashSet, Mutex, MutexGuard, Rng, RwLock,
    RwLockReadGuard, RwLockWriteGuard, Skcipher, SkcipherIv, SkcipherKey, String, ToString, Vec,
};
