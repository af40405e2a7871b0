#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "1-tree/mod.rs"]
pub mod tree;
#[path = "2-snapshot/mod.rs"]
pub mod snapshot;
#[path = "3-free/mod.rs"]
pub mod free;
#[path = "4-superblock/mod.rs"]
pub mod superblock;
#[path = "5-disk/mod.rs"]
pub mod disk;
