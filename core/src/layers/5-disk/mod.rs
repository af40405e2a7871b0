//! The layer of the block device.
//!
//! `CbeDisk` ties the trees, the snapshot directory and the superblock ring
//! together. Client requests reach it either directly or as `Request`s,
//! which the `Splitter` breaks into per-block `Primitive`s and the
//! `RequestPool` reassembles on completion.
mod cbe_disk;
mod config;
mod pool;
mod primitive;
mod request;
mod splitter;

pub use self::cbe_disk::CbeDisk;
pub use self::config::Config;
pub use self::pool::RequestPool;
pub use self::primitive::{Primitive, Tag};
pub use self::request::{Operation, Request};
pub use self::splitter::Splitter;
