//! Work units exchanged with the collaborators of the engine.
use super::Operation;
use crate::prelude::*;

use serde::{Deserialize, Serialize};

/// The affiliation of a primitive, i.e., which collaborator owns it.
///
/// ```text
/// 23      16 15       8 7        0
/// +---------+----------+---------+
/// |  meta   |   type   | subtype |
/// +---------+----------+---------+
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u32);

impl Tag {
    pub const INVALID: Tag = Tag(0);

    pub const IO: Tag = Tag(0x01 << 8);
    pub const CACHE: Tag = Tag(0x02 << 8);
    pub const CACHE_FLUSH: Tag = Tag(Self::CACHE.0 | 0x01);
    pub const CRYPTO: Tag = Tag(0x03 << 8);
    pub const CRYPTO_DECRYPT: Tag = Tag(Self::CRYPTO.0 | 0x01);
    pub const CRYPTO_ENCRYPT: Tag = Tag(Self::CRYPTO.0 | 0x02);
    pub const POOL: Tag = Tag(0x04 << 8);
    pub const SPLITTER: Tag = Tag(0x05 << 8);
    pub const TRANSLATION: Tag = Tag(0x06 << 8);
    pub const WRITE_BACK: Tag = Tag(0x07 << 8);
    pub const SYNC_SB: Tag = Tag(0x08 << 8);
    pub const RECLAIM: Tag = Tag(0x09 << 8);

    pub const VBD: Tag = Tag(0x01 << 16);
    pub const VBD_CACHE: Tag = Self::VBD.with(Self::CACHE);
    pub const FREE_TREE: Tag = Tag(0x02 << 16);
    pub const FREE_TREE_IO: Tag = Self::FREE_TREE.with(Self::IO);
    pub const FREE_TREE_CACHE: Tag = Self::FREE_TREE.with(Self::CACHE);
    pub const FREE_TREE_WB: Tag = Self::FREE_TREE.with(Self::WRITE_BACK);

    const MASK: u32 = 0x00ff_ffff;

    /// Creates a tag from its raw value. Bits above the 24th are dropped.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Combines a meta tag with a module tag.
    pub const fn with(self, other: Tag) -> Tag {
        Tag(self.0 | other.0)
    }

    pub const fn meta(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn type_(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn subtype(&self) -> u8 {
        self.0 as u8
    }

    /// Returns the tag without its meta part.
    pub const fn module(&self) -> Tag {
        Tag(self.0 & 0xffff)
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::INVALID => "INVALID",
            Self::IO => "IO",
            Self::CACHE => "CACHE",
            Self::CACHE_FLUSH => "CACHE_FLUSH",
            Self::CRYPTO => "CRYPTO",
            Self::CRYPTO_DECRYPT => "CRYPTO_DECRYPT",
            Self::CRYPTO_ENCRYPT => "CRYPTO_ENCRYPT",
            Self::POOL => "POOL",
            Self::SPLITTER => "SPLITTER",
            Self::TRANSLATION => "TRANSLATION",
            Self::WRITE_BACK => "WRITE_BACK",
            Self::SYNC_SB => "SYNC_SB",
            Self::RECLAIM => "RECLAIM",
            Self::VBD => "VBD",
            Self::VBD_CACHE => "VBD_CACHE",
            Self::FREE_TREE => "FREE_TREE",
            Self::FREE_TREE_IO => "FREE_TREE_IO",
            Self::FREE_TREE_CACHE => "FREE_TREE_CACHE",
            Self::FREE_TREE_WB => "FREE_TREE_WB",
            _ => "UNKNOWN",
        }
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}: {:#08x})", self.name(), self.0)
    }
}

/// A single-block unit of work.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Primitive {
    pub tag: Tag,
    pub operation: Operation,
    pub success: bool,
    pub block_number: u64,
    /// The correlation tag of the request the primitive belongs to.
    pub index: u64,
}

impl Primitive {
    /// The maximum size of an encoded primitive.
    pub const MAX_ENCODED_SIZE: usize = 32;

    pub fn new(tag: Tag, operation: Operation, block_number: u64, index: u64) -> Self {
        Self {
            tag,
            operation,
            success: false,
            block_number,
            index,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.operation.is_valid()
    }

    /// Hands the primitive over to the collaborator of `tag`.
    pub fn retag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    /// Encodes the primitive into `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        match postcard::to_slice(self, buf) {
            Ok(encoded) => Ok(encoded.len()),
            Err(_) => return_errno_with_msg!(InvalidArgs, "buffer too small for a primitive"),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Ok(primitive) = postcard::from_bytes(buf) else {
            return_errno_with_msg!(InvalidArgs, "malformed primitive");
        };
        Ok(primitive)
    }
}

/// Two primitives are the same work unit if they agree on tag, block and
/// operation. Completion status is not compared.
impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.block_number == other.block_number
            && self.operation == other.operation
    }
}

impl Eq for Primitive {}
