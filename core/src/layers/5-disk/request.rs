//! Client requests.
use crate::prelude::*;

use serde::{Deserialize, Serialize};

/// The operation of a request or a primitive.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// The unset operation. Never accepted.
    #[default]
    Invalid = 0,
    Read = 1,
    Write = 2,
    Sync = 3,
}

impl Operation {
    /// Converts a raw operation code. Unknown codes map to `Invalid`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Read,
            2 => Self::Write,
            3 => Self::Sync,
            _ => Self::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::Invalid
    }
}

/// A client request over a range of virtual blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    pub success: bool,
    /// The first virtual block of the range.
    pub block_number: u64,
    /// The byte offset of the range's payload in the client buffer.
    pub offset: u64,
    /// The number of blocks. Ignored by a sync.
    pub count: u32,
    /// The correlation tag the client uses to match the completion.
    pub tag: u32,
}

impl Request {
    pub fn new(operation: Operation, block_number: u64, count: u32, tag: u32) -> Self {
        Self {
            operation,
            success: false,
            block_number,
            offset: 0,
            count,
            tag,
        }
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.operation.is_valid()
    }

    /// Returns the number of primitives the request breaks into.
    pub fn nprimitives(&self) -> usize {
        match self.operation {
            Operation::Read | Operation::Write => self.count as usize,
            Operation::Sync => 1,
            Operation::Invalid => 0,
        }
    }

    /// Whether `other` is the same request, regardless of completion.
    pub fn matches(&self, other: &Request) -> bool {
        self.tag == other.tag
            && self.block_number == other.block_number
            && self.operation == other.operation
    }
}
