//! Splitting requests into primitives.
use super::{Operation, Primitive, Request, Tag};
use crate::prelude::*;

/// Breaks client requests into per-block primitives.
#[derive(Debug, Default)]
pub struct Splitter;

impl Splitter {
    pub fn new() -> Self {
        Self
    }

    /// Splits `request` into one primitive per block, or a single one for a
    /// sync. Every primitive carries the tag of `request` as its index.
    pub fn split(&self, request: &Request) -> Result<Vec<Primitive>> {
        if !request.is_valid() {
            return_errno_with_msg!(InvalidArgs, "invalid request operation");
        }
        let index = request.tag as u64;
        let primitives = match request.operation {
            Operation::Sync => vec![Primitive::new(
                Tag::SPLITTER,
                Operation::Sync,
                request.block_number,
                index,
            )],
            op => {
                if request.count == 0 {
                    return_errno_with_msg!(InvalidArgs, "empty read or write request");
                }
                if request
                    .block_number
                    .checked_add(request.count as u64)
                    .is_none()
                {
                    return_errno_with_msg!(InvalidArgs, "request range overflows");
                }
                (0..request.count as u64)
                    .map(|nth| Primitive::new(Tag::SPLITTER, op, request.block_number + nth, index))
                    .collect()
            }
        };
        trace!(
            "[Splitter] request {} split into {} primitives",
            request.tag,
            primitives.len()
        );
        Ok(primitives)
    }
}
