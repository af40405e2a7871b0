//! Reassembling requests from completed primitives.
use super::{Primitive, Request};
use crate::os::HashMap;
use crate::prelude::*;
use crate::util::BitMap;

/// Tracks the requests in flight and which of their primitives completed.
///
/// Primitives may complete in any order. A request completes once all of
/// its primitives have, and succeeds only if all of them did.
#[derive(Debug, Default)]
pub struct RequestPool {
    requests: HashMap<u32, PendingRequest>,
}

#[derive(Debug)]
struct PendingRequest {
    request: Request,
    completed: BitMap,
    failed: bool,
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }

    /// Admits `request` into the pool.
    pub fn alloc(&mut self, request: Request) -> Result<()> {
        if !request.is_valid() {
            return_errno_with_msg!(InvalidArgs, "invalid request operation");
        }
        if self.requests.contains_key(&request.tag) {
            return_errno_with_msg!(InvalidArgs, "request tag already in flight");
        }
        let completed = BitMap::repeat(false, request.nprimitives());
        let _ = self.requests.insert(
            request.tag,
            PendingRequest {
                request,
                completed,
                failed: false,
            },
        );
        Ok(())
    }

    /// Returns the request in flight with correlation tag `tag`.
    pub fn request_for_tag(&self, tag: u32) -> Option<&Request> {
        self.requests.get(&tag).map(|pending| &pending.request)
    }

    /// Records the completion of `prim`. Returns the request it belongs to
    /// once every primitive of the request has completed.
    pub fn mark_completed(&mut self, prim: &Primitive) -> Result<Option<Request>> {
        let Ok(tag) = u32::try_from(prim.index) else {
            return_errno_with_msg!(InvalidArgs, "primitive index is not a request tag");
        };
        let Some(pending) = self.requests.get_mut(&tag) else {
            return_errno_with_msg!(NotFound, "no request in flight for primitive");
        };

        let nth = prim
            .block_number
            .checked_sub(pending.request.block_number)
            .map(|nth| nth as usize)
            .filter(|&nth| nth < pending.completed.len());
        let Some(nth) = nth else {
            return_errno_with_msg!(InvalidArgs, "primitive outside of its request");
        };
        if prim.operation != pending.request.operation || pending.completed[nth] {
            return_errno_with_msg!(InvalidArgs, "unexpected primitive completion");
        }

        pending.completed.set_bit(nth);
        pending.failed |= !prim.success;
        if !pending.completed.is_full() {
            return Ok(None);
        }

        Ok(self.requests.remove(&tag).map(|pending| {
            let mut request = pending.request;
            request.success = !pending.failed;
            request
        }))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
