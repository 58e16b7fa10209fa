// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request/response codec: record encoding, request-id bookkeeping, and
//! completion matching.
//!
//! Responses are matched on `req_id`, never on ring position: no ordering
//! is guaranteed between SQ and CQ. Each id maps to exactly one waiter; a
//! response whose id is unknown, already delivered, or abandoned is counted
//! and dropped.

use arrayvec::ArrayVec;
use tracebuf::TraceBuf;
use zerocopy::{FromBytes, IntoBytes};

use drv_mgmt_api::{
    CmdStatus, RequestRecord, ResponseHeader, CQ_SLOT_SIZE,
    INLINE_RESULT_MAX, REQUEST_MAGIC, RESPONSE_MAGIC,
};
use sgcq::{mem_read_bytes, mem_write_bytes, SgcqError, SgcqIo, SgcqProducer};

use crate::{MgmtError, Timebase};

/// The result of one request, as delivered to its waiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub status: CmdStatus,
    pub sub_code: u32,
    pub result: ArrayVec<u8, INLINE_RESULT_MAX>,
}

impl Completion {
    /// Converts a non-success status into an error, for callers that only
    /// want the payload.
    pub fn ok(self) -> Result<Self, MgmtError> {
        if self.status == CmdStatus::Success {
            Ok(self)
        } else {
            Err(MgmtError::Failed {
                status: self.status,
                sub_code: self.sub_code,
            })
        }
    }
}

#[derive(Debug)]
enum WaitState {
    Pending,
    Complete(Completion),
    /// The waiter timed out; a late response is dropped on arrival.
    Abandoned,
}

#[derive(Debug)]
struct Outstanding {
    req_id: u16,
    state: WaitState,
}

/// Per-client statistics. Observable (e.g. through a CLI), never consulted
/// for control flow.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub submitted: u32,
    pub delivered: u32,
    pub timeouts: u32,
    /// Responses matching an abandoned request.
    pub late_dropped: u32,
    /// Responses with an id nothing is waiting on.
    pub unknown_dropped: u32,
    /// Responses that failed structural validation.
    pub malformed_dropped: u32,
    /// Abandoned entries evicted to make room for new requests.
    pub abandoned_evicted: u32,
}

impl ClientStats {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
    Submitted(u16),
    Delivered(u16),
    Abandoned(u16),
    LateDropped(u16),
    UnknownDropped(u16),
    Malformed,
}

/// The single producer on an sGCQ instance.
///
/// `N` bounds the outstanding-request map and must be at least the ring
/// depth; with ack-serialized callers it is never near full.
#[derive(Debug)]
pub struct MgmtClient<const N: usize> {
    q: SgcqProducer,
    /// Window-relative bounds of the bulk data region used for payloads
    /// that don't fit in a slot.
    bulk_base: u64,
    bulk_len: u32,
    next_req_id: u16,
    outstanding: [Option<Outstanding>; N],
    pub stats: ClientStats,
    trace: TraceBuf<Event, 16>,
}

impl<const N: usize> MgmtClient<N> {
    pub fn new(q: SgcqProducer, bulk_base: u64, bulk_len: u32) -> Self {
        Self {
            q,
            bulk_base,
            bulk_len,
            next_req_id: 0,
            outstanding: core::array::from_fn(|_| None),
            stats: ClientStats::default(),
            trace: TraceBuf::new(),
        }
    }

    pub fn queue(&self) -> &SgcqProducer {
        &self.q
    }

    /// Window-relative address of the bulk region. Request payloads are
    /// staged at its base, one at a time.
    pub fn bulk_base(&self) -> u64 {
        self.bulk_base
    }

    fn index_of(&self, req_id: u16) -> Option<usize> {
        self.outstanding
            .iter()
            .position(|o| matches!(o, Some(e) if e.req_id == req_id))
    }

    fn alloc_req_id(&mut self) -> u16 {
        // Skip ids that are still outstanding (pending or abandoned);
        // terminates because the map holds at most N << 65536 entries.
        loop {
            let id = self.next_req_id;
            self.next_req_id = self.next_req_id.wrapping_add(1);
            if self.index_of(id).is_none() {
                return id;
            }
        }
    }

    fn free_map_slot(&mut self) -> Result<usize, MgmtError> {
        if let Some(i) = self.outstanding.iter().position(Option::is_none) {
            return Ok(i);
        }
        // Every slot taken: evict an abandoned entry if there is one. Its
        // late response, if it ever arrives, will then count as unknown.
        let abandoned = self.outstanding.iter().position(|o| {
            matches!(o, Some(e) if matches!(e.state, WaitState::Abandoned))
        });
        if let Some(i) = abandoned {
            self.outstanding[i] = None;
            self.stats.abandoned_evicted += 1;
            return Ok(i);
        }
        Err(MgmtError::Transport(SgcqError::NoFreeSlot))
    }

    /// Stages `payload` at the base of the bulk region, padding the final
    /// partial word with zeros, and returns `(addr, len)` for the request
    /// record.
    pub fn stage_payload(
        &mut self,
        io: &mut impl SgcqIo,
        payload: &[u8],
    ) -> Result<(u32, u32), MgmtError> {
        if payload.len() > self.bulk_len as usize {
            return Err(MgmtError::PayloadTooLarge);
        }
        let tail_len = payload.len() % 4;
        let whole = payload.len() - tail_len;
        mem_write_bytes(io, self.bulk_base, &payload[..whole]);
        if tail_len != 0 {
            let mut last = [0u8; 4];
            last[..tail_len].copy_from_slice(&payload[whole..]);
            mem_write_bytes(io, self.bulk_base + whole as u64, &last);
        }
        Ok((self.bulk_base as u32, payload.len() as u32))
    }

    /// Posts a request. `record.req_id` and `record.magic` are filled in
    /// here; everything else is the caller's. Returns the allocated id.
    pub fn submit(
        &mut self,
        io: &mut impl SgcqIo,
        mut record: RequestRecord,
    ) -> Result<u16, MgmtError> {
        let map_slot = self.free_map_slot()?;
        let slot = self.q.sq_reserve(io)?;

        let req_id = self.alloc_req_id();
        record.magic = REQUEST_MAGIC;
        record.req_id = req_id;

        mem_write_bytes(io, slot, record.as_bytes());
        self.q.sq_commit(io);
        self.q.signal(io);

        self.outstanding[map_slot] = Some(Outstanding {
            req_id,
            state: WaitState::Pending,
        });
        self.stats.submitted += 1;
        self.trace.record(Event::Submitted(req_id));
        Ok(req_id)
    }

    /// Drains the CQ, routing each response to its waiter. Returns how many
    /// responses were delivered (not dropped).
    pub fn poll_completions(&mut self, io: &mut impl SgcqIo) -> usize {
        let mut delivered = 0;
        while let Ok(slot) = self.q.cq_peek(io) {
            let mut raw = [0u8; CQ_SLOT_SIZE as usize];
            mem_read_bytes(io, slot, &mut raw);
            self.q.cq_commit(io);

            // Infallible: the buffer is a whole slot, longer than the
            // header.
            let Ok((header, rest)) =
                ResponseHeader::read_from_prefix(&raw[..])
            else {
                continue;
            };
            if header.magic != RESPONSE_MAGIC
                || header.result_len as usize > INLINE_RESULT_MAX
            {
                self.stats.malformed_dropped += 1;
                self.trace.record(Event::Malformed);
                continue;
            }
            let Some(status) = CmdStatus::from_wire(header.status) else {
                self.stats.malformed_dropped += 1;
                self.trace.record(Event::Malformed);
                continue;
            };

            let Some(i) = self.index_of(header.req_id) else {
                self.stats.unknown_dropped += 1;
                self.trace.record(Event::UnknownDropped(header.req_id));
                continue;
            };
            // Snapshot the state kind so the map can be mutated below.
            enum Disp {
                Deliver,
                DropLate,
                DropDup,
            }
            let disp = match &self.outstanding[i] {
                Some(e) => match e.state {
                    WaitState::Pending => Disp::Deliver,
                    WaitState::Abandoned => Disp::DropLate,
                    WaitState::Complete(_) => Disp::DropDup,
                },
                None => continue,
            };
            match disp {
                Disp::Deliver => {
                    let mut result = ArrayVec::new();
                    // Bounded by the result_len check above.
                    let _ = result.try_extend_from_slice(
                        &rest[..header.result_len as usize],
                    );
                    if let Some(e) = self.outstanding[i].as_mut() {
                        e.state = WaitState::Complete(Completion {
                            status,
                            sub_code: header.sub_code,
                            result,
                        });
                    }
                    delivered += 1;
                    self.stats.delivered += 1;
                    self.trace.record(Event::Delivered(header.req_id));
                }
                Disp::DropLate => {
                    self.outstanding[i] = None;
                    self.stats.late_dropped += 1;
                    self.trace.record(Event::LateDropped(header.req_id));
                }
                // A second response for an undelivered completion; the
                // first one wins.
                Disp::DropDup => {
                    self.stats.unknown_dropped += 1;
                    self.trace.record(Event::UnknownDropped(header.req_id));
                }
            }
        }
        delivered
    }

    /// Takes the completion for `req_id` if it has been delivered.
    pub fn completion(&mut self, req_id: u16) -> Option<Completion> {
        let i = self.index_of(req_id)?;
        let done = matches!(
            self.outstanding[i],
            Some(Outstanding {
                state: WaitState::Complete(_),
                ..
            })
        );
        if !done {
            return None;
        }
        match self.outstanding[i].take() {
            Some(Outstanding {
                state: WaitState::Complete(c),
                ..
            }) => Some(c),
            _ => None,
        }
    }

    /// Abandons an outstanding request. Its ring slot stays with the
    /// consumer; a late response will be counted and dropped.
    pub fn abandon(&mut self, req_id: u16) {
        if let Some(i) = self.index_of(req_id) {
            if let Some(e) = self.outstanding[i].as_mut() {
                e.state = WaitState::Abandoned;
            }
            self.trace.record(Event::Abandoned(req_id));
        }
    }

    /// Waits for the completion of `req_id`, polling the CQ and yielding
    /// through `tb` until `timeout_ms` has elapsed. The only blocking call
    /// in the client.
    pub fn wait(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        req_id: u16,
        timeout_ms: u64,
    ) -> Result<Completion, MgmtError> {
        let deadline = tb.now_ms().saturating_add(timeout_ms);
        loop {
            self.poll_completions(io);
            if let Some(completion) = self.completion(req_id) {
                return Ok(completion);
            }
            if self.index_of(req_id).is_none() {
                return Err(MgmtError::UnknownRequest);
            }
            if tb.now_ms() >= deadline {
                self.abandon(req_id);
                self.stats.timeouts += 1;
                return Err(MgmtError::Timeout);
            }
            tb.yield_now();
        }
    }

    /// Submit-and-wait. Returns the completion whatever its status; see
    /// [`Completion::ok`].
    pub fn transact(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        record: RequestRecord,
        timeout_ms: u64,
    ) -> Result<Completion, MgmtError> {
        let req_id = self.submit(io, record)?;
        self.wait(io, tb, req_id, timeout_ms)
    }
}
