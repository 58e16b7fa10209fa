// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatch loop and per-opcode handlers.

use arrayvec::ArrayVec;
use num_traits::FromPrimitive as _;
use tracebuf::TraceBuf;
use zerocopy::{FromBytes, IntoBytes};

use drv_mgmt_api::{
    BootDevice, CmdStatus, CopyFlags, IdentifyInfo, MgmtOp, ModuleSelect,
    PdiFlags, RequestRecord, ResponseHeader, SubCode, CQ_SLOT_SIZE,
    INLINE_RESULT_MAX, PDI_CHUNK_SIZE, REQUEST_MAGIC, WIRE_VERSION,
};
use fpt::{FptHeader, FptTable};
use sgcq::{mem_read_bytes, mem_write_bytes, SgcqConsumer, SgcqError, SgcqIo};

use crate::{BoardInfo, ImageStore, ModuleIo};

/// Per-dispatcher statistics, one counter per completion kind. Observable;
/// never used for control flow.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub requests: u32,
    pub success: u32,
    pub unsupported_opcode: u32,
    pub malformed: u32,
    pub device_failure: u32,
    pub stream_aborted: u32,
    pub integrity_failure: u32,
    /// Records whose magic word was wrong.
    pub bad_magic: u32,
}

impl DispatchStats {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn count(&mut self, status: CmdStatus) {
        match status {
            CmdStatus::Success => self.success += 1,
            CmdStatus::UnsupportedOpcode => self.unsupported_opcode += 1,
            CmdStatus::MalformedRequest => self.malformed += 1,
            CmdStatus::DeviceFailure => self.device_failure += 1,
            CmdStatus::StreamAborted => self.stream_aborted += 1,
            CmdStatus::IntegrityFailure => self.integrity_failure += 1,
        }
    }
}

/// Trace events recorded by the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Request { op: u16 },
    BadMagic,
    StreamStarted { partition: u8 },
    ChunkProgrammed { chunk: u16 },
    StreamDone,
    StreamAborted { chunk: u16 },
    StreamRejected { chunk: u16 },
}

/// Which PDI stream, if any, is in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StreamState {
    Idle,
    Active {
        boot: BootDevice,
        partition: u8,
        next_chunk: u16,
        /// Upper byte bound derived from the FPT entry (u32::MAX for an
        /// FPT-update stream, where the store enforces its own region).
        limit: u32,
    },
    Aborted {
        boot: BootDevice,
        partition: u8,
    },
}

/// A handler's answer, before it is serialized into a CQ slot.
struct Reply {
    status: CmdStatus,
    sub_code: SubCode,
    result: ArrayVec<u8, INLINE_RESULT_MAX>,
}

impl Reply {
    fn ok() -> Self {
        Self::status(CmdStatus::Success)
    }

    fn ok_with(bytes: &[u8]) -> Self {
        let mut reply = Self::ok();
        // Callers bound their payloads to the inline cap.
        let _ = reply.result.try_extend_from_slice(bytes);
        reply
    }

    fn status(status: CmdStatus) -> Self {
        Self {
            status,
            sub_code: SubCode::None,
            result: ArrayVec::new(),
        }
    }

    fn failure(sub_code: SubCode) -> Self {
        Self {
            status: CmdStatus::DeviceFailure,
            sub_code,
            result: ArrayVec::new(),
        }
    }
}

impl From<SubCode> for Reply {
    fn from(sub_code: SubCode) -> Self {
        Reply::failure(sub_code)
    }
}

#[derive(Debug)]
pub struct Dispatcher<S, M, B> {
    q: SgcqConsumer,
    bulk_base: u64,
    bulk_len: u32,
    stream: StreamState,
    chunk_buf: [u8; PDI_CHUNK_SIZE],
    pub stats: DispatchStats,
    trace: TraceBuf<Event, 32>,
    fw_build: u32,
    store: S,
    modules: M,
    board: B,
}

impl<S, M, B> Dispatcher<S, M, B>
where
    S: ImageStore,
    M: ModuleIo,
    B: BoardInfo,
{
    pub fn new(
        q: SgcqConsumer,
        bulk_base: u64,
        bulk_len: u32,
        fw_build: u32,
        store: S,
        modules: M,
        board: B,
    ) -> Self {
        Self {
            q,
            bulk_base,
            bulk_len,
            stream: StreamState::Idle,
            chunk_buf: [0; PDI_CHUNK_SIZE],
            stats: DispatchStats::default(),
            trace: TraceBuf::new(),
            fw_build,
            store,
            modules,
            board,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn trace(&self) -> &TraceBuf<Event, 32> {
        &self.trace
    }

    /// One cooperative tick: handle at most one request. Returns whether a
    /// request was handled. `PeerNotReady` means the producer tore the
    /// session down; the caller should re-attach.
    pub fn poll<I: SgcqIo>(
        &mut self,
        io: &mut I,
    ) -> Result<bool, SgcqError> {
        if !self.q.session_alive(io) {
            return Err(SgcqError::PeerNotReady);
        }

        let slot = match self.q.sq_peek(io) {
            Err(SgcqError::NoData) => return Ok(false),
            other => other?,
        };
        // Make sure the completion has somewhere to go before consuming
        // the request; with equal ring depths this cannot fail, but a
        // stalled producer-side drain must not wedge us mid-request.
        let cq_slot = match self.q.cq_reserve(io) {
            Err(SgcqError::NoFreeSlot) => return Ok(false),
            other => other?,
        };

        let mut raw = [0u8; core::mem::size_of::<RequestRecord>()];
        mem_read_bytes(io, slot, &mut raw);

        let (req_id, reply) = self.handle(io, &raw);

        let mut header = ResponseHeader::new(req_id, reply.status);
        header.sub_code = reply.sub_code as u32;
        header.result_len = reply.result.len() as u32;

        // The whole slot is rewritten so no stale bytes from an earlier
        // response survive next to the fresh record.
        let mut out = [0u8; CQ_SLOT_SIZE as usize];
        out[..core::mem::size_of::<ResponseHeader>()]
            .copy_from_slice(header.as_bytes());
        out[core::mem::size_of::<ResponseHeader>()..][..reply.result.len()]
            .copy_from_slice(&reply.result);
        mem_write_bytes(io, cq_slot, &out);

        self.q.cq_commit(io);
        self.q.signal(io);
        self.q.sq_commit(io);

        self.stats.requests += 1;
        self.stats.count(reply.status);
        Ok(true)
    }

    fn handle<I: SgcqIo>(&mut self, io: &I, raw: &[u8]) -> (u16, Reply) {
        // Infallible: `raw` is exactly record-sized.
        let Ok(record) = RequestRecord::read_from_bytes(raw) else {
            return (0, Reply::status(CmdStatus::MalformedRequest));
        };

        if record.magic != REQUEST_MAGIC {
            self.stats.bad_magic += 1;
            self.trace.record(Event::BadMagic);
            return (record.req_id, Reply::status(CmdStatus::MalformedRequest));
        }

        let Some(op) = MgmtOp::from_wire(record.op) else {
            return (
                record.req_id,
                Reply::status(CmdStatus::UnsupportedOpcode),
            );
        };
        self.trace.record(Event::Request { op: record.op });

        let reply = match op {
            MgmtOp::Identify => self.identify(),
            MgmtOp::BoardInfo => self.board_info(&record),
            MgmtOp::FptHeaderRead => self.fpt_header_read(&record),
            MgmtOp::FptPartitionRead => self.fpt_partition_read(&record),
            MgmtOp::PdiDownload => self.pdi_download(io, &record),
            MgmtOp::PartitionSelect => self.partition_select(&record),
            MgmtOp::PartitionCopy => self.partition_copy(&record),
            MgmtOp::ModuleRead => self.module_read(&record),
            MgmtOp::ModuleWrite => self.module_write(io, &record),
        };
        (record.req_id, reply)
    }

    fn identify(&mut self) -> Reply {
        let info = IdentifyInfo {
            wire_version: WIRE_VERSION,
            fw_build: self.fw_build,
        };
        Reply::ok_with(info.as_bytes())
    }

    fn board_info(&mut self, record: &RequestRecord) -> Reply {
        let len = record.arg1 as usize;
        if len > INLINE_RESULT_MAX {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        let mut buf = [0u8; INLINE_RESULT_MAX];
        match self.board.read(record.arg0, &mut buf[..len]) {
            Ok(n) => Reply::ok_with(&buf[..n.min(len)]),
            Err(sub) => Reply::failure(sub),
        }
    }

    fn boot_device(arg: u32) -> Option<BootDevice> {
        BootDevice::from_u32(arg)
    }

    fn fpt_header_read(&mut self, record: &RequestRecord) -> Reply {
        let Some(boot) = Self::boot_device(record.arg0) else {
            return Reply::status(CmdStatus::MalformedRequest);
        };
        let bytes = match self.store.fpt(boot) {
            Ok(bytes) => bytes,
            Err(sub) => return Reply::failure(sub),
        };
        let Ok((header, _)) = FptHeader::read_from_prefix(bytes) else {
            return Reply::status(CmdStatus::IntegrityFailure);
        };
        let len = usize::from(header.header_size);
        match bytes.get(..len) {
            Some(prefix) if len <= INLINE_RESULT_MAX => {
                Reply::ok_with(prefix)
            }
            _ => Reply::status(CmdStatus::IntegrityFailure),
        }
    }

    fn fpt_partition_read(&mut self, record: &RequestRecord) -> Reply {
        let Some(boot) = Self::boot_device(record.arg0) else {
            return Reply::status(CmdStatus::MalformedRequest);
        };
        let index = record.arg1 as usize;
        let bytes = match self.store.fpt(boot) {
            Ok(bytes) => bytes,
            Err(sub) => return Reply::failure(sub),
        };
        let Ok((header, _)) = FptHeader::read_from_prefix(bytes) else {
            return Reply::status(CmdStatus::IntegrityFailure);
        };
        if index >= usize::from(header.num_entries) {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        let entry_size = usize::from(header.entry_size);
        if entry_size > INLINE_RESULT_MAX {
            return Reply::status(CmdStatus::IntegrityFailure);
        }
        let off =
            usize::from(header.header_size) + index * entry_size;
        match bytes.get(off..off + entry_size) {
            Some(entry) => Reply::ok_with(entry),
            None => Reply::status(CmdStatus::IntegrityFailure),
        }
    }

    /// Copies a request payload from the bulk region into `chunk_buf`,
    /// bounds-checked, and returns its length.
    fn read_payload<I: SgcqIo>(
        &mut self,
        io: &I,
        record: &RequestRecord,
        max_len: usize,
    ) -> Result<usize, Reply> {
        let len = record.payload_len as usize;
        if len == 0 || len > max_len {
            return Err(Reply::status(CmdStatus::MalformedRequest));
        }
        let padded = len.div_ceil(4) * 4;
        let addr = u64::from(record.payload_addr);
        let bulk_end = self.bulk_base + u64::from(self.bulk_len);
        if addr < self.bulk_base || addr + padded as u64 > bulk_end {
            return Err(Reply::status(CmdStatus::MalformedRequest));
        }
        mem_read_bytes(io, addr, &mut self.chunk_buf[..padded]);
        Ok(len)
    }

    fn pdi_download<I: SgcqIo>(
        &mut self,
        io: &I,
        record: &RequestRecord,
    ) -> Reply {
        let flags = PdiFlags(record.flags);
        let Some(boot) = flags.boot_device() else {
            return Reply::status(CmdStatus::MalformedRequest);
        };
        let partition = flags.partition();
        let chunk = flags.chunk();
        let last = flags.is_last();

        let len = match self.read_payload(io, record, PDI_CHUNK_SIZE) {
            Ok(len) => len,
            Err(reply) => return reply,
        };
        // Every chunk but the last is full-sized; anything else is a
        // framing error.
        if !last && len != PDI_CHUNK_SIZE {
            return Reply::status(CmdStatus::MalformedRequest);
        }

        // Work out whether this chunk continues a stream, restarts one, or
        // is out of place.
        let limit = if chunk == 0 {
            // Chunk 0 starts (or restarts) a stream, clearing any aborted
            // latch for this target.
            let limit = if flags.is_fpt_update() {
                u32::MAX
            } else {
                let bytes = match self.store.fpt(boot) {
                    Ok(bytes) => bytes,
                    Err(sub) => return Reply::failure(sub),
                };
                let table = match FptTable::parse(bytes) {
                    Ok(table) => table,
                    Err(_) => {
                        return Reply::status(CmdStatus::IntegrityFailure)
                    }
                };
                match table.entry(usize::from(partition)) {
                    Some(entry) => entry.size,
                    None => {
                        return Reply::status(CmdStatus::MalformedRequest)
                    }
                }
            };
            self.trace.record(Event::StreamStarted { partition });
            limit
        } else {
            match self.stream {
                StreamState::Aborted { boot: b, partition: p }
                    if b == boot && p == partition =>
                {
                    self.trace.record(Event::StreamRejected { chunk });
                    return Reply::status(CmdStatus::StreamAborted);
                }
                StreamState::Active {
                    boot: b,
                    partition: p,
                    next_chunk,
                    limit,
                } if b == boot && p == partition && chunk == next_chunk => {
                    limit
                }
                StreamState::Active { boot: b, partition: p, .. }
                    if b == boot && p == partition =>
                {
                    // In-stream chunk out of order: the stream is no
                    // longer trustworthy.
                    self.stream = StreamState::Aborted { boot, partition };
                    self.trace.record(Event::StreamAborted { chunk });
                    return Reply::status(CmdStatus::MalformedRequest);
                }
                _ => {
                    self.trace.record(Event::StreamRejected { chunk });
                    return Reply::status(CmdStatus::MalformedRequest);
                }
            }
        };

        let offset = u32::from(chunk) * PDI_CHUNK_SIZE as u32;
        if u64::from(offset) + len as u64 > u64::from(limit) {
            self.stream = StreamState::Aborted { boot, partition };
            self.trace.record(Event::StreamAborted { chunk });
            return Reply::status(CmdStatus::MalformedRequest);
        }

        let programmed = if flags.is_fpt_update() {
            self.store.update_fpt_chunk(boot, offset, &self.chunk_buf[..len])
        } else {
            self.store.program_chunk(
                boot,
                partition,
                offset,
                &self.chunk_buf[..len],
            )
        };

        match programmed {
            Ok(()) => {
                self.trace.record(Event::ChunkProgrammed { chunk });
                if last {
                    self.stream = StreamState::Idle;
                    self.trace.record(Event::StreamDone);
                } else {
                    self.stream = StreamState::Active {
                        boot,
                        partition,
                        next_chunk: chunk + 1,
                        limit,
                    };
                }
                Reply::ok()
            }
            Err(sub) => {
                self.stream = StreamState::Aborted { boot, partition };
                self.trace.record(Event::StreamAborted { chunk });
                Reply::failure(sub)
            }
        }
    }

    fn partition_select(&mut self, record: &RequestRecord) -> Reply {
        let flags = PdiFlags(record.flags);
        let Some(boot) = flags.boot_device() else {
            return Reply::status(CmdStatus::MalformedRequest);
        };
        // A partition select clears an aborted-stream latch left behind by
        // a vanished producer.
        if let StreamState::Aborted { boot: b, .. } = self.stream {
            if b == boot {
                self.stream = StreamState::Idle;
            }
        }
        match self.store.select_partition(boot, flags.partition()) {
            Ok(()) => Reply::ok(),
            Err(sub) => Reply::failure(sub),
        }
    }

    fn partition_exists(&mut self, boot: BootDevice, partition: u8) -> bool {
        let Ok(bytes) = self.store.fpt(boot) else {
            return false;
        };
        let Ok(table) = FptTable::parse(bytes) else {
            return false;
        };
        table.entry(usize::from(partition)).is_some()
    }

    fn partition_copy(&mut self, record: &RequestRecord) -> Reply {
        let flags = CopyFlags(record.flags);
        let (Some(src_dev), Some(dest_dev)) =
            (flags.src_device(), flags.dest_device())
        else {
            return Reply::status(CmdStatus::MalformedRequest);
        };
        let src = (src_dev, flags.src_partition());
        let dest = (dest_dev, flags.dest_partition());
        if src == dest {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        if !self.partition_exists(src.0, src.1)
            || !self.partition_exists(dest.0, dest.1)
        {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        match self.store.copy_partition(src, dest) {
            Ok(()) => Reply::ok(),
            Err(sub) => Reply::failure(sub),
        }
    }

    fn module_read(&mut self, record: &RequestRecord) -> Reply {
        let sel = ModuleSelect(record.arg0);
        let len = usize::from(sel.len());
        if len > INLINE_RESULT_MAX {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        let mut buf = [0u8; INLINE_RESULT_MAX];
        match self.modules.read(
            sel.cage(),
            sel.page(),
            sel.offset(),
            &mut buf[..len],
        ) {
            Ok(()) => Reply::ok_with(&buf[..len]),
            Err(sub) => Reply::failure(sub),
        }
    }

    fn module_write<I: SgcqIo>(
        &mut self,
        io: &I,
        record: &RequestRecord,
    ) -> Reply {
        let sel = ModuleSelect(record.arg0);
        if record.payload_len != u32::from(sel.len()) {
            return Reply::status(CmdStatus::MalformedRequest);
        }
        let len = match self.read_payload(io, record, PDI_CHUNK_SIZE) {
            Ok(len) => len,
            Err(reply) => return reply,
        };
        // Split borrows: the payload sits in chunk_buf, the write goes to
        // the module seam.
        let Self { modules, chunk_buf, .. } = self;
        match modules.write(sel.cage(), sel.page(), sel.offset(), &chunk_buf[..len])
        {
            Ok(()) => Reply::ok(),
            Err(sub) => Reply::failure(sub),
        }
    }
}
