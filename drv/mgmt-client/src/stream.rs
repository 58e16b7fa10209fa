// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunked PDI streaming.
//!
//! [`PdiStream`] is the producer-side state machine, free of any transport:
//! it slices the image into [`PDI_CHUNK_SIZE`] chunks, hands out the flags
//! word for each, and tracks acknowledged progress. Exactly one chunk is in
//! flight at a time; the next chunk is not offered until the previous one
//! is acked, which bounds the device-side buffer to a single chunk and
//! makes progress reporting exact.
//!
//! [`MgmtClient::download_pdi`] and [`MgmtClient::update_fpt`] drive the
//! machine over the wire, staging each chunk in the bulk region and waiting
//! for its completion before advancing.

use drv_mgmt_api::{
    BootDevice, CmdStatus, MgmtOp, PdiFlags, RequestRecord,
    FPT_UPDATE_PARTITION, PDI_CHUNK_SIZE, PDI_MAX_CHUNK,
};
use fpt::FptTable;
use sgcq::SgcqIo;

use crate::{MgmtClient, MgmtError, Timebase};

/// Producer-side stream state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    /// Chunks remain and none is in flight.
    Streaming,
    /// A chunk has been handed out and not yet acked.
    AwaitingAck,
    /// The final chunk was acked.
    Done,
}

#[derive(Debug)]
pub struct PdiStream<'a> {
    image: &'a [u8],
    boot: BootDevice,
    partition: u8,
    phase: StreamPhase,
    next_chunk: u16,
    bytes_acked: usize,
}

impl<'a> PdiStream<'a> {
    /// Prepares a stream. Fails only if the image needs more chunks than
    /// the 15-bit chunk counter can number.
    pub fn new(
        image: &'a [u8],
        boot: BootDevice,
        partition: u8,
    ) -> Result<Self, MgmtError> {
        let chunks = image.len().div_ceil(PDI_CHUNK_SIZE);
        if chunks > usize::from(PDI_MAX_CHUNK) + 1 {
            return Err(MgmtError::TooManyChunks);
        }
        Ok(Self {
            image,
            boot,
            partition,
            phase: if image.is_empty() {
                StreamPhase::Done
            } else {
                StreamPhase::Streaming
            },
            next_chunk: 0,
            bytes_acked: 0,
        })
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn bytes_total(&self) -> u64 {
        self.image.len() as u64
    }

    /// Hands out the next chunk to post, or `None` when the stream is done
    /// or a chunk is already in flight.
    pub fn next_chunk(&mut self) -> Option<(PdiFlags, &'a [u8])> {
        if self.phase != StreamPhase::Streaming {
            return None;
        }
        let start = usize::from(self.next_chunk) * PDI_CHUNK_SIZE;
        let image = self.image;
        let rest = &image[start..];
        let len = rest.len().min(PDI_CHUNK_SIZE);
        let last = rest.len() <= PDI_CHUNK_SIZE;
        let flags =
            PdiFlags::new(self.boot, self.partition, self.next_chunk, last);
        self.phase = StreamPhase::AwaitingAck;
        Some((flags, &rest[..len]))
    }

    /// Records the successful ack of the in-flight chunk and returns
    /// `(bytes_written, bytes_total)` for progress reporting.
    pub fn ack(&mut self) -> (u64, u64) {
        debug_assert_eq!(self.phase, StreamPhase::AwaitingAck);
        let start = usize::from(self.next_chunk) * PDI_CHUNK_SIZE;
        let acked = (self.image.len() - start).min(PDI_CHUNK_SIZE);
        self.bytes_acked = start + acked;

        if self.bytes_acked == self.image.len() {
            self.phase = StreamPhase::Done;
        } else {
            self.next_chunk += 1;
            self.phase = StreamPhase::Streaming;
        }
        (self.bytes_acked as u64, self.image.len() as u64)
    }
}

impl<const N: usize> MgmtClient<N> {
    /// Streams `image` into `partition` of `boot`, reporting progress as
    /// `(bytes_written, bytes_total)` after every acknowledged chunk.
    ///
    /// The target partition must exist in the device's FPT and be large
    /// enough for the image; the table is read (and checksum-validated)
    /// before the first chunk is posted. On a chunk failure the stream is
    /// dead and the error names the failing chunk; the device will reject
    /// further chunks until a restart from chunk 0.
    pub fn download_pdi(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        image: &[u8],
        boot: BootDevice,
        partition: u8,
        timeout_ms: u64,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<(), MgmtError> {
        let raw = self.read_fpt_raw(io, tb, boot, timeout_ms)?;
        let table = FptTable::parse(&raw)?;
        let entry = table
            .entry(usize::from(partition))
            .ok_or(MgmtError::PartitionMissing)?;
        if image.len() as u64 > u64::from(entry.size) {
            return Err(MgmtError::ImageTooLarge);
        }
        self.stream_image(io, tb, image, boot, partition, timeout_ms, &mut progress)
    }

    /// Streams an image containing a replacement Flash Partition Table.
    /// No table precheck: the FPT is what's being rewritten.
    pub fn update_fpt(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        image: &[u8],
        boot: BootDevice,
        timeout_ms: u64,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<(), MgmtError> {
        self.stream_image(
            io,
            tb,
            image,
            boot,
            FPT_UPDATE_PARTITION,
            timeout_ms,
            &mut progress,
        )
    }

    fn stream_image(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        image: &[u8],
        boot: BootDevice,
        partition: u8,
        timeout_ms: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), MgmtError> {
        let mut stream = PdiStream::new(image, boot, partition)?;

        while let Some((flags, payload)) = stream.next_chunk() {
            let (addr, len) = self.stage_payload(io, payload)?;

            let mut record = RequestRecord::new(MgmtOp::PdiDownload, 0);
            record.flags = flags.0;
            record.payload_addr = addr;
            record.payload_len = len;

            let completion = self.transact(io, tb, record, timeout_ms)?;
            if completion.status != CmdStatus::Success {
                return Err(MgmtError::ChunkFailed {
                    chunk: flags.chunk(),
                    status: completion.status,
                });
            }

            let (written, total) = stream.ack();
            progress(written, total);
        }
        Ok(())
    }
}
