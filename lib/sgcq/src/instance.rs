// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header lifecycle and role binding.
//!
//! The producer writes the shared header (magic last) and configures the
//! interrupt registers; the consumer attaches by validating what it finds.
//! The two roles get distinct types so a consumer can never be asked to
//! reserve an SQ slot: misuse is a compile error rather than a runtime
//! check.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ring::{Counter, Ring};
use crate::{
    regs, SgcqError, SgcqFeatures, SgcqIo, HEADER_MAGIC, HEADER_SIZE,
    HEADER_VERSION,
};

/// Shared header published at the base of the ring window.
///
/// Both peers touch this only through 32-bit word accesses; the struct
/// exists to pin the layout and feed the word copies. Fields other than the
/// four index counters are immutable once the magic is published.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    num_slots: u32,
    sq_offset: u32,
    sq_slot_size: u32,
    cq_offset: u32,
    cq_slot_size: u32,
    sq_consumed: u32,
    cq_consumed: u32,
    flags: u32,
    sq_produced: u32,
    cq_produced: u32,
}

const_assert_eq!(core::mem::size_of::<RawHeader>(), HEADER_SIZE as usize);

// Byte offsets of the index counters within the header. The counters are
// addressed individually at runtime; everything else moves as whole-header
// word copies.
const HDR_MAGIC: u64 = 0x00;
const HDR_SQ_CONSUMED: u64 = 0x1c;
const HDR_CQ_CONSUMED: u64 = 0x20;
const HDR_SQ_PRODUCED: u64 = 0x28;
const HDR_CQ_PRODUCED: u64 = 0x2c;

/// How a committing producer gets the peer's attention.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    /// Peers poll; no interrupts.
    None,
    /// Writing the tail-pointer register raises the peer's interrupt as a
    /// hardware side effect.
    TailPointerTrigger,
    /// A separate trigger register is written after each commit; see
    /// [`SgcqProducer::signal`].
    ManualTrigger,
}

/// Geometry and behavior requested of a new instance.
#[derive(Copy, Clone, Debug)]
pub struct SgcqConfig {
    /// Ring depth, shared by SQ and CQ. Must be a power of two.
    pub num_slots: u32,
    /// Byte size of one SQ slot; at least the largest request record.
    pub sq_slot_size: u32,
    /// Byte size of one CQ slot; at least the largest response record.
    pub cq_slot_size: u32,
    pub flags: SgcqFeatures,
    pub interrupt_mode: InterruptMode,
}

/// Ring geometry as negotiated through the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub num_slots: u32,
    pub sq_slot_size: u32,
    pub cq_slot_size: u32,
}

/// State common to both roles.
#[derive(Debug)]
struct Shared {
    ring_base: u64,
    geometry: Geometry,
    flags: SgcqFeatures,
    interrupt_mode: InterruptMode,
    sq: Ring,
    cq: Ring,
}

fn validate_geometry(g: &Geometry) -> Result<(), SgcqError> {
    if g.num_slots == 0 || !g.num_slots.is_power_of_two() {
        return Err(SgcqError::InvalidHeader);
    }
    // Slots are moved with word copies; sub-word slot sizes make no sense.
    if g.sq_slot_size == 0
        || g.sq_slot_size % 4 != 0
        || g.cq_slot_size == 0
        || g.cq_slot_size % 4 != 0
    {
        return Err(SgcqError::InvalidHeader);
    }
    Ok(())
}

fn build_rings(
    ring_base: u64,
    hdr: &RawHeader,
    flags: SgcqFeatures,
) -> (Ring, Ring) {
    let in_mem = flags.contains(SgcqFeatures::IN_MEM_PTR);

    // Consumed indices always live in the header: advancing them never
    // needs to raise an interrupt. Produced indices live in the tail
    // registers unless the platform lacks them.
    let sq_produced_at = if in_mem {
        Counter::Mem(ring_base + HDR_SQ_PRODUCED)
    } else {
        Counter::Reg(regs::SQ_TAIL)
    };
    let cq_produced_at = if in_mem {
        Counter::Mem(ring_base + HDR_CQ_PRODUCED)
    } else {
        Counter::Reg(regs::CQ_TAIL)
    };

    let sq = Ring::new(
        sq_produced_at,
        Counter::Mem(ring_base + HDR_SQ_CONSUMED),
        ring_base + u64::from(hdr.sq_offset),
        hdr.num_slots,
        hdr.sq_slot_size,
        hdr.sq_produced,
        hdr.sq_consumed,
        flags,
    );
    let cq = Ring::new(
        cq_produced_at,
        Counter::Mem(ring_base + HDR_CQ_CONSUMED),
        ring_base + u64::from(hdr.cq_offset),
        hdr.num_slots,
        hdr.cq_slot_size,
        hdr.cq_produced,
        hdr.cq_consumed,
        flags,
    );
    (sq, cq)
}

/// Creates a new instance in the producer role: lays out the rings behind
/// the header, publishes the header with the magic written last, zeroes the
/// tail registers, and configures interrupts.
pub fn create_producer(
    io: &mut impl SgcqIo,
    ring_base: u64,
    config: &SgcqConfig,
) -> Result<SgcqProducer, SgcqError> {
    let geometry = Geometry {
        num_slots: config.num_slots,
        sq_slot_size: config.sq_slot_size,
        cq_slot_size: config.cq_slot_size,
    };
    validate_geometry(&geometry)?;

    let mut flags = config.flags;
    flags.remove(SgcqFeatures::INT_TAIL_POINTER | SgcqFeatures::INT_MANUAL);
    match config.interrupt_mode {
        InterruptMode::None => (),
        InterruptMode::TailPointerTrigger => {
            flags.insert(SgcqFeatures::INT_TAIL_POINTER)
        }
        InterruptMode::ManualTrigger => flags.insert(SgcqFeatures::INT_MANUAL),
    }

    let hdr = RawHeader {
        magic: HEADER_MAGIC,
        version: HEADER_VERSION,
        num_slots: config.num_slots,
        sq_offset: HEADER_SIZE,
        sq_slot_size: config.sq_slot_size,
        cq_offset: HEADER_SIZE + config.num_slots * config.sq_slot_size,
        cq_slot_size: config.cq_slot_size,
        sq_consumed: 0,
        cq_consumed: 0,
        flags: flags.bits(),
        sq_produced: 0,
        cq_produced: 0,
    };

    // Publish every field before the magic; an attacher that races this
    // sees magic == 0 and retries.
    io.mem_write32(ring_base + HDR_MAGIC, 0);
    let bytes = hdr.as_bytes();
    for (i, word) in bytes.chunks_exact(4).enumerate().skip(1) {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        io.mem_write32(ring_base + 4 * i as u64, w);
    }

    if !flags.contains(SgcqFeatures::IN_MEM_PTR) {
        io.reg_write32(regs::SQ_TAIL, 0);
        io.reg_write32(regs::CQ_TAIL, 0);
    }

    let enable = match config.interrupt_mode {
        InterruptMode::None => 0,
        _ => 1,
    };
    io.reg_write32(regs::SQ_INT_ENABLE, enable);
    io.reg_write32(regs::CQ_INT_ENABLE, enable);

    io.mem_write32(ring_base + HDR_MAGIC, hdr.magic);

    let (sq, cq) = build_rings(ring_base, &hdr, flags);
    Ok(SgcqProducer {
        shared: Shared {
            ring_base,
            geometry,
            flags,
            interrupt_mode: config.interrupt_mode,
            sq,
            cq,
        },
    })
}

/// Attaches to a published header in the consumer role.
///
/// `min_sq_slot_size` / `min_cq_slot_size` are what this peer requires: the
/// SQ slots must be able to hold the records it will read, the CQ slots the
/// records it will write. Attaching is read-only and therefore idempotent:
/// two attaches against an unchanged header yield identical handles.
pub fn attach_consumer(
    io: &impl SgcqIo,
    ring_base: u64,
    min_sq_slot_size: u32,
    min_cq_slot_size: u32,
) -> Result<SgcqConsumer, SgcqError> {
    let mut bytes = [0u8; HEADER_SIZE as usize];
    for (i, word) in bytes.chunks_exact_mut(4).enumerate() {
        word.copy_from_slice(
            &io.mem_read32(ring_base + 4 * i as u64).to_le_bytes(),
        );
    }
    // Infallible: the buffer is exactly header-sized.
    let hdr = RawHeader::read_from_bytes(&bytes)
        .map_err(|_| SgcqError::InvalidHeader)?;

    match hdr.magic {
        0 => return Err(SgcqError::PeerNotReady),
        HEADER_MAGIC => (),
        _ => return Err(SgcqError::InvalidHeader),
    }
    if hdr.version != HEADER_VERSION {
        return Err(SgcqError::InvalidHeader);
    }
    let geometry = Geometry {
        num_slots: hdr.num_slots,
        sq_slot_size: hdr.sq_slot_size,
        cq_slot_size: hdr.cq_slot_size,
    };
    validate_geometry(&geometry)?;
    if hdr.sq_slot_size < min_sq_slot_size || hdr.cq_slot_size < min_cq_slot_size
    {
        return Err(SgcqError::Incompatible);
    }

    let flags = SgcqFeatures::from_bits_truncate(hdr.flags);
    let interrupt_mode = if flags.contains(SgcqFeatures::INT_MANUAL) {
        InterruptMode::ManualTrigger
    } else if flags.contains(SgcqFeatures::INT_TAIL_POINTER) {
        InterruptMode::TailPointerTrigger
    } else {
        InterruptMode::None
    };

    let (sq, cq) = build_rings(ring_base, &hdr, flags);
    Ok(SgcqConsumer {
        shared: Shared {
            ring_base,
            geometry,
            flags,
            interrupt_mode,
            sq,
            cq,
        },
    })
}

/// The request-submitting side: produces into the SQ, drains the CQ.
#[derive(Debug)]
pub struct SgcqProducer {
    shared: Shared,
}

impl SgcqProducer {
    /// See [`crate::ring`]: returns the next SQ slot address without
    /// advancing, or `NoFreeSlot`.
    pub fn sq_reserve(&mut self, io: &impl SgcqIo) -> Result<u64, SgcqError> {
        self.shared.sq.reserve_produce(io)
    }

    /// Publishes the reserved SQ slot. The slot must be fully written
    /// first.
    pub fn sq_commit(&mut self, io: &mut impl SgcqIo) {
        self.shared.sq.commit_produce(io);
    }

    /// Returns the oldest unread CQ slot address, or `NoData`.
    pub fn cq_peek(&mut self, io: &impl SgcqIo) -> Result<u64, SgcqError> {
        self.shared.cq.peek_consume(io)
    }

    /// Returns the drained CQ slot to the peer.
    pub fn cq_commit(&mut self, io: &mut impl SgcqIo) {
        self.shared.cq.commit_consume(io);
    }

    /// Rings the doorbell toward the consumer. A no-op unless the instance
    /// was configured for manual triggering.
    pub fn signal(&self, io: &mut impl SgcqIo) {
        if self.shared.interrupt_mode == InterruptMode::ManualTrigger {
            io.reg_write32(regs::SQ_INT_TRIGGER, 1);
        }
    }

    /// Acknowledges a completion interrupt from the consumer.
    pub fn ack_interrupt(&self, io: &mut impl SgcqIo) {
        io.reg_write32(regs::CQ_INT_STATUS, 1);
    }

    /// Ends the session by clearing the magic. The peer notices on its next
    /// header check and is expected to re-attach when a fresh header
    /// appears.
    pub fn teardown(self, io: &mut impl SgcqIo) {
        io.mem_write32(self.shared.ring_base + HDR_MAGIC, 0);
    }

    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    pub fn features(&self) -> SgcqFeatures {
        self.shared.flags
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.shared.interrupt_mode
    }
}

/// The request-serving side: drains the SQ, produces into the CQ.
#[derive(Debug)]
pub struct SgcqConsumer {
    shared: Shared,
}

impl SgcqConsumer {
    /// Returns the oldest unread SQ slot address, or `NoData`.
    pub fn sq_peek(&mut self, io: &impl SgcqIo) -> Result<u64, SgcqError> {
        self.shared.sq.peek_consume(io)
    }

    /// Returns the drained SQ slot to the peer.
    pub fn sq_commit(&mut self, io: &mut impl SgcqIo) {
        self.shared.sq.commit_consume(io);
    }

    /// Returns the next CQ slot address without advancing, or `NoFreeSlot`.
    pub fn cq_reserve(&mut self, io: &impl SgcqIo) -> Result<u64, SgcqError> {
        self.shared.cq.reserve_produce(io)
    }

    /// Publishes the reserved CQ slot.
    pub fn cq_commit(&mut self, io: &mut impl SgcqIo) {
        self.shared.cq.commit_produce(io);
    }

    /// Rings the doorbell toward the producer. A no-op unless the instance
    /// was configured for manual triggering.
    pub fn signal(&self, io: &mut impl SgcqIo) {
        if self.shared.interrupt_mode == InterruptMode::ManualTrigger {
            io.reg_write32(regs::CQ_INT_TRIGGER, 1);
        }
    }

    /// Acknowledges a submission interrupt from the producer.
    pub fn ack_interrupt(&self, io: &mut impl SgcqIo) {
        io.reg_write32(regs::SQ_INT_STATUS, 1);
    }

    /// Checks that the session is still up: the header magic is intact.
    pub fn session_alive(&self, io: &impl SgcqIo) -> bool {
        io.mem_read32(self.shared.ring_base + HDR_MAGIC) == HEADER_MAGIC
    }

    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    pub fn features(&self) -> SgcqFeatures {
        self.shared.flags
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.shared.interrupt_mode
    }
}
