// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared generic command queue (sGCQ) transport.
//!
//! A pair of single-producer/single-consumer rings, the submission queue
//! (SQ, host to device) and the completion queue (CQ, device to host), laid
//! out in a shared memory window that both a host driver and device firmware
//! can reach, plus a small register file for tail pointers and doorbells.
//!
//! The producer side publishes a header describing the ring geometry; the
//! consumer side attaches by reading and validating it. The magic word is
//! written last during creation and cleared on teardown, so an attacher can
//! never observe a half-written header as valid.
//!
//! All shared state is reached through the [`SgcqIo`] access trait, keeping
//! the engine portable between a PCIe BAR mapping on the host side and a
//! local RAM window in firmware. The ring engine itself never blocks: full
//! and empty conditions come back as [`SgcqError::NoFreeSlot`] and
//! [`SgcqError::NoData`] and the caller decides whether to yield.
//!
//! Ownership across the boundary is by discipline, not by lock: for each
//! index counter exactly one side writes and the other reads, and a slot
//! belongs to the producer until `commit_produce` and to the consumer until
//! `commit_consume`.

#![cfg_attr(not(test), no_std)]

mod instance;
mod ring;

pub use instance::{
    attach_consumer, create_producer, Geometry, InterruptMode, SgcqConfig,
    SgcqConsumer, SgcqProducer,
};

use bitflags::bitflags;

/// Width of the shared header, in bytes.
pub const HEADER_SIZE: u32 = 48;

/// Sentinel identifying a published header.
pub const HEADER_MAGIC: u32 = 0x5347_4351;

/// Wire-format revision. Peers must match exactly.
pub const HEADER_VERSION: u32 = 1;

bitflags! {
    /// Feature flags negotiated through the shared header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SgcqFeatures: u32 {
        /// Produced indices live in the shared header rather than in the
        /// tail-pointer registers. Platforms without a dedicated tail
        /// register set this and poll (or use the manual doorbell).
        const IN_MEM_PTR = 1 << 0;
        /// Platform quirk: a freshly written shared-memory word may be
        /// stale on its first read. Index counter reads are performed twice
        /// and the second value taken.
        const NEEDS_DOUBLE_READ = 1 << 1;
        /// Hint: tail-pointer register writes raise the peer's interrupt.
        const INT_TAIL_POINTER = 1 << 2;
        /// Hint: interrupts are raised through the manual trigger register.
        const INT_MANUAL = 1 << 3;
    }
}

/// sGCQ register file, byte offsets within the register block.
pub mod regs {
    /// SQ produced index (tail pointer). Writing it raises the consumer's
    /// interrupt when tail-pointer triggering is configured in hardware.
    pub const SQ_TAIL: u64 = 0x00;
    pub const SQ_INT_ENABLE: u64 = 0x04;
    pub const SQ_INT_STATUS: u64 = 0x08;
    /// Manual doorbell toward the consumer.
    pub const SQ_INT_TRIGGER: u64 = 0x0c;
    /// CQ produced index (tail pointer).
    pub const CQ_TAIL: u64 = 0x10;
    pub const CQ_INT_ENABLE: u64 = 0x14;
    pub const CQ_INT_STATUS: u64 = 0x18;
    /// Manual doorbell toward the producer.
    pub const CQ_INT_TRIGGER: u64 = 0x1c;
}

/// Access to the sGCQ register file and the shared memory window.
///
/// Register and memory accesses are kept separate because they may need
/// different barriers or cache handling depending on how the window is
/// mapped. Implementations must guarantee that a `mem_write32` is globally
/// visible before a subsequent `reg_write32` to a doorbell register on the
/// same instance.
///
/// All accesses are 32-bit and naturally aligned. Byte and 16-bit
/// granularity are emulated above this layer, never inside the ring engine.
/// Addresses are window-relative byte offsets.
pub trait SgcqIo {
    fn reg_read32(&self, addr: u64) -> u32;
    fn reg_write32(&mut self, addr: u64, value: u32);
    fn mem_read32(&self, addr: u64) -> u32;
    fn mem_write32(&mut self, addr: u64, value: u32);
}

/// Errors surfaced by the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SgcqError {
    /// Header magic, version, or geometry failed validation. Fatal to the
    /// session.
    InvalidHeader,
    /// No header has been published yet; the attacher may retry with
    /// backoff.
    PeerNotReady,
    /// The published slot sizes are smaller than this peer requires.
    Incompatible,
    /// The ring is full. Transient; yield and retry.
    NoFreeSlot,
    /// The ring is empty. Transient; yield and retry.
    NoData,
}

/// Word-granular bulk copy into the shared window. `bytes.len()` must be a
/// multiple of 4.
pub fn mem_write_bytes(io: &mut impl SgcqIo, mut addr: u64, bytes: &[u8]) {
    debug_assert!(bytes.len() % 4 == 0);
    for word in bytes.chunks_exact(4) {
        let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        io.mem_write32(addr, w);
        addr += 4;
    }
}

/// Word-granular bulk copy out of the shared window. `out.len()` must be a
/// multiple of 4.
pub fn mem_read_bytes(io: &impl SgcqIo, mut addr: u64, out: &mut [u8]) {
    debug_assert!(out.len() % 4 == 0);
    for word in out.chunks_exact_mut(4) {
        word.copy_from_slice(&io.mem_read32(addr).to_le_bytes());
        addr += 4;
    }
}

#[cfg(test)]
mod test_io;

#[cfg(test)]
mod tests {
    use super::test_io::TestWindow;
    use super::*;

    fn config(num_slots: u32) -> SgcqConfig {
        SgcqConfig {
            num_slots,
            sq_slot_size: 64,
            cq_slot_size: 64,
            flags: SgcqFeatures::IN_MEM_PTR,
            interrupt_mode: InterruptMode::None,
        }
    }

    #[test]
    fn empty_queue() {
        // Fresh header, four slots. The SQ has no data and the first
        // reservation lands on slot 0.
        let mut win = TestWindow::new(4096);
        let mut prod = create_producer(&mut win, 0, &config(4)).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        assert_eq!(cons.sq_peek(&win), Err(SgcqError::NoData));

        let slot = prod.sq_reserve(&win).unwrap();
        assert_eq!(slot, u64::from(HEADER_SIZE));
    }

    #[test]
    fn fill_and_drain() {
        // Four 16-byte records posted and drained one at a time; the
        // consumer observes byte-identical contents and the ring returns to
        // empty with both counters at 4.
        let mut win = TestWindow::new(4096);
        let mut prod = create_producer(&mut win, 0, &config(4)).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        for i in 0..4u8 {
            let record = [i; 16];
            let slot = prod.sq_reserve(&win).unwrap();
            mem_write_bytes(&mut win, slot, &record);
            prod.sq_commit(&mut win);

            let slot = cons.sq_peek(&win).unwrap();
            let mut seen = [0u8; 16];
            mem_read_bytes(&win, slot, &mut seen);
            assert_eq!(seen, record);
            cons.sq_commit(&mut win);
        }

        assert_eq!(cons.sq_peek(&win), Err(SgcqError::NoData));
        assert_eq!(win.mem_read32(0x28), 4); // sq produced
        assert_eq!(win.mem_read32(0x1c), 4); // sq consumed
    }

    #[test]
    fn overflow() {
        // Two slots, three posts without draining. The third reservation
        // reports a full ring until one record is drained.
        let mut win = TestWindow::new(4096);
        let mut prod = create_producer(&mut win, 0, &config(2)).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        for _ in 0..2 {
            prod.sq_reserve(&win).unwrap();
            prod.sq_commit(&mut win);
        }
        assert_eq!(prod.sq_reserve(&win), Err(SgcqError::NoFreeSlot));

        cons.sq_peek(&win).unwrap();
        cons.sq_commit(&mut win);
        prod.sq_reserve(&win).unwrap();
    }

    #[test]
    fn double_read_discards_stale_counter() {
        // Under NEEDS_DOUBLE_READ the first read of the produced counter
        // may be stale; the second read is taken and the consumer must never
        // run past the producer.
        let mut win = TestWindow::new(4096);
        let cfg = SgcqConfig {
            flags: SgcqFeatures::IN_MEM_PTR | SgcqFeatures::NEEDS_DOUBLE_READ,
            ..config(4)
        };
        let mut prod = create_producer(&mut win, 0, &cfg).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        let slot = prod.sq_reserve(&win).unwrap();
        mem_write_bytes(&mut win, slot, &[0xab; 16]);
        prod.sq_commit(&mut win);

        // First read of sq_produced returns the stale pre-commit value.
        win.set_stale_read(0x28, 0);
        let slot = cons.sq_peek(&win).unwrap();
        let mut seen = [0u8; 16];
        mem_read_bytes(&win, slot, &mut seen);
        assert_eq!(seen, [0xab; 16]);
        cons.sq_commit(&mut win);

        // A stale value larger than the real counter must not make the
        // consumer see phantom records either.
        win.set_stale_read(0x28, 7);
        assert_eq!(cons.sq_peek(&win), Err(SgcqError::NoData));
    }

    #[test]
    fn reattach_resumes_counters() {
        // A consumer that re-attaches mid-session picks up the live index
        // counters rather than assuming an empty ring.
        let mut win = TestWindow::new(4096);
        let mut prod = create_producer(&mut win, 0, &config(4)).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        for _ in 0..3 {
            prod.sq_reserve(&win).unwrap();
            prod.sq_commit(&mut win);
        }
        cons.sq_peek(&win).unwrap();
        cons.sq_commit(&mut win);
        drop(cons);

        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();
        let slot = cons.sq_peek(&win).unwrap();
        assert_eq!(slot, u64::from(HEADER_SIZE) + 64);
        cons.sq_commit(&mut win);
        cons.sq_peek(&win).unwrap();
        cons.sq_commit(&mut win);
        assert_eq!(cons.sq_peek(&win), Err(SgcqError::NoData));
    }

    #[test]
    fn attach_is_idempotent() {
        // Attaching twice to an unchanged header yields identically
        // configured handles.
        let mut win = TestWindow::new(4096);
        create_producer(&mut win, 0, &config(4)).unwrap();

        let a = attach_consumer(&mut win, 0, 64, 64).unwrap();
        let b = attach_consumer(&mut win, 0, 64, 64).unwrap();
        assert_eq!(a.geometry(), b.geometry());
        assert_eq!(a.features(), b.features());
        assert_eq!(a.interrupt_mode(), b.interrupt_mode());
    }

    #[test]
    fn attach_before_publish() {
        let mut win = TestWindow::new(4096);
        assert_eq!(
            attach_consumer(&mut win, 0, 64, 64).unwrap_err(),
            SgcqError::PeerNotReady
        );
    }

    #[test]
    fn attach_validates_header() {
        let mut win = TestWindow::new(4096);
        create_producer(&mut win, 0, &config(4)).unwrap();

        // Version mismatch is fatal.
        win.mem_write32(0x04, HEADER_VERSION + 1);
        assert_eq!(
            attach_consumer(&mut win, 0, 64, 64).unwrap_err(),
            SgcqError::InvalidHeader
        );
        win.mem_write32(0x04, HEADER_VERSION);

        // Slot count must be a power of two.
        win.mem_write32(0x08, 3);
        assert_eq!(
            attach_consumer(&mut win, 0, 64, 64).unwrap_err(),
            SgcqError::InvalidHeader
        );
        win.mem_write32(0x08, 4);

        // Published slots smaller than what this peer writes are rejected.
        assert_eq!(
            attach_consumer(&mut win, 0, 64, 128).unwrap_err(),
            SgcqError::Incompatible
        );
    }

    #[test]
    fn teardown_clears_magic() {
        let mut win = TestWindow::new(4096);
        let prod = create_producer(&mut win, 0, &config(4)).unwrap();
        attach_consumer(&mut win, 0, 64, 64).unwrap();

        prod.teardown(&mut win);
        assert_eq!(
            attach_consumer(&mut win, 0, 64, 64).unwrap_err(),
            SgcqError::PeerNotReady
        );
    }

    #[test]
    fn cq_flows_toward_producer() {
        // The device is the CQ producer; the host drains it. Layout check:
        // the CQ slot array starts after the SQ slots.
        let mut win = TestWindow::new(4096);
        let mut prod = create_producer(&mut win, 0, &config(4)).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        let slot = cons.cq_reserve(&win).unwrap();
        assert_eq!(slot, u64::from(HEADER_SIZE) + 4 * 64);
        mem_write_bytes(&mut win, slot, &[0x5a; 16]);
        cons.cq_commit(&mut win);

        let slot = prod.cq_peek(&win).unwrap();
        let mut seen = [0u8; 16];
        mem_read_bytes(&win, slot, &mut seen);
        assert_eq!(seen, [0x5a; 16]);
        prod.cq_commit(&mut win);
        assert_eq!(prod.cq_peek(&win), Err(SgcqError::NoData));
    }

    #[test]
    fn tail_registers_when_not_in_mem() {
        // Without IN_MEM_PTR the produced indices live in the tail-pointer
        // registers, not the header.
        let mut win = TestWindow::new(4096);
        let cfg = SgcqConfig {
            flags: SgcqFeatures::empty(),
            ..config(4)
        };
        let mut prod = create_producer(&mut win, 0, &cfg).unwrap();
        let mut cons = attach_consumer(&mut win, 0, 64, 64).unwrap();

        prod.sq_reserve(&win).unwrap();
        prod.sq_commit(&mut win);
        assert_eq!(win.reg_read32(regs::SQ_TAIL), 1);
        assert_eq!(win.mem_read32(0x28), 0); // header mirror untouched

        cons.sq_peek(&win).unwrap();
        cons.sq_commit(&mut win);
        assert_eq!(win.mem_read32(0x1c), 1); // consumed always in header
    }

    #[test]
    fn manual_doorbell() {
        let mut win = TestWindow::new(4096);
        let cfg = SgcqConfig {
            interrupt_mode: InterruptMode::ManualTrigger,
            ..config(4)
        };
        let prod = create_producer(&mut win, 0, &cfg).unwrap();
        let cons = attach_consumer(&mut win, 0, 64, 64).unwrap();
        assert_eq!(cons.interrupt_mode(), InterruptMode::ManualTrigger);

        prod.signal(&mut win);
        assert_eq!(win.reg_read32(regs::SQ_INT_TRIGGER), 1);
        cons.signal(&mut win);
        assert_eq!(win.reg_read32(regs::CQ_INT_TRIGGER), 1);
    }
}
