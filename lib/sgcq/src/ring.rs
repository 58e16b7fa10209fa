// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mechanical slot accounting for one ring.
//!
//! Indices are unbounded, monotonically increasing 32-bit counters; the live
//! slot index is `counter mod num_slots`, with `num_slots` a power of two.
//! The ring is full when `produced - consumed` (wrapping) reaches
//! `num_slots` and empty when the counters are equal. Only the producing
//! side ever writes `produced` and only the consuming side ever writes
//! `consumed`; the peer's counter is refreshed from the shared window before
//! every full/empty decision.

use core::sync::atomic::{fence, Ordering};

use crate::{SgcqError, SgcqFeatures, SgcqIo};

/// Where an index counter lives: a dedicated tail-pointer register, or a
/// word in the shared header when the platform has no such register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Counter {
    Reg(u64),
    Mem(u64),
}

impl Counter {
    fn read(&self, io: &impl SgcqIo, double_read: bool) -> u32 {
        match *self {
            Counter::Reg(addr) => io.reg_read32(addr),
            Counter::Mem(addr) => {
                // The double-read quirk only afflicts shared-memory words:
                // the first read may return a stale value, the second is
                // authoritative.
                if double_read {
                    let _ = io.mem_read32(addr);
                }
                io.mem_read32(addr)
            }
        }
    }

    fn write(&self, io: &mut impl SgcqIo, value: u32) {
        match *self {
            Counter::Reg(addr) => io.reg_write32(addr, value),
            Counter::Mem(addr) => io.mem_write32(addr, value),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Ring {
    produced_at: Counter,
    consumed_at: Counter,
    slot_base: u64,
    num_slots: u32,
    slot_size: u32,
    produced: u32,
    consumed: u32,
    double_read: bool,
}

impl Ring {
    /// Binds a ring to its counters and slot storage. `produced` and
    /// `consumed` seed the local cache; a creating producer passes zeros, an
    /// attaching peer passes the values currently published in the window.
    pub(crate) fn new(
        produced_at: Counter,
        consumed_at: Counter,
        slot_base: u64,
        num_slots: u32,
        slot_size: u32,
        produced: u32,
        consumed: u32,
        flags: SgcqFeatures,
    ) -> Self {
        debug_assert!(num_slots.is_power_of_two());
        Self {
            produced_at,
            consumed_at,
            slot_base,
            num_slots,
            slot_size,
            produced,
            consumed,
            double_read: flags.contains(SgcqFeatures::NEEDS_DOUBLE_READ),
        }
    }

    fn is_full(&self) -> bool {
        self.produced.wrapping_sub(self.consumed) >= self.num_slots
    }

    fn is_empty(&self) -> bool {
        self.produced == self.consumed
    }

    fn slot_addr(&self, counter: u32) -> u64 {
        self.slot_base
            + u64::from(self.slot_size) * u64::from(counter & (self.num_slots - 1))
    }

    /// Returns the address of the slot the next record will occupy, without
    /// advancing `produced`. Refreshes the peer's consumed index first so a
    /// concurrent drain is observed.
    pub(crate) fn reserve_produce(
        &mut self,
        io: &impl SgcqIo,
    ) -> Result<u64, SgcqError> {
        self.consumed = self.consumed_at.read(io, self.double_read);
        if self.is_full() {
            return Err(SgcqError::NoFreeSlot);
        }
        Ok(self.slot_addr(self.produced))
    }

    /// Advances `produced` and publishes it. The release fence keeps the
    /// slot contents globally visible before the peer can observe the new
    /// index.
    pub(crate) fn commit_produce(&mut self, io: &mut impl SgcqIo) {
        self.produced = self.produced.wrapping_add(1);
        fence(Ordering::Release);
        self.produced_at.write(io, self.produced);
    }

    /// Returns the address of the oldest unconsumed slot, or `NoData`.
    /// Refreshes `produced` from the peer; the acquire fence keeps slot
    /// reads from being hoisted above the index load. Under the double-read
    /// quirk the repeated load stands in for the fence on the torn word.
    pub(crate) fn peek_consume(
        &mut self,
        io: &impl SgcqIo,
    ) -> Result<u64, SgcqError> {
        self.produced = self.produced_at.read(io, self.double_read);
        fence(Ordering::Acquire);
        if self.is_empty() {
            return Err(SgcqError::NoData);
        }
        Ok(self.slot_addr(self.consumed))
    }

    /// Advances `consumed` and publishes it, returning the slot to the
    /// producer. Slot reads must be complete by then, hence the fence.
    pub(crate) fn commit_consume(&mut self, io: &mut impl SgcqIo) {
        self.consumed = self.consumed.wrapping_add(1);
        fence(Ordering::Release);
        self.consumed_at.write(io, self.consumed);
    }
}
