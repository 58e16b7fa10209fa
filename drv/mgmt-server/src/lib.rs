// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side command dispatcher.
//!
//! The dispatcher is the consumer on an sGCQ instance. Each call to
//! [`Dispatcher::poll`] is one cooperative tick: peek the SQ, decode and
//! validate the record, invoke the local handler, and post a completion.
//! It is single-threaded per queue; a handler that takes milliseconds
//! simply leaves further SQ entries queued.
//!
//! The local subsystems a request lands on (flash programming, optical
//! module register access, board EEPROM) are external collaborators behind
//! the [`ImageStore`], [`ModuleIo`], and [`BoardInfo`] traits.
//!
//! PDI streams are tracked across ticks: chunks must arrive in order, and a
//! chunk that fails mid-stream latches the (boot device, partition) stream
//! into an aborted state in which subsequent chunks are rejected with
//! `StreamAborted`. The latch clears when the producer restarts from chunk
//! 0 or issues a partition select.

#![cfg_attr(not(test), no_std)]

mod dispatch;

pub use dispatch::{DispatchStats, Dispatcher, Event};

use drv_mgmt_api::{BootDevice, SubCode};

/// The non-volatile image store: the flash programmer and its partition
/// table. Erase/program sequencing, geometry, and wear concerns all live
/// behind this seam.
pub trait ImageStore {
    /// Raw FPT bytes for a boot device (header plus entries, possibly with
    /// trailing padding).
    fn fpt(&mut self, boot: BootDevice) -> Result<&[u8], SubCode>;

    /// Erase-then-program `data` at byte `offset` within `partition`.
    fn program_chunk(
        &mut self,
        boot: BootDevice,
        partition: u8,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SubCode>;

    /// Program `data` at byte `offset` within the FPT region itself, as
    /// part of a table-replacement stream.
    fn update_fpt_chunk(
        &mut self,
        boot: BootDevice,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SubCode>;

    /// Selects the partition to boot from on the next reset.
    fn select_partition(
        &mut self,
        boot: BootDevice,
        partition: u8,
    ) -> Result<(), SubCode>;

    /// Copies a partition, both ends named by (boot device, partition).
    fn copy_partition(
        &mut self,
        src: (BootDevice, u8),
        dest: (BootDevice, u8),
    ) -> Result<(), SubCode>;
}

/// Optical module register access (cage, page, byte offset).
pub trait ModuleIo {
    fn read(
        &mut self,
        cage: u8,
        page: u8,
        offset: u8,
        out: &mut [u8],
    ) -> Result<(), SubCode>;

    fn write(
        &mut self,
        cage: u8,
        page: u8,
        offset: u8,
        data: &[u8],
    ) -> Result<(), SubCode>;
}

/// Raw manufacturing metadata (board EEPROM contents). Field decoding is
/// the host's business; the device only serves bytes.
pub trait BoardInfo {
    /// Copies bytes starting at `offset` into `out`, returning how many
    /// were available. An EEPROM that fails its device-id check must
    /// return `Err(SubCode::EepromId)`, not pretend to be present.
    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<usize, SubCode>;
}
