// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format of the card-management protocol carried over the sGCQ.
//!
//! Requests occupy one SQ slot and responses one CQ slot, as fixed
//! little-endian word layouts that host driver and device firmware must
//! agree on bit-exactly. The numeric values of opcodes, statuses, and flag
//! encodings in this crate are pinned by unit tests: **they cannot be
//! renumbered** without breaking the peer.
//!
//! Payloads that do not fit in a slot (PDI chunks, module write data)
//! travel through a bulk data region in the shared window; the request
//! carries the region-relative address and length.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Sentinel in the first word of every request record.
pub const REQUEST_MAGIC: u32 = 0x5245_5131;

/// Sentinel in the first word of every response record.
pub const RESPONSE_MAGIC: u32 = 0x5253_5031;

/// SQ slot size both peers are built for.
pub const SQ_SLOT_SIZE: u32 = 64;

/// CQ slot size both peers are built for.
pub const CQ_SLOT_SIZE: u32 = 64;

/// PDI images are streamed in chunks of this many bytes; a multiple of the
/// erase/program granularity of the target flash.
pub const PDI_CHUNK_SIZE: usize = 6144;

/// Largest chunk number the 15-bit field can carry.
pub const PDI_MAX_CHUNK: u16 = 0x7fff;

/// Partition byte meaning "this stream replaces the Flash Partition Table"
/// rather than a numbered partition.
pub const FPT_UPDATE_PARTITION: u8 = 0xaa;

/// Inline result bytes a response can carry after its header.
pub const INLINE_RESULT_MAX: usize =
    CQ_SLOT_SIZE as usize - core::mem::size_of::<ResponseHeader>();

const_assert!(
    core::mem::size_of::<RequestRecord>() <= SQ_SLOT_SIZE as usize
);
const_assert!(
    core::mem::size_of::<ResponseHeader>() <= CQ_SLOT_SIZE as usize
);

/// Management opcodes. Values are wire ABI; append, never renumber.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum MgmtOp {
    /// Wire-version handshake; the response carries [`IdentifyInfo`].
    Identify = 1,
    /// Read manufacturing metadata bytes (raw; decoding is the caller's
    /// business).
    BoardInfo = 2,
    /// Read the FPT header of a boot device.
    FptHeaderRead = 3,
    /// Read one FPT entry of a boot device.
    FptPartitionRead = 4,
    /// One chunk of a PDI stream (or of an FPT update, by sentinel).
    PdiDownload = 5,
    /// Select the partition to boot from on next reset.
    PartitionSelect = 6,
    /// Copy one partition to another.
    PartitionCopy = 7,
    /// Read bytes from an optical module register page.
    ModuleRead = 8,
    /// Write bytes to an optical module register page.
    ModuleWrite = 9,
}

impl MgmtOp {
    pub fn from_wire(v: u16) -> Option<Self> {
        Self::from_u16(v)
    }
}

/// Completion status. Values are wire ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum CmdStatus {
    Success = 0,
    /// The device does not implement the request's opcode.
    UnsupportedOpcode = 1,
    /// The request failed validation (bad magic, bounds, ordering).
    MalformedRequest = 2,
    /// The handler's underlying subsystem failed; see the sub-code.
    DeviceFailure = 3,
    /// A prior chunk of this stream failed; restart from chunk 0.
    StreamAborted = 4,
    /// A structural check failed: FPT checksum, image magic, or the like.
    IntegrityFailure = 5,
}

impl CmdStatus {
    pub fn from_wire(v: u16) -> Option<Self> {
        Self::from_u16(v)
    }
}

/// Detail accompanying [`CmdStatus::DeviceFailure`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum SubCode {
    None = 0,
    FlashErase = 1,
    FlashProgram = 2,
    FlashRead = 3,
    ModuleIo = 4,
    /// The board EEPROM did not answer with the expected device id.
    EepromId = 5,
    /// A partition index or byte range fell outside the FPT.
    Bounds = 6,
}

/// One of the two non-volatile boot stores on the board.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum BootDevice {
    Primary = 0,
    Secondary = 1,
}

/// Request record, one per SQ slot.
///
/// `op` sits in the low half of its word and `req_id` in the high half.
/// `arg0..arg2` are opcode-specific; unused arguments are zero.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RequestRecord {
    pub magic: u32,
    pub op: u16,
    pub req_id: u16,
    pub flags: u32,
    /// Bulk-region offset of the payload, when one is carried.
    pub payload_addr: u32,
    pub payload_len: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
}

impl RequestRecord {
    pub fn new(op: MgmtOp, req_id: u16) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            op: op as u16,
            req_id,
            flags: 0,
            payload_addr: 0,
            payload_len: 0,
            arg0: 0,
            arg1: 0,
            arg2: 0,
        }
    }
}

/// Response record header, one per CQ slot, followed by `result_len` inline
/// result bytes (at most [`INLINE_RESULT_MAX`]).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct ResponseHeader {
    pub magic: u32,
    pub req_id: u16,
    pub status: u16,
    pub sub_code: u32,
    pub result_len: u32,
}

impl ResponseHeader {
    pub fn new(req_id: u16, status: CmdStatus) -> Self {
        Self {
            magic: RESPONSE_MAGIC,
            req_id,
            status: status as u16,
            sub_code: SubCode::None as u32,
            result_len: 0,
        }
    }
}

/// Inline payload of an [`MgmtOp::Identify`] response.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct IdentifyInfo {
    /// Must equal [`WIRE_VERSION`]; anything else is a peer mismatch.
    pub wire_version: u32,
    /// Firmware build number, informational.
    pub fw_build: u32,
}

/// Wire version carried in [`IdentifyInfo`].
pub const WIRE_VERSION: u32 = 1;

/// The PDI streaming flags word:
///
/// ```text
/// 0xAABBCCCC
///   AA        boot device
///     BB      partition (0xAA when the stream updates the FPT)
///       CCCC  chunk number, 15 bits, MSB set on the last chunk
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PdiFlags(pub u32);

impl PdiFlags {
    pub fn new(
        boot: BootDevice,
        partition: u8,
        chunk: u16,
        last: bool,
    ) -> Self {
        debug_assert!(chunk <= PDI_MAX_CHUNK);
        let chunk_word = if last {
            u32::from(chunk) | 1 << 15
        } else {
            u32::from(chunk) & !(1 << 15)
        };
        Self(
            u32::from(boot as u8) << 24
                | u32::from(partition) << 16
                | chunk_word,
        )
    }

    pub fn boot_device(self) -> Option<BootDevice> {
        BootDevice::from_u8((self.0 >> 24) as u8)
    }

    pub fn partition(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn chunk(self) -> u16 {
        (self.0 as u16) & PDI_MAX_CHUNK
    }

    pub fn is_last(self) -> bool {
        self.0 & 1 << 15 != 0
    }

    pub fn is_fpt_update(self) -> bool {
        self.partition() == FPT_UPDATE_PARTITION
    }
}

/// The partition-copy flags word: four 8-bit fields,
/// `(src_device << 24) | (src_partition << 16) | (dest_device << 8) |
/// dest_partition`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CopyFlags(pub u32);

impl CopyFlags {
    pub fn new(
        src_device: BootDevice,
        src_partition: u8,
        dest_device: BootDevice,
        dest_partition: u8,
    ) -> Self {
        Self(
            u32::from(src_device as u8) << 24
                | u32::from(src_partition) << 16
                | u32::from(dest_device as u8) << 8
                | u32::from(dest_partition),
        )
    }

    pub fn src_device(self) -> Option<BootDevice> {
        BootDevice::from_u8((self.0 >> 24) as u8)
    }

    pub fn src_partition(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn dest_device(self) -> Option<BootDevice> {
        BootDevice::from_u8((self.0 >> 8) as u8)
    }

    pub fn dest_partition(self) -> u8 {
        self.0 as u8
    }
}

/// Optical module register addressing packed into one argument word:
/// `(cage << 24) | (page << 16) | (offset << 8) | len`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModuleSelect(pub u32);

impl ModuleSelect {
    pub fn new(cage: u8, page: u8, offset: u8, len: u8) -> Self {
        Self(
            u32::from(cage) << 24
                | u32::from(page) << 16
                | u32::from(offset) << 8
                | u32::from(len),
        )
    }

    pub fn cage(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn page(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn offset(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn len(self) -> u8 {
        self.0 as u8
    }
}
