// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash Partition Table (FPT) parsing.
//!
//! The FPT is the on-device directory of programmable flash partitions: a
//! small header followed by fixed-size entries, each naming a partition
//! type, base address, and size. It travels from device to host as an
//! inline response payload and is validated before any programming decision
//! is derived from it.
//!
//! There is no explicit checksum field; the table is valid when the byte
//! sum over header plus entries is zero modulo 256. If firmware ever grows
//! an explicit checksum field, [`FPT_VERSION`] must be bumped.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Sentinel identifying a valid table.
pub const FPT_MAGIC: u32 = 0x4650_5421;

/// Table layout revision this parser understands.
pub const FPT_VERSION: u8 = 1;

/// Most partitions any boot device carries.
pub const MAX_PARTITIONS: usize = 15;

/// Largest wire size of a table this parser accepts.
pub const MAX_TABLE_SIZE: usize =
    core::mem::size_of::<FptHeader>()
        + MAX_PARTITIONS * core::mem::size_of::<FptEntry>();

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FptHeader {
    pub magic: u32,
    pub version: u8,
    /// Bytes from the start of the table to the first entry.
    pub header_size: u8,
    /// Bytes per entry; at least `size_of::<FptEntry>()`.
    pub entry_size: u8,
    pub num_entries: u8,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FptEntry {
    pub partition_type: u32,
    pub base_addr: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FptError {
    /// Fewer bytes than the header claims the table occupies.
    Truncated,
    BadMagic,
    UnsupportedVersion,
    /// header_size or entry_size too small to hold the declared layouts.
    BadLayout,
    /// Byte sum over header plus entries is nonzero modulo 256.
    BadChecksum,
}

/// A validated table borrowed from its wire bytes.
#[derive(Copy, Clone, Debug)]
pub struct FptTable<'a> {
    header: FptHeader,
    /// The full table slice: header plus `num_entries` entries.
    raw: &'a [u8],
}

impl<'a> FptTable<'a> {
    /// Parses and validates a table from wire bytes. Trailing bytes beyond
    /// the declared table length are ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FptError> {
        let (header, _) = FptHeader::read_from_prefix(bytes)
            .map_err(|_| FptError::Truncated)?;

        if header.magic != FPT_MAGIC {
            return Err(FptError::BadMagic);
        }
        if header.version != FPT_VERSION {
            return Err(FptError::UnsupportedVersion);
        }
        if usize::from(header.header_size)
            < core::mem::size_of::<FptHeader>()
            || usize::from(header.entry_size)
                < core::mem::size_of::<FptEntry>()
        {
            return Err(FptError::BadLayout);
        }

        let table_len = usize::from(header.header_size)
            + usize::from(header.num_entries) * usize::from(header.entry_size);
        let raw = bytes.get(..table_len).ok_or(FptError::Truncated)?;

        let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(FptError::BadChecksum);
        }

        Ok(Self { header, raw })
    }

    pub fn header(&self) -> &FptHeader {
        &self.header
    }

    pub fn num_entries(&self) -> usize {
        usize::from(self.header.num_entries)
    }

    /// Returns entry `index` (0 is the first partition), or `None` past the
    /// end.
    pub fn entry(&self, index: usize) -> Option<FptEntry> {
        if index >= self.num_entries() {
            return None;
        }
        let off = usize::from(self.header.header_size)
            + index * usize::from(self.header.entry_size);
        // In-bounds by the length check in `parse`.
        FptEntry::read_from_prefix(&self.raw[off..])
            .ok()
            .map(|(entry, _)| entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = FptEntry> + '_ {
        (0..self.num_entries()).filter_map(|i| self.entry(i))
    }

    /// The wire bytes of the validated table.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

/// Computes the pad byte that makes `bytes` plus one trailing byte sum to
/// zero modulo 256. Table builders (device firmware, tests) fold this into
/// a reserved field of the last entry.
pub fn checksum_pad(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)))
}
