// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PDI (programmable device image) header parsing.
//!
//! A PDI is an opaque multi-megabyte boot blob; the device-side flash
//! programmer is the only thing that interprets its contents. The host only
//! needs to walk the front matter far enough to pull out the first image
//! header's parent unique id, which callers compare against the running
//! design before agreeing to program the image.
//!
//! Front matter, in file order:
//!
//! - an optional 16-byte SMAP bus-width detection preamble, recognized by
//!   its first word;
//! - a boot header, recognized by the width-detection word at offset 0x10.
//!   When present, it names the image header table's byte offset; when
//!   absent, the table sits right after the SMAP preamble (or at offset
//!   zero);
//! - the image header table: version, image/partition counts, and the word
//!   offset of the first image header;
//! - image headers, each carrying a `parent_unique_id`.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// First-word patterns of the SMAP bus-width detection preamble.
pub const SMAP_WORDS: [u32; 3] = [0xDD00_0000, 0x00DD_0000, 0x0000_00DD];

/// Length of the SMAP preamble.
pub const SMAP_LEN: usize = 16;

/// Value of the boot header's width-detection word. Anything else at that
/// offset means the image carries no boot header.
pub const WIDTH_DETECTION_WORD: u32 = 0xAA99_5566;

/// Image header table revisions this parser accepts.
pub const IHT_VERSIONS: [u32; 4] =
    [0x0103_0000, 0x0002_0000, 0x0003_0000, 0x0004_0000];

// Boot header field offsets, relative to the start of the file. Only the
// fields the host needs are read; the header is close to 4 KiB overall.
const BOOT_HDR_WIDTH_WORD: usize = 0x10;
const BOOT_HDR_IMAGE_HDR_BYTE_OFFSET: usize = 0xc4;

/// Image header table, 32 words.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ImageHeaderTable {
    pub version: u32,
    pub image_total_count: u32,
    pub first_image_header_word_offset: u32,
    pub partition_total_count: u32,
    pub first_partition_header_word_offset: u32,
    pub secondary_boot_device_address: u32,
    pub id_code: u32,
    pub attributes: u32,
    pub pdi_id: u32,
    pub parent_id: u32,
    pub identification_string: u32,
    pub header_sizes: u32,
    pub total_meta_hdr_length: u32,
    pub meta_hdr_secure_hdr_iv: [u32; 3],
    pub meta_hdr_key_source: u32,
    pub extended_id_code: u32,
    pub header_auth_certificate_word_offset: u32,
    pub meta_hdr_grey_or_black_iv: [u32; 3],
    pub optional_data_size: u32,
    pub reserved: [u32; 8],
    pub checksum: u32,
}

/// One image header, 16 words.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ImageHeader {
    pub partition_header_word_offset: u32,
    pub data_section_count: u32,
    pub meta_hdr_revoke_id: u32,
    pub image_attributes: u32,
    pub image_name: [u8; 16],
    pub image_id: u32,
    pub unique_id: u32,
    pub parent_unique_id: u32,
    pub function_id: u32,
    pub memcpy_address_lo: u32,
    pub memcpy_address_hi: u32,
    pub pcr: u32,
    pub ih_checksum: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PdiError {
    /// The file ends before the structure being read.
    Truncated,
    /// The image header table version is not one of [`IHT_VERSIONS`].
    UnsupportedVersion,
    /// Partition count outside 1..255.
    InvalidPartitionCount,
    /// The metadata headers are encrypted; the image headers cannot be
    /// read in the clear.
    EncryptedMetadata,
}

/// What the host learns from the front matter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PdiInfo {
    pub version: u32,
    pub image_count: u32,
    pub partition_count: u32,
    pub parent_unique_id: u32,
}

impl PdiInfo {
    /// The parent unique id in the form compatibility checks use: a
    /// 15-hex-digit lowercase string.
    pub fn parent_uuid(&self) -> ParentUuid {
        ParentUuid(self.parent_unique_id)
    }

    /// Compares the parent unique id against a running design's UUID
    /// string (15 hex digits, either case).
    pub fn matches_uuid(&self, uuid: &str) -> bool {
        uuid.len() == 15
            && u64::from_str_radix(uuid, 16).ok()
                == Some(u64::from(self.parent_unique_id))
    }
}

/// Displays as the canonical 15-hex-digit zero-padded UUID.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParentUuid(pub u32);

impl core::fmt::Display for ParentUuid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:015x}", self.0)
    }
}

fn word_at(bytes: &[u8], offset: usize) -> Result<u32, PdiError> {
    let b = bytes
        .get(offset..offset + 4)
        .ok_or(PdiError::Truncated)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parses the front matter of a PDI.
pub fn parse(bytes: &[u8]) -> Result<PdiInfo, PdiError> {
    let smap_present = SMAP_WORDS.contains(&word_at(bytes, 0)?);

    // A real boot header announces itself with the width-detection word;
    // anything else means the table starts at the top of the file, past the
    // SMAP preamble if there is one.
    let iht_offset = if word_at(bytes, BOOT_HDR_WIDTH_WORD)?
        == WIDTH_DETECTION_WORD
    {
        word_at(bytes, BOOT_HDR_IMAGE_HDR_BYTE_OFFSET)? as usize
    } else if smap_present {
        SMAP_LEN
    } else {
        0
    };

    let rest = bytes.get(iht_offset..).ok_or(PdiError::Truncated)?;
    let (table, _) = ImageHeaderTable::read_from_prefix(rest)
        .map_err(|_| PdiError::Truncated)?;

    if !IHT_VERSIONS.contains(&table.version) {
        return Err(PdiError::UnsupportedVersion);
    }
    if table.partition_total_count == 0 || table.partition_total_count >= 0xff
    {
        return Err(PdiError::InvalidPartitionCount);
    }
    if table.meta_hdr_key_source != 0 {
        return Err(PdiError::EncryptedMetadata);
    }

    let ih_offset = table.first_image_header_word_offset as usize * 4;
    let rest = bytes.get(ih_offset..).ok_or(PdiError::Truncated)?;
    let (image, _) = ImageHeader::read_from_prefix(rest)
        .map_err(|_| PdiError::Truncated)?;

    Ok(PdiInfo {
        version: table.version,
        image_count: table.image_total_count,
        partition_count: table.partition_total_count,
        parent_unique_id: image.parent_unique_id,
    })
}
