// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-request management operations.

use arrayvec::ArrayVec;
use zerocopy::FromBytes;

use drv_mgmt_api::{
    BootDevice, CopyFlags, IdentifyInfo, MgmtOp, ModuleSelect, PdiFlags,
    RequestRecord, INLINE_RESULT_MAX, WIRE_VERSION,
};
use fpt::{FptHeader, FptTable};
use sgcq::SgcqIo;

use crate::{MgmtClient, MgmtError, Timebase};

impl<const N: usize> MgmtClient<N> {
    /// Wire-version handshake. Fails unless the device speaks
    /// [`WIRE_VERSION`].
    pub fn identify(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        timeout_ms: u64,
    ) -> Result<IdentifyInfo, MgmtError> {
        let record = RequestRecord::new(MgmtOp::Identify, 0);
        let completion = self.transact(io, tb, record, timeout_ms)?.ok()?;
        let (info, _) = IdentifyInfo::read_from_prefix(&completion.result)
            .map_err(|_| MgmtError::MalformedResponse)?;
        if info.wire_version != WIRE_VERSION {
            return Err(MgmtError::WireMismatch {
                device: info.wire_version,
            });
        }
        Ok(info)
    }

    /// Reads `len` bytes of raw manufacturing metadata starting at
    /// `offset`. Field decoding is the caller's business.
    pub fn board_info(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        offset: u32,
        len: u32,
        timeout_ms: u64,
    ) -> Result<ArrayVec<u8, INLINE_RESULT_MAX>, MgmtError> {
        if len as usize > INLINE_RESULT_MAX {
            return Err(MgmtError::PayloadTooLarge);
        }
        let mut record = RequestRecord::new(MgmtOp::BoardInfo, 0);
        record.arg0 = offset;
        record.arg1 = len;
        let completion = self.transact(io, tb, record, timeout_ms)?.ok()?;
        Ok(completion.result)
    }

    /// Reads the FPT of `boot` (header first, then each entry) and returns
    /// the reassembled table bytes after validating magic, layout, and the
    /// sum-to-zero checksum.
    pub fn read_fpt_raw(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        boot: BootDevice,
        timeout_ms: u64,
    ) -> Result<ArrayVec<u8, { fpt::MAX_TABLE_SIZE }>, MgmtError> {
        let mut table = ArrayVec::new();

        let mut record = RequestRecord::new(MgmtOp::FptHeaderRead, 0);
        record.arg0 = u32::from(boot as u8);
        let completion = self.transact(io, tb, record, timeout_ms)?.ok()?;
        table
            .try_extend_from_slice(&completion.result)
            .map_err(|_| MgmtError::MalformedResponse)?;

        let (header, _) = FptHeader::read_from_prefix(&table)
            .map_err(|_| MgmtError::MalformedResponse)?;

        for i in 0..u32::from(header.num_entries) {
            let mut record = RequestRecord::new(MgmtOp::FptPartitionRead, 0);
            record.arg0 = u32::from(boot as u8);
            record.arg1 = i;
            let completion =
                self.transact(io, tb, record, timeout_ms)?.ok()?;
            table
                .try_extend_from_slice(&completion.result)
                .map_err(|_| MgmtError::MalformedResponse)?;
        }

        // Validates the checksum over header plus entries.
        FptTable::parse(&table)?;
        Ok(table)
    }

    /// Selects the partition to boot from on the next reset. Also clears a
    /// device-side aborted-stream latch for that boot device.
    pub fn select_partition(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        boot: BootDevice,
        partition: u8,
        timeout_ms: u64,
    ) -> Result<(), MgmtError> {
        let mut record = RequestRecord::new(MgmtOp::PartitionSelect, 0);
        record.flags = PdiFlags::new(boot, partition, 0, false).0;
        self.transact(io, tb, record, timeout_ms)?.ok()?;
        Ok(())
    }

    /// Copies one partition to another, both named by (device, partition).
    pub fn copy_partition(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        src: (BootDevice, u8),
        dest: (BootDevice, u8),
        timeout_ms: u64,
    ) -> Result<(), MgmtError> {
        if src == dest {
            return Err(MgmtError::CopyToSelf);
        }
        let mut record = RequestRecord::new(MgmtOp::PartitionCopy, 0);
        record.flags = CopyFlags::new(src.0, src.1, dest.0, dest.1).0;
        self.transact(io, tb, record, timeout_ms)?.ok()?;
        Ok(())
    }

    /// Reads `len` bytes from an optical module register page.
    pub fn module_read(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        cage: u8,
        page: u8,
        offset: u8,
        len: u8,
        timeout_ms: u64,
    ) -> Result<ArrayVec<u8, INLINE_RESULT_MAX>, MgmtError> {
        if usize::from(len) > INLINE_RESULT_MAX {
            return Err(MgmtError::PayloadTooLarge);
        }
        let mut record = RequestRecord::new(MgmtOp::ModuleRead, 0);
        record.arg0 = ModuleSelect::new(cage, page, offset, len).0;
        let completion = self.transact(io, tb, record, timeout_ms)?.ok()?;
        Ok(completion.result)
    }

    /// Writes bytes to an optical module register page. The data rides in
    /// the bulk region.
    pub fn module_write(
        &mut self,
        io: &mut impl SgcqIo,
        tb: &mut impl Timebase,
        cage: u8,
        page: u8,
        offset: u8,
        data: &[u8],
        timeout_ms: u64,
    ) -> Result<(), MgmtError> {
        let len =
            u8::try_from(data.len()).map_err(|_| MgmtError::PayloadTooLarge)?;
        let (addr, payload_len) = self.stage_payload(io, data)?;

        let mut record = RequestRecord::new(MgmtOp::ModuleWrite, 0);
        record.arg0 = ModuleSelect::new(cage, page, offset, len).0;
        record.payload_addr = addr;
        record.payload_len = payload_len;
        self.transact(io, tb, record, timeout_ms)?.ok()?;
        Ok(())
    }
}
