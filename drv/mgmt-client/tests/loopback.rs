// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client and dispatcher wired back to back over one fake shared window.
//!
//! The window is interior-mutable so both peers can hold their own access
//! handle, and the client's [`Timebase`] pumps the device side on every
//! yield, one cooperative tick per poll, the way the two real loops
//! interleave.

use std::cell::{Cell, RefCell};

use drv_mgmt_api::{
    BootDevice, CmdStatus, CQ_SLOT_SIZE, PDI_CHUNK_SIZE, SQ_SLOT_SIZE,
    SubCode, WIRE_VERSION,
};
use drv_mgmt_client::{MgmtClient, MgmtError, Timebase};
use drv_mgmt_server::{BoardInfo, Dispatcher, ImageStore, ModuleIo};
use sgcq::{
    attach_consumer, create_producer, InterruptMode, SgcqConfig,
    SgcqFeatures, SgcqIo,
};

const RING_BASE: u64 = 0;
const BULK_BASE: u64 = 1024;
const BULK_LEN: u32 = 8192;
const FW_BUILD: u32 = 77;
const TIMEOUT_MS: u64 = 1000;
const DEPTH: usize = 8;

struct Window {
    regs: [Cell<u32>; 8],
    mem: Vec<Cell<u8>>,
}

impl Window {
    fn new() -> Self {
        Self {
            regs: Default::default(),
            mem: vec![Cell::new(0); BULK_BASE as usize + BULK_LEN as usize],
        }
    }
}

/// One peer's handle onto the shared window.
struct Io<'a>(&'a Window);

impl SgcqIo for Io<'_> {
    fn reg_read32(&self, addr: u64) -> u32 {
        self.0.regs[(addr / 4) as usize].get()
    }
    fn reg_write32(&mut self, addr: u64, value: u32) {
        self.0.regs[(addr / 4) as usize].set(value);
    }
    fn mem_read32(&self, addr: u64) -> u32 {
        let i = addr as usize;
        u32::from_le_bytes([
            self.0.mem[i].get(),
            self.0.mem[i + 1].get(),
            self.0.mem[i + 2].get(),
            self.0.mem[i + 3].get(),
        ])
    }
    fn mem_write32(&mut self, addr: u64, value: u32) {
        let i = addr as usize;
        for (cell, byte) in
            self.0.mem[i..i + 4].iter().zip(value.to_le_bytes())
        {
            cell.set(byte);
        }
    }
}

fn test_fpt() -> Vec<u8> {
    let header = fpt::FptHeader {
        magic: fpt::FPT_MAGIC,
        version: fpt::FPT_VERSION,
        header_size: 8,
        entry_size: 12,
        num_entries: 2,
    };
    let entries = [
        fpt::FptEntry {
            partition_type: 0x0e,
            base_addr: 0x0001_0000,
            size: 0x0040_0000,
        },
        fpt::FptEntry {
            partition_type: 0x0d,
            base_addr: 0x0041_0000,
            size: 0x2000,
        },
    ];
    let mut bytes = zerocopy::IntoBytes::as_bytes(&header).to_vec();
    for e in &entries {
        bytes.extend_from_slice(zerocopy::IntoBytes::as_bytes(e));
    }
    let pad = fpt::checksum_pad(&bytes);
    let last = bytes.len() - 1;
    bytes[last] = bytes[last].wrapping_add(pad);
    bytes
}

#[derive(Default)]
struct FlashStore {
    fpt: Vec<u8>,
    programmed: Vec<(u8, u32, Vec<u8>)>,
    fpt_updates: Vec<(u32, Vec<u8>)>,
    selected: Option<(BootDevice, u8)>,
    copies: Vec<((BootDevice, u8), (BootDevice, u8))>,
    fail_program_at: Option<u32>,
}

impl ImageStore for FlashStore {
    fn fpt(&mut self, _boot: BootDevice) -> Result<&[u8], SubCode> {
        Ok(&self.fpt)
    }
    fn program_chunk(
        &mut self,
        _boot: BootDevice,
        partition: u8,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SubCode> {
        if self.fail_program_at == Some(offset) {
            return Err(SubCode::FlashProgram);
        }
        self.programmed.push((partition, offset, data.to_vec()));
        Ok(())
    }
    fn update_fpt_chunk(
        &mut self,
        _boot: BootDevice,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SubCode> {
        self.fpt_updates.push((offset, data.to_vec()));
        Ok(())
    }
    fn select_partition(
        &mut self,
        boot: BootDevice,
        partition: u8,
    ) -> Result<(), SubCode> {
        self.selected = Some((boot, partition));
        Ok(())
    }
    fn copy_partition(
        &mut self,
        src: (BootDevice, u8),
        dest: (BootDevice, u8),
    ) -> Result<(), SubCode> {
        self.copies.push((src, dest));
        Ok(())
    }
}

struct Modules {
    page: [u8; 256],
}

impl ModuleIo for Modules {
    fn read(
        &mut self,
        _cage: u8,
        _page: u8,
        offset: u8,
        out: &mut [u8],
    ) -> Result<(), SubCode> {
        let off = usize::from(offset);
        out.copy_from_slice(&self.page[off..off + out.len()]);
        Ok(())
    }
    fn write(
        &mut self,
        _cage: u8,
        _page: u8,
        offset: u8,
        data: &[u8],
    ) -> Result<(), SubCode> {
        let off = usize::from(offset);
        self.page[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
}

struct Board {
    eeprom: &'static [u8],
}

impl BoardInfo for Board {
    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<usize, SubCode> {
        let off = offset as usize;
        let n = out.len().min(self.eeprom.len().saturating_sub(off));
        out[..n].copy_from_slice(&self.eeprom[off..off + n]);
        Ok(n)
    }
}

type TestDispatcher = Dispatcher<FlashStore, Modules, Board>;

/// The client's timebase: fake milliseconds, and (unless the device is
/// "hung") one dispatcher tick per yield.
struct Pump<'a> {
    win: &'a Window,
    disp: &'a RefCell<TestDispatcher>,
    now: u64,
    device_alive: bool,
}

impl Timebase for Pump<'_> {
    fn now_ms(&self) -> u64 {
        self.now
    }
    fn yield_now(&mut self) {
        self.now += 1;
        if self.device_alive {
            let _ = self.disp.borrow_mut().poll(&mut Io(self.win));
        }
    }
}

fn setup(win: &Window) -> (MgmtClient<DEPTH>, RefCell<TestDispatcher>) {
    let mut io = Io(win);
    let prod = create_producer(
        &mut io,
        RING_BASE,
        &SgcqConfig {
            num_slots: 4,
            sq_slot_size: SQ_SLOT_SIZE,
            cq_slot_size: CQ_SLOT_SIZE,
            flags: SgcqFeatures::IN_MEM_PTR,
            interrupt_mode: InterruptMode::None,
        },
    )
    .unwrap();
    let cons =
        attach_consumer(&mut io, RING_BASE, SQ_SLOT_SIZE, CQ_SLOT_SIZE)
            .unwrap();

    let client = MgmtClient::new(prod, BULK_BASE, BULK_LEN);
    let disp = RefCell::new(Dispatcher::new(
        cons,
        BULK_BASE,
        BULK_LEN,
        FW_BUILD,
        FlashStore {
            fpt: test_fpt(),
            ..FlashStore::default()
        },
        Modules {
            page: [0; 256],
        },
        Board {
            eeprom: b"MFG-SERIAL-00042",
        },
    ));
    (client, disp)
}

fn pump<'a>(win: &'a Window, disp: &'a RefCell<TestDispatcher>) -> Pump<'a> {
    Pump {
        win,
        disp,
        now: 0,
        device_alive: true,
    }
}

#[test]
fn identify_handshake() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let info = client
        .identify(&mut Io(&win), &mut tb, TIMEOUT_MS)
        .unwrap();
    assert_eq!(info.wire_version, WIRE_VERSION);
    assert_eq!(info.fw_build, FW_BUILD);
    assert_eq!(client.stats.submitted, 1);
    assert_eq!(client.stats.delivered, 1);
}

#[test]
fn board_info_round_trip() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let bytes = client
        .board_info(&mut Io(&win), &mut tb, 4, 6, TIMEOUT_MS)
        .unwrap();
    assert_eq!(&bytes[..], b"SERIAL");
}

#[test]
fn fpt_read_validates_checksum() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let raw = client
        .read_fpt_raw(&mut Io(&win), &mut tb, BootDevice::Primary, TIMEOUT_MS)
        .unwrap();
    let table = fpt::FptTable::parse(&raw).unwrap();
    assert_eq!(table.num_entries(), 2);
    assert_eq!(table.entry(0).unwrap().size, 0x0040_0000);

    // Corrupt the device-side table; the client must refuse it.
    disp.borrow_mut().store_mut().fpt[9] ^= 0x40;
    let err = client
        .read_fpt_raw(&mut Io(&win), &mut tb, BootDevice::Primary, TIMEOUT_MS)
        .unwrap_err();
    assert_eq!(err, MgmtError::Fpt(fpt::FptError::BadChecksum));
}

#[test]
fn pdi_three_chunk_stream() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let mut image = vec![0u8; PDI_CHUNK_SIZE * 2 + 100];
    for (i, b) in image.iter_mut().enumerate() {
        *b = i as u8;
    }

    let mut progress = Vec::new();
    client
        .download_pdi(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Primary,
            0,
            TIMEOUT_MS,
            |written, total| progress.push((written, total)),
        )
        .unwrap();

    assert_eq!(
        progress,
        vec![(6144, 12388), (12288, 12388), (12388, 12388)]
    );

    let disp = disp.borrow();
    let programmed = &disp.store().programmed;
    assert_eq!(programmed.len(), 3);
    // The device saw byte-identical chunk contents, in order.
    assert_eq!(programmed[0].2, image[..PDI_CHUNK_SIZE]);
    assert_eq!(programmed[1].2, image[PDI_CHUNK_SIZE..2 * PDI_CHUNK_SIZE]);
    assert_eq!(programmed[2].2, image[2 * PDI_CHUNK_SIZE..]);
    assert_eq!(programmed[2].1, 2 * PDI_CHUNK_SIZE as u32);
}

#[test]
fn pdi_rejects_missing_partition() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let image = vec![0u8; 100];
    let err = client
        .download_pdi(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Primary,
            7,
            TIMEOUT_MS,
            |_, _| {},
        )
        .unwrap_err();
    assert_eq!(err, MgmtError::PartitionMissing);
}

#[test]
fn pdi_rejects_oversized_image() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    // Partition 1 holds 0x2000 bytes.
    let image = vec![0u8; 0x2001];
    let err = client
        .download_pdi(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Primary,
            1,
            TIMEOUT_MS,
            |_, _| {},
        )
        .unwrap_err();
    assert_eq!(err, MgmtError::ImageTooLarge);
}

#[test]
fn pdi_chunk_failure_names_the_chunk() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    disp.borrow_mut().store_mut().fail_program_at =
        Some(PDI_CHUNK_SIZE as u32);
    let mut tb = pump(&win, &disp);

    let image = vec![0u8; PDI_CHUNK_SIZE * 2 + 100];
    let mut progress = Vec::new();
    let err = client
        .download_pdi(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Primary,
            0,
            TIMEOUT_MS,
            |written, total| progress.push((written, total)),
        )
        .unwrap_err();
    assert_eq!(
        err,
        MgmtError::ChunkFailed {
            chunk: 1,
            status: CmdStatus::DeviceFailure,
        }
    );
    // Only chunk 0 was acknowledged.
    assert_eq!(progress, vec![(6144, 12388)]);

    // The device latched the abort; a retry of the stream from scratch
    // succeeds once the fault is gone.
    disp.borrow_mut().store_mut().fail_program_at = None;
    client
        .download_pdi(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Primary,
            0,
            TIMEOUT_MS,
            |_, _| {},
        )
        .unwrap();
}

#[test]
fn fpt_update_stream() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    let image = vec![0x42u8; PDI_CHUNK_SIZE + 32];
    client
        .update_fpt(
            &mut Io(&win),
            &mut tb,
            &image,
            BootDevice::Secondary,
            TIMEOUT_MS,
            |_, _| {},
        )
        .unwrap();

    let disp = disp.borrow();
    let updates = &disp.store().fpt_updates;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].0, 0);
    assert_eq!(updates[1].0, PDI_CHUNK_SIZE as u32);
    assert_eq!(updates[1].1, vec![0x42u8; 32]);
}

#[test]
fn partition_select_and_copy() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    client
        .select_partition(
            &mut Io(&win),
            &mut tb,
            BootDevice::Primary,
            1,
            TIMEOUT_MS,
        )
        .unwrap();
    assert_eq!(
        disp.borrow().store().selected,
        Some((BootDevice::Primary, 1))
    );

    client
        .copy_partition(
            &mut Io(&win),
            &mut tb,
            (BootDevice::Primary, 0),
            (BootDevice::Secondary, 1),
            TIMEOUT_MS,
        )
        .unwrap();
    assert_eq!(
        disp.borrow().store().copies,
        vec![((BootDevice::Primary, 0), (BootDevice::Secondary, 1))]
    );

    let err = client
        .copy_partition(
            &mut Io(&win),
            &mut tb,
            (BootDevice::Primary, 0),
            (BootDevice::Primary, 0),
            TIMEOUT_MS,
        )
        .unwrap_err();
    assert_eq!(err, MgmtError::CopyToSelf);
}

#[test]
fn module_write_read_back() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);
    let mut tb = pump(&win, &disp);

    client
        .module_write(
            &mut Io(&win),
            &mut tb,
            2,
            0,
            0x10,
            b"\xde\xad\xbe\xef\x99",
            TIMEOUT_MS,
        )
        .unwrap();
    let bytes = client
        .module_read(&mut Io(&win), &mut tb, 2, 0, 0x10, 5, TIMEOUT_MS)
        .unwrap();
    assert_eq!(&bytes[..], b"\xde\xad\xbe\xef\x99");
}

#[test]
fn timeout_abandons_then_drops_late_response() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);

    // The device is hung: nothing drains the SQ.
    let mut tb = Pump {
        win: &win,
        disp: &disp,
        now: 0,
        device_alive: false,
    };
    let err = client
        .identify(&mut Io(&win), &mut tb, 10)
        .unwrap_err();
    assert_eq!(err, MgmtError::Timeout);
    assert_eq!(client.stats.timeouts, 1);

    // The device comes back and completes the old request late. The
    // response must be dropped, not delivered.
    assert!(disp.borrow_mut().poll(&mut Io(&win)).unwrap());
    assert_eq!(client.poll_completions(&mut Io(&win)), 0);
    assert_eq!(client.stats.late_dropped, 1);
    assert_eq!(client.stats.delivered, 0);

    // And the session is healthy for the next request.
    let mut tb = pump(&win, &disp);
    client.identify(&mut Io(&win), &mut tb, TIMEOUT_MS).unwrap();
}

#[test]
fn every_response_reaches_exactly_one_waiter() {
    let win = Window::new();
    let (mut client, disp) = setup(&win);

    // Fill the ring with requests before letting the device run.
    let mut ids = Vec::new();
    for _ in 0..4 {
        let record = drv_mgmt_api::RequestRecord::new(
            drv_mgmt_api::MgmtOp::Identify,
            0,
        );
        ids.push(client.submit(&mut Io(&win), record).unwrap());
    }
    // Ring is full now.
    let record =
        drv_mgmt_api::RequestRecord::new(drv_mgmt_api::MgmtOp::Identify, 0);
    assert_eq!(
        client.submit(&mut Io(&win), record).unwrap_err(),
        MgmtError::Transport(sgcq::SgcqError::NoFreeSlot)
    );

    while disp.borrow_mut().poll(&mut Io(&win)).unwrap() {}
    assert_eq!(client.poll_completions(&mut Io(&win)), 4);

    // Ids are distinct, and each completion can be taken exactly once.
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 4);
    for id in ids {
        assert!(client.completion(id).is_some());
        assert!(client.completion(id).is_none());
    }
}
