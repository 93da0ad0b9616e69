use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use palacios_devices::pci::COMMAND_IO_ENABLE;
use palacios_devices_storage::ata::AtaDrive;
use palacios_devices_storage::atapi::{AtapiCdrom, IsoBackend};
use palacios_devices_storage::pci_ide::{
    register_piix3_ide_ports, Piix3IdePciDevice, PRIMARY_PORTS, SECONDARY_PORTS,
};
use palacios_platform::io::IoPortBus;
use palacios_storage::{MemBackend, RawDisk, VirtualDisk, SECTOR_SIZE};
use pretty_assertions::assert_eq;

const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DRDY: u8 = 1 << 6;
const STATUS_BSY: u8 = 1 << 7;

struct Rig {
    ide: Rc<RefCell<Piix3IdePciDevice>>,
    io: IoPortBus,
}

impl Rig {
    fn with_primary_disk(disk: RawDisk<MemBackend>) -> Self {
        let ide = Rc::new(RefCell::new(Piix3IdePciDevice::new()));
        ide.borrow_mut()
            .controller
            .attach_primary_master_ata(AtaDrive::new(Box::new(disk)).unwrap());
        ide.borrow_mut().config_mut().set_command(COMMAND_IO_ENABLE);

        let mut io = IoPortBus::new();
        register_piix3_ide_ports(&mut io, ide.clone());
        Self { ide, io }
    }

    fn out8(&mut self, port: u16, value: u8) {
        self.io.write(port, 1, u32::from(value));
    }

    fn in8(&mut self, port: u16) -> u8 {
        self.io.read(port, 1) as u8
    }

    fn in16(&mut self, port: u16) -> u16 {
        self.io.read(port, 2) as u16
    }

    fn read_data(&mut self, bytes: usize) -> Vec<u8> {
        let mut out = vec![0u8; bytes];
        for i in 0..bytes / 2 {
            let w = self.in16(PRIMARY_PORTS.cmd_base);
            out[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn write_data(&mut self, data: &[u8]) {
        for pair in data.chunks(2) {
            let w = u16::from_le_bytes([pair[0], pair[1]]);
            self.io.write(PRIMARY_PORTS.cmd_base, 2, u32::from(w));
        }
    }

    fn irq_pending(&self) -> bool {
        self.ide.borrow().controller.primary_irq_pending()
    }
}

fn patterned_disk(sectors: u64) -> RawDisk<MemBackend> {
    let mut disk = RawDisk::create(MemBackend::new(), sectors * SECTOR_SIZE as u64).unwrap();
    let data: Vec<u8> = (0..sectors * SECTOR_SIZE as u64)
        .map(|i| ((i / SECTOR_SIZE as u64) as u8) ^ (i as u8))
        .collect();
    disk.write_sectors(0, &data).unwrap();
    disk
}

fn sector_pattern(sectors: u64, lba: u64) -> Vec<u8> {
    assert!(lba < sectors, "test pattern requested beyond the disk");
    (0..SECTOR_SIZE as u64)
        .map(|i| (lba as u8) ^ ((lba * SECTOR_SIZE as u64 + i) as u8))
        .collect()
}

#[test]
fn identify_reports_geometry_and_feature_words() {
    // 64 cylinders of the default 16-head, 63-sector translation.
    let total_sectors = 64u64 * 16 * 63;
    let rig_disk = RawDisk::create(MemBackend::new(), total_sectors * SECTOR_SIZE as u64).unwrap();
    let mut rig = Rig::with_primary_disk(rig_disk);

    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xA0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0xEC);

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_eq!(status & (STATUS_BSY | STATUS_DRQ | STATUS_ERR), STATUS_DRQ);

    let raw = rig.read_data(512);
    let word = |i: usize| u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);

    assert_eq!(word(0) & 0x8000, 0, "fixed ATA device");
    assert_eq!(word(1), 64);
    assert_eq!(word(3), 16);
    assert_eq!(word(6), 63);
    assert_ne!(word(49) & (1 << 9), 0, "LBA supported");
    assert_eq!(word(47) & 0xFF, 255, "max multiple sector count");
    assert_eq!(
        u32::from(word(60)) | u32::from(word(61)) << 16,
        total_sectors as u32
    );
    assert_ne!(word(83) & (1 << 10), 0, "LBA48 supported");
    assert_eq!(word(88), 0x2020, "UDMA5 supported and selected");
    assert_eq!(
        u64::from(word(100))
            | u64::from(word(101)) << 16
            | u64::from(word(102)) << 32
            | u64::from(word(103)) << 48,
        total_sectors
    );

    // The model string is ASCII packed big-endian per word.
    let model: Vec<u8> = (27..47).flat_map(|i| word(i).to_be_bytes()).collect();
    assert!(model.starts_with(b"PALACIOS HARDDISK"));

    // Transfer complete: DRQ cleared, no interrupt pacing for IDENTIFY data.
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 7) & STATUS_DRQ, 0);
}

#[test]
fn read_sectors_lba28_paces_interrupts_per_sector() {
    let mut rig = Rig::with_primary_disk(patterned_disk(8));

    // READ SECTORS, LBA 0, two sectors.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 2);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x20);

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_eq!(status & STATUS_BSY, 0);
    assert_ne!(status & STATUS_DRQ, 0);

    let first = rig.read_data(512);
    assert_eq!(first, sector_pattern(8, 0));
    assert!(rig.irq_pending(), "IRQ after the first sector");

    // Reading the status register acknowledges the interrupt.
    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert!(!rig.irq_pending());
    assert_ne!(status & STATUS_DRQ, 0, "second sector still pending");

    let second = rig.read_data(512);
    assert_eq!(second, sector_pattern(8, 1));
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 7) & STATUS_DRQ, 0);
}

#[test]
fn write_then_read_round_trips_through_pio() {
    let mut rig = Rig::with_primary_disk(patterned_disk(8));
    let payload: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| (i * 31 % 255) as u8).collect();

    // WRITE SECTORS at LBA 3, two sectors.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 2);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 3);
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x30);

    assert_ne!(rig.in8(PRIMARY_PORTS.cmd_base + 7) & STATUS_DRQ, 0);
    rig.write_data(&payload);
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 7) & STATUS_DRQ, 0);
    assert!(rig.irq_pending());

    // Read it back.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 2);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 3);
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x20);

    assert_eq!(rig.read_data(2 * SECTOR_SIZE), payload);
}

#[test]
fn read_multiple_paces_interrupts_per_cluster() {
    let mut rig = Rig::with_primary_disk(patterned_disk(16));

    // SET MULTIPLE MODE to 4 sectors per interrupt.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 4);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0xC6);
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 7) & STATUS_ERR, 0);

    // READ MULTIPLE of 8 sectors from LBA 0.
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 8);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0xC4);
    let _ = rig.in8(PRIMARY_PORTS.cmd_base + 7); // ack the command interrupt

    // Three sectors in: no cluster boundary yet.
    let _ = rig.read_data(3 * SECTOR_SIZE);
    assert!(!rig.irq_pending());

    // Fourth sector completes the cluster.
    let _ = rig.read_data(SECTOR_SIZE);
    assert!(rig.irq_pending());
}

#[test]
fn set_multiple_of_zero_aborts() {
    let mut rig = Rig::with_primary_disk(patterned_disk(4));

    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0xC6);

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_ne!(status & STATUS_ERR, 0);
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 1), 0x04, "abort in the error register");
}

#[test]
fn lba48_two_step_latches_address_high_sectors() {
    let mut rig = Rig::with_primary_disk(patterned_disk(300));

    // LBA48 mode: the mode bits are 0x40 (LBA set, both legacy bits clear).
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0x40);

    // Sector count 2: high byte then low byte.
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 2);

    // LBA 0x000000000102 = 258: per-register high-then-low writes.
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 0); // LBA[31:24]
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 0x02); // LBA[7:0]
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0); // LBA[39:32]
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0x01); // LBA[15:8]
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0); // LBA[47:40]
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0); // LBA[23:16]

    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x24); // READ SECTORS EXT

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_eq!(status & (STATUS_BSY | STATUS_ERR), 0);
    assert_ne!(status & STATUS_DRQ, 0);

    assert_eq!(rig.read_data(SECTOR_SIZE), sector_pattern(300, 258));
    assert_eq!(rig.read_data(SECTOR_SIZE), sector_pattern(300, 259));
}

#[test]
fn chs_addressing_translates_through_drive_geometry() {
    // Geometry: 16 heads, 63 sectors/track.
    let mut rig = Rig::with_primary_disk(patterned_disk(2 * 16 * 63));

    // C=1, H=2, S=5 => LBA (1*16 + 2) * 63 + 4 = 1138.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xA2); // CHS mode, head 2
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 1);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 5); // sector number (1-based)
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 1); // cylinder low
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0); // cylinder high
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x20);

    assert_eq!(rig.read_data(SECTOR_SIZE), sector_pattern(2 * 16 * 63, 1138));
}

#[test]
fn out_of_range_request_aborts_with_error() {
    let mut rig = Rig::with_primary_disk(patterned_disk(4));

    // LBA 3 + 2 sectors runs past a 4-sector disk.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xE0);
    rig.out8(PRIMARY_PORTS.cmd_base + 2, 2);
    rig.out8(PRIMARY_PORTS.cmd_base + 3, 3);
    rig.out8(PRIMARY_PORTS.cmd_base + 4, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 5, 0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x20);

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_ne!(status & STATUS_ERR, 0);
    assert_eq!(status & STATUS_DRQ, 0);
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 1), 0x04);
    assert!(rig.irq_pending());
}

#[test]
fn selecting_an_empty_slot_sets_abort_and_commands_fail() {
    let mut rig = Rig::with_primary_disk(patterned_disk(4));

    // Slave slot is empty.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xB0);
    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_eq!(status, 0, "empty slot reads zero status");

    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0x20);
    // The abort completion is visible once a drive is selected again.
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xA0);
    assert_eq!(rig.in8(PRIMARY_PORTS.cmd_base + 1) & 0x04, 0x04);
}

#[test]
fn unknown_command_aborts() {
    let mut rig = Rig::with_primary_disk(patterned_disk(4));
    rig.out8(PRIMARY_PORTS.cmd_base + 6, 0xA0);
    rig.out8(PRIMARY_PORTS.cmd_base + 7, 0xF8); // not implemented

    let status = rig.in8(PRIMARY_PORTS.cmd_base + 7);
    assert_ne!(status & STATUS_ERR, 0);
    assert_ne!(status & STATUS_DRDY, 0);
}

#[test]
fn soft_reset_loads_drive_signatures() {
    let disk = patterned_disk(4);
    let ide = Rc::new(RefCell::new(Piix3IdePciDevice::new()));
    ide.borrow_mut()
        .controller
        .attach_primary_master_ata(AtaDrive::new(Box::new(disk)).unwrap());
    ide.borrow_mut()
        .controller
        .attach_secondary_master_atapi(AtapiCdrom::new(None));
    ide.borrow_mut().config_mut().set_command(COMMAND_IO_ENABLE);

    let mut io = IoPortBus::new();
    register_piix3_ide_ports(&mut io, ide.clone());

    for (cmd_base, ctrl_base) in [
        (PRIMARY_PORTS.cmd_base, PRIMARY_PORTS.ctrl_base),
        (SECONDARY_PORTS.cmd_base, SECONDARY_PORTS.ctrl_base),
    ] {
        io.write(cmd_base + 6, 1, 0xA0);

        // Assert SRST: busy + seek complete.
        io.write(ctrl_base, 1, 0x04);
        assert_eq!(io.read(cmd_base + 7, 1) as u8 & (STATUS_BSY | 0x10), STATUS_BSY | 0x10);

        // Release SRST: ready, signature loaded.
        io.write(ctrl_base, 1, 0x00);
        let status = io.read(cmd_base + 7, 1) as u8;
        assert_eq!(status & STATUS_BSY, 0);
        assert_ne!(status & STATUS_DRDY, 0);
        assert_eq!(io.read(cmd_base + 2, 1) as u8, 1);
        assert_eq!(io.read(cmd_base + 3, 1) as u8, 1);
    }

    // Disk signature: zero cylinder pair. CD-ROM signature: 0xEB14.
    assert_eq!(io.read(PRIMARY_PORTS.cmd_base + 4, 1), 0);
    assert_eq!(io.read(PRIMARY_PORTS.cmd_base + 5, 1), 0);
    assert_eq!(io.read(SECONDARY_PORTS.cmd_base + 4, 1) as u8, 0x14);
    assert_eq!(io.read(SECONDARY_PORTS.cmd_base + 5, 1) as u8, 0xEB);
}

/* ATAPI error paths */

struct EmptyIso;

impl IsoBackend for EmptyIso {
    fn sector_count(&self) -> u32 {
        0
    }

    fn read_sectors(&mut self, _lba: u32, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no data"))
    }
}

fn cdrom_rig(media: Option<Box<dyn IsoBackend>>) -> (Rc<RefCell<Piix3IdePciDevice>>, IoPortBus) {
    let ide = Rc::new(RefCell::new(Piix3IdePciDevice::new()));
    ide.borrow_mut()
        .controller
        .attach_secondary_master_atapi(AtapiCdrom::new(media));
    ide.borrow_mut().config_mut().set_command(COMMAND_IO_ENABLE);

    let mut io = IoPortBus::new();
    register_piix3_ide_ports(&mut io, ide.clone());
    (ide, io)
}

fn send_packet(io: &mut IoPortBus, pkt: &[u8; 12]) {
    io.write(SECONDARY_PORTS.cmd_base + 6, 1, 0xA0);
    io.write(SECONDARY_PORTS.cmd_base + 7, 1, 0xA0);
    for i in 0..6 {
        let w = u16::from_le_bytes([pkt[i * 2], pkt[i * 2 + 1]]);
        io.write(SECONDARY_PORTS.cmd_base, 2, u32::from(w));
    }
}

fn request_sense(io: &mut IoPortBus) -> (u8, u8) {
    let mut pkt = [0u8; 12];
    pkt[0] = 0x03;
    pkt[4] = 18;
    send_packet(io, &pkt);

    let mut sense = [0u8; 18];
    for i in 0..9 {
        let w = io.read(SECONDARY_PORTS.cmd_base, 2) as u16;
        sense[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }
    (sense[2] & 0xF, sense[12])
}

#[test]
fn test_unit_ready_without_media_latches_not_ready_sense() {
    let (ide, mut io) = cdrom_rig(None);

    send_packet(&mut io, &[0u8; 12]);

    let status = io.read(SECONDARY_PORTS.cmd_base + 7, 1) as u8;
    assert_ne!(status & STATUS_ERR, 0);
    // Sense key in the error register's high nibble.
    assert_eq!(io.read(SECONDARY_PORTS.cmd_base + 1, 1) as u8 >> 4, 0x02);
    assert!(ide.borrow().controller.secondary_irq_pending());

    let (key, asc) = request_sense(&mut io);
    assert_eq!((key, asc), (0x02, 0x3A), "NOT READY / MEDIUM NOT PRESENT");
}

#[test]
fn atapi_read_beyond_capacity_latches_illegal_request_sense() {
    struct TinyIso;
    impl IsoBackend for TinyIso {
        fn sector_count(&self) -> u32 {
            4
        }
        fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> io::Result<()> {
            if lba >= 4 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "OOB"));
            }
            buf.fill(lba as u8);
            Ok(())
        }
    }

    let (_ide, mut io) = cdrom_rig(Some(Box::new(TinyIso)));

    let mut read10 = [0u8; 12];
    read10[0] = 0x28;
    read10[2..6].copy_from_slice(&3u32.to_be_bytes());
    read10[7..9].copy_from_slice(&2u16.to_be_bytes());
    send_packet(&mut io, &read10);

    let status = io.read(SECONDARY_PORTS.cmd_base + 7, 1) as u8;
    assert_ne!(status & STATUS_ERR, 0);

    let (key, asc) = request_sense(&mut io);
    assert_eq!((key, asc), (0x05, 0x21), "ILLEGAL REQUEST / LBA OUT OF RANGE");
}

#[test]
fn unknown_packet_opcode_latches_invalid_field_sense() {
    let (_ide, mut io) = cdrom_rig(Some(Box::new(EmptyIso)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0xBE; // READ CD, unimplemented
    send_packet(&mut io, &pkt);

    let (key, asc) = request_sense(&mut io);
    assert_eq!((key, asc), (0x05, 0x24), "ILLEGAL REQUEST / INVALID FIELD IN CDB");
}

#[test]
fn read_capacity_reports_last_block_and_block_size() {
    struct FixedIso(u32);
    impl IsoBackend for FixedIso {
        fn sector_count(&self) -> u32 {
            self.0
        }
        fn read_sectors(&mut self, _lba: u32, buf: &mut [u8]) -> io::Result<()> {
            buf.fill(0);
            Ok(())
        }
    }

    let (_ide, mut io) = cdrom_rig(Some(Box::new(FixedIso(1234))));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x25;
    send_packet(&mut io, &pkt);

    let mut resp = [0u8; 8];
    for i in 0..4 {
        let w = io.read(SECONDARY_PORTS.cmd_base, 2) as u16;
        resp[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }
    assert_eq!(u32::from_be_bytes(resp[0..4].try_into().unwrap()), 1233);
    assert_eq!(u32::from_be_bytes(resp[4..8].try_into().unwrap()), 2048);
}

#[test]
fn read_toc_stub_reports_data_track_and_lead_out() {
    struct FixedIso(u32);
    impl IsoBackend for FixedIso {
        fn sector_count(&self) -> u32 {
            self.0
        }
        fn read_sectors(&mut self, _lba: u32, buf: &mut [u8]) -> io::Result<()> {
            buf.fill(0);
            Ok(())
        }
    }

    let (_ide, mut io) = cdrom_rig(Some(Box::new(FixedIso(500))));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x43;
    pkt[7..9].copy_from_slice(&20u16.to_be_bytes());
    send_packet(&mut io, &pkt);

    let mut toc = [0u8; 20];
    for i in 0..10 {
        let w = io.read(SECONDARY_PORTS.cmd_base, 2) as u16;
        toc[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }

    assert_eq!(u16::from_be_bytes([toc[0], toc[1]]), 18);
    assert_eq!(toc[2], 1, "first track");
    assert_eq!(toc[3], 1, "last track");
    assert_eq!(toc[6], 1, "data track number");
    assert_eq!(toc[14], 0xAA, "lead-out track number");
    assert_eq!(u32::from_be_bytes(toc[16..20].try_into().unwrap()), 500);
}

#[test]
fn atapi_read10_two_blocks_reports_full_byte_count() {
    struct FillIso;
    impl IsoBackend for FillIso {
        fn sector_count(&self) -> u32 {
            16
        }
        fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> io::Result<()> {
            for (i, chunk) in buf.chunks_mut(2048).enumerate() {
                chunk.fill((lba + i as u32) as u8);
            }
            Ok(())
        }
    }

    let (ide, mut io) = cdrom_rig(Some(Box::new(FillIso)));

    // READ(10): LBA 10, two blocks.
    let mut read10 = [0u8; 12];
    read10[0] = 0x28;
    read10[2..6].copy_from_slice(&10u32.to_be_bytes());
    read10[7..9].copy_from_slice(&2u16.to_be_bytes());
    send_packet(&mut io, &read10);

    // Byte-count pair reports both blocks.
    let lo = io.read(SECONDARY_PORTS.cmd_base + 4, 1);
    let hi = io.read(SECONDARY_PORTS.cmd_base + 5, 1);
    assert_eq!(hi << 8 | lo, 4096);
    assert!(ide.borrow().controller.secondary_irq_pending());

    let mut out = vec![0u8; 4096];
    for i in 0..2048 {
        let w = io.read(SECONDARY_PORTS.cmd_base, 2) as u16;
        out[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }

    assert!(out[..2048].iter().all(|b| *b == 10));
    assert!(out[2048..].iter().all(|b| *b == 11));

    // Completion: data request cleared, status-phase interrupt reason.
    let status = io.read(SECONDARY_PORTS.cmd_base + 7, 1) as u8;
    assert_eq!(status & STATUS_DRQ, 0);
    assert_eq!(io.read(SECONDARY_PORTS.cmd_base + 2, 1) as u8, 0x03);
}
