//! ATAPI CD-ROM drive and the 12-byte packet engine.

use std::io;

use tracing::{debug, warn};

use crate::ata::{put_ata_string, words_to_bytes};
use crate::ide::{DriveKind, DriveState, IdeChannel};
use crate::regs::{Status, ATAPI_REASON_CD, ATAPI_REASON_IO};

/// Every ATAPI command packet is exactly twelve bytes.
pub const ATAPI_PACKET_SIZE: usize = 12;

/// CD-ROM data blocks are 2 KiB.
pub const ATAPI_BLOCK_SIZE: usize = 2048;

/* Sense keys and additional sense codes. */
pub const SENSE_NONE: u8 = 0x0;
pub const SENSE_NOT_READY: u8 = 0x2;
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x5;
pub const SENSE_UNIT_ATTENTION: u8 = 0x6;

pub const ASC_LOGICAL_BLOCK_OOR: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/* Packet opcodes. */
const CMD_TEST_UNIT_READY: u8 = 0x00;
const CMD_REQUEST_SENSE: u8 = 0x03;
const CMD_INQUIRY: u8 = 0x12;
const CMD_READ_CAPACITY: u8 = 0x25;
const CMD_READ_10: u8 = 0x28;
const CMD_READ_TOC: u8 = 0x43;
const CMD_GET_CONFIGURATION: u8 = 0x46;
const CMD_GET_EVENT_STATUS: u8 = 0x4A;
const CMD_MODE_SENSE_10: u8 = 0x5A;
const CMD_MECHANISM_STATUS: u8 = 0xBD;

/// Media behind an ATAPI drive, addressed in 2 KiB blocks.
pub trait IsoBackend {
    fn sector_count(&self) -> u32;

    /// Reads whole blocks starting at `lba`; `buf` is a multiple of 2 KiB.
    fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> io::Result<()>;
}

/// Latched sense state, returned verbatim by REQUEST SENSE.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// A CD-ROM drive in an IDE slot. `media` of `None` models an empty tray.
pub struct AtapiCdrom {
    media: Option<Box<dyn IsoBackend>>,
    model: [u8; 40],
    pub(crate) sense: SenseData,
    pub(crate) atapi_cmd: u8,
}

impl AtapiCdrom {
    pub fn new(media: Option<Box<dyn IsoBackend>>) -> Self {
        let mut drive = Self {
            media,
            model: [b' '; 40],
            sense: SenseData::default(),
            atapi_cmd: 0,
        };
        drive.set_model("PALACIOS CD-ROM");
        drive
    }

    pub fn set_model(&mut self, model: &str) {
        self.model = [b' '; 40];
        for (dst, src) in self.model.iter_mut().zip(model.bytes()) {
            *dst = src;
        }
    }

    pub fn media_present(&self) -> bool {
        self.media.is_some()
    }

    pub fn capacity_blocks(&self) -> u32 {
        self.media.as_ref().map_or(0, |m| m.sector_count())
    }

    /// The in-flight packet moves data toward the host.
    pub(crate) fn command_is_data_in(&self) -> bool {
        self.atapi_cmd == CMD_READ_10
    }

    /// Reads one 2 KiB block into the front of `buf`.
    pub(crate) fn read_block(&mut self, lba: u32, buf: &mut [u8]) -> io::Result<()> {
        let media = self.media.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no medium present")
        })?;
        media.read_sectors(lba, &mut buf[..ATAPI_BLOCK_SIZE]).map_err(|err| {
            warn!(lba, %err, "CD block read failed");
            err
        })
    }

    /// The 512-byte IDENTIFY PACKET DEVICE block.
    pub(crate) fn identify_block(&self) -> [u8; 512] {
        let mut words = [0u16; 256];

        // Removable ATAPI device, CD-ROM class, 12-byte packets.
        words[0] = 0x85C0;

        put_ata_string(&mut words[10..20], b" VT00001");
        put_ata_string(&mut words[23..27], b"ALPHA1  ");
        put_ata_string(&mut words[27..47], &self.model);

        words[48] = 0x0001; // 32-bit PIO
        words[49] = 0x0300; // LBA + DMA capable
        words[53] = 0x0003; // words 54-58 and 64-70 valid
        words[63] = 0x0103;
        words[64] = 0x0001;
        words[65] = 0x00B4;
        words[66] = 0x00B4;
        words[67] = 0x012C;
        words[68] = 0x00B4;
        words[71] = 30;
        words[72] = 30;
        words[80] = 0x001E; // ATA/ATAPI-4

        words_to_bytes(&words)
    }
}

fn be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/* Packet engine, driven from the channel's data-port writes. */

impl IdeChannel {
    pub(crate) fn write_packet_data(&mut self, data: &[u8]) {
        let complete = {
            let drive = self.selected_mut();
            let index = drive.transfer_index as usize;
            let end = (index + data.len()).min(ATAPI_PACKET_SIZE);
            if index < end {
                drive.data_buf[index..end].copy_from_slice(&data[..end - index]);
            }
            drive.transfer_index += data.len() as u64;
            drive.transfer_index >= drive.transfer_length
        };

        if complete {
            self.handle_packet();
        }
    }

    fn handle_packet(&mut self) {
        let sel = self.selected_index();
        let mut packet = [0u8; ATAPI_PACKET_SIZE];
        packet.copy_from_slice(&self.drives[sel].data_buf[..ATAPI_PACKET_SIZE]);
        let opcode = packet[0];

        {
            let DriveKind::Atapi(cd) = &mut self.drives[sel].kind else {
                self.abort_command();
                return;
            };
            cd.atapi_cmd = opcode;
        }

        debug!(opcode = format_args!("{opcode:#x}"), "ATAPI packet");

        match opcode {
            CMD_TEST_UNIT_READY => {
                if self.atapi_media_present(sel) {
                    self.atapi_cmd_nop();
                } else {
                    self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
                }
            }

            CMD_REQUEST_SENSE => self.atapi_request_sense(sel),

            CMD_READ_10 => self.atapi_read10(sel, &packet),

            CMD_READ_CAPACITY => {
                if !self.atapi_media_present(sel) {
                    self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
                    return;
                }
                let capacity = self.atapi_capacity(sel);
                let drive = &mut self.drives[sel];
                drive.data_buf[0..4].copy_from_slice(&capacity.saturating_sub(1).to_be_bytes());
                drive.data_buf[4..8].copy_from_slice(&(ATAPI_BLOCK_SIZE as u32).to_be_bytes());
                self.atapi_start_data_in(8);
            }

            CMD_READ_TOC => {
                if !self.atapi_media_present(sel) {
                    self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
                    return;
                }
                let lead_out = self.atapi_capacity(sel);
                let alloc = usize::from(be16(&packet[7..9]));
                let drive = &mut self.drives[sel];

                // Two descriptors: the data track and the lead-out.
                let toc = &mut drive.data_buf[..20];
                toc.fill(0);
                toc[0..2].copy_from_slice(&18u16.to_be_bytes());
                toc[2] = 1; // first track
                toc[3] = 1; // last track
                toc[5] = 0x14; // data track, ADR current position
                toc[6] = 1;
                toc[8..12].copy_from_slice(&0u32.to_be_bytes());
                toc[13] = 0x16;
                toc[14] = 0xAA; // lead-out
                toc[16..20].copy_from_slice(&lead_out.to_be_bytes());

                self.atapi_start_data_in(20.min(alloc.max(4)));
            }

            CMD_GET_CONFIGURATION => {
                let alloc = usize::from(be16(&packet[7..9]));
                let drive = &mut self.drives[sel];
                let resp = &mut drive.data_buf[..8];
                resp.fill(0);
                resp[0..4].copy_from_slice(&4u32.to_be_bytes());
                resp[6..8].copy_from_slice(&0x0008u16.to_be_bytes()); // CD-ROM profile
                self.atapi_start_data_in(8.min(alloc.max(4)));
            }

            CMD_GET_EVENT_STATUS => {
                let alloc = usize::from(be16(&packet[7..9]));
                let drive = &mut self.drives[sel];
                let resp = &mut drive.data_buf[..8];
                resp.fill(0);
                resp[0..2].copy_from_slice(&6u16.to_be_bytes());
                resp[2] = 0x80; // no event available
                self.atapi_start_data_in(8.min(alloc.max(4)));
            }

            CMD_MECHANISM_STATUS => {
                let alloc = usize::from(be16(&packet[8..10]));
                let drive = &mut self.drives[sel];
                drive.data_buf[..8].fill(0);
                self.atapi_start_data_in(8.min(alloc.max(8)));
            }

            CMD_MODE_SENSE_10 => {
                let alloc = usize::from(be16(&packet[7..9]));
                let drive = &mut self.drives[sel];
                let resp = &mut drive.data_buf[..8];
                resp.fill(0);
                resp[0..2].copy_from_slice(&6u16.to_be_bytes());
                self.atapi_start_data_in(8.min(alloc.max(8)));
            }

            CMD_INQUIRY => {
                let alloc = usize::from(packet[4]);
                let drive = &mut self.drives[sel];
                let resp = &mut drive.data_buf[..36];
                resp.fill(0);
                resp[0] = 0x05; // CD-ROM device class
                resp[1] = 0x80; // removable
                resp[3] = 0x21; // ATAPI-2, response format 1
                resp[4] = 31; // additional length
                resp[8..16].copy_from_slice(b"V3VEE   ");
                resp[16..32].copy_from_slice(b"PALACIOS CD-ROM ");
                resp[32..36].copy_from_slice(b"1.0 ");
                self.atapi_start_data_in(36.min(alloc.max(5)));
            }

            other => {
                warn!(opcode = format_args!("{other:#x}"), "unhandled ATAPI command");
                self.atapi_cmd_error(SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
            }
        }
    }

    fn atapi_read10(&mut self, sel: usize, packet: &[u8; ATAPI_PACKET_SIZE]) {
        let lba = be32(&packet[2..6]);
        let blocks = u32::from(be16(&packet[7..9]));

        if !self.atapi_media_present(sel) {
            self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
            return;
        }
        if blocks == 0 {
            self.atapi_cmd_nop();
            return;
        }
        if u64::from(lba) + u64::from(blocks) > u64::from(self.atapi_capacity(sel)) {
            self.atapi_cmd_error(SENSE_ILLEGAL_REQUEST, ASC_LOGICAL_BLOCK_OOR);
            return;
        }

        let use_dma = self.features & 0x01 != 0;
        let length = u64::from(blocks) * ATAPI_BLOCK_SIZE as u64;

        if use_dma {
            // Armed; the bus-master walk pulls blocks straight from media.
            let drive = &mut self.drives[sel];
            drive.current_lba = u64::from(lba);
            drive.transfer_length = length;
            drive.transfer_index = 0;
            self.status.remove(Status::BSY | Status::DRQ | Status::ERR);
            return;
        }

        let read_failed = {
            let DriveState { kind, data_buf, current_lba, .. } = &mut self.drives[sel];
            *current_lba = u64::from(lba);
            match kind {
                DriveKind::Atapi(cd) => cd.read_block(lba, data_buf).is_err(),
                _ => true,
            }
        };
        if read_failed {
            self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
            return;
        }

        self.atapi_start_data_in(length as usize);
    }

    fn atapi_request_sense(&mut self, sel: usize) {
        let sense = match &self.drives[sel].kind {
            DriveKind::Atapi(cd) => cd.sense,
            _ => SenseData::default(),
        };

        let drive = &mut self.drives[sel];
        let resp = &mut drive.data_buf[..18];
        resp.fill(0);
        resp[0] = 0xF0; // current error, fixed format
        resp[2] = sense.key;
        resp[7] = 0x0A; // additional length
        resp[12] = sense.asc;
        resp[13] = sense.ascq;

        self.atapi_start_data_in(18);
    }

    /// Enters the data-in phase: byte counter, burst length in the
    /// byte-count register pair, interrupt-reason flags, DRQ, interrupt.
    fn atapi_start_data_in(&mut self, length: usize) {
        let drive = self.selected_mut();
        drive.transfer_length = length as u64;
        drive.transfer_index = 0;

        let burst = length.min(0xFFFE) as u32;
        drive.req_len = burst;
        drive.set_cylinder(burst as u16);
        drive.sector_count = ATAPI_REASON_IO;

        self.status.remove(Status::BSY | Status::ERR);
        self.status.insert(Status::DRQ);
        self.raise_irq();
    }

    /// Successful command with no data phase.
    fn atapi_cmd_nop(&mut self) {
        let drive = self.selected_mut();
        drive.sector_count = ATAPI_REASON_CD | ATAPI_REASON_IO;
        drive.transfer_length = 0;
        drive.transfer_index = 0;
        self.status.remove(Status::BSY | Status::DRQ | Status::ERR);
        self.status.insert(Status::DRDY);
        self.raise_irq();
    }

    /// Failed command: latch the sense pair, mirror the key into the error
    /// register, report the status phase, interrupt.
    pub(crate) fn atapi_cmd_error(&mut self, sense_key: u8, asc: u8) {
        let sel = self.selected_index();
        if let DriveKind::Atapi(cd) = &mut self.drives[sel].kind {
            cd.sense = SenseData { key: sense_key, asc, ascq: 0 };
        }
        let drive = &mut self.drives[sel];
        drive.sector_count = ATAPI_REASON_CD | ATAPI_REASON_IO;
        drive.transfer_length = 0;
        drive.transfer_index = 0;

        self.error = crate::regs::ErrorReg::from_bits_retain(sense_key << 4);
        self.status.remove(Status::BSY | Status::DWF | Status::DRQ);
        self.status.insert(Status::DRDY | Status::ERR);
        self.raise_irq();
    }

    fn atapi_media_present(&self, sel: usize) -> bool {
        matches!(&self.drives[sel].kind, DriveKind::Atapi(cd) if cd.media_present())
    }

    fn atapi_capacity(&self, sel: usize) -> u32 {
        match &self.drives[sel].kind {
            DriveKind::Atapi(cd) => cd.capacity_blocks(),
            _ => 0,
        }
    }

    /// Data-port reads during an ATAPI data-in phase.
    pub(crate) fn read_cd_data(&mut self, buf: &mut [u8]) {
        let sel = self.selected_index();

        let outcome = {
            let DriveState { kind, data_buf, current_lba, transfer_index, transfer_length, .. } =
                &mut self.drives[sel];

            if *transfer_index >= *transfer_length {
                warn!("data-port read past the end of the ATAPI transfer");
                buf.fill(0);
                PioReadOutcome::Overrun
            } else {
                let offset = (*transfer_index % ATAPI_BLOCK_SIZE as u64) as usize;

                // READ(10) streams blocks through the buffer; everything
                // else was materialized in full when the packet ran.
                let refill_failed = if offset == 0 && *transfer_index > 0 {
                    match kind {
                        DriveKind::Atapi(cd) if cd.command_is_data_in() => {
                            *current_lba += 1;
                            cd.read_block(*current_lba as u32, data_buf).is_err()
                        }
                        _ => false,
                    }
                } else {
                    false
                };

                if refill_failed {
                    buf.fill(0);
                    PioReadOutcome::IoError
                } else {
                    for (i, byte) in buf.iter_mut().enumerate() {
                        *byte = data_buf.get(offset + i).copied().unwrap_or(0);
                    }
                    *transfer_index += buf.len() as u64;
                    PioReadOutcome::Ok
                }
            }
        };

        match outcome {
            PioReadOutcome::Overrun => {}
            PioReadOutcome::IoError => {
                self.atapi_cmd_error(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
            }
            PioReadOutcome::Ok => self.finish_cd_increment(sel),
        }
    }

    /// Burst pacing for the data-in phase: an interrupt per byte-count
    /// burst and a final status-phase interrupt at the end.
    fn finish_cd_increment(&mut self, sel: usize) {
        let (index, length, burst) = {
            let drive = &self.drives[sel];
            (drive.transfer_index, drive.transfer_length, u64::from(drive.req_len))
        };

        if index >= length {
            let drive = &mut self.drives[sel];
            drive.req_len = 0;
            drive.sector_count = ATAPI_REASON_CD | ATAPI_REASON_IO;
            self.status.remove(Status::BSY | Status::DRQ);
            self.status.insert(Status::DRDY);
            self.raise_irq();
        } else if burst > 0 && index % burst == 0 {
            // Another burst follows: update the byte count the guest sizes
            // its next read loop from.
            let remaining = length - index;
            let next_burst = remaining.min(0xFFFE) as u32;
            let drive = &mut self.drives[sel];
            drive.req_len = next_burst;
            drive.set_cylinder(next_burst as u16);
            drive.sector_count = ATAPI_REASON_IO;
            self.status.remove(Status::BSY);
            self.status.insert(Status::DRQ);
            self.raise_irq();
        }
    }
}

/// Outcome of one ATAPI data-port read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PioReadOutcome {
    Ok,
    IoError,
    Overrun,
}
