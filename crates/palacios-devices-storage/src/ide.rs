//! Dual-channel IDE controller: register decode, PIO transfer engine, ATA
//! command dispatch, and the bus-master DMA walker.

use memory::MemoryBus;
use palacios_devices::irq::IrqLine;
use palacios_io_snapshot::io::state::{IoSnapshot, SnapshotError};
use palacios_storage::SECTOR_SIZE;
use tracing::{debug, warn};

use crate::ata::{self, AtaDrive};
use crate::atapi::{AtapiCdrom, ATAPI_BLOCK_SIZE, ATAPI_PACKET_SIZE};
use crate::regs::{
    BmCommand, BmStatus, DevControl, DriveHead, ErrorReg, Status, ATAPI_REASON_CD,
    ATAPI_REASON_IO,
};

/// Large enough for one disk sector or one CD-ROM block.
pub const DATA_BUFFER_SIZE: usize = 2048;

const PRD_ENTRY_SIZE: u64 = 8;
const PRD_EOT: u16 = 0x8000;

/// What occupies a drive slot.
pub(crate) enum DriveKind {
    None,
    Ata(AtaDrive),
    Atapi(AtapiCdrom),
}

impl DriveKind {
    fn is_none(&self) -> bool {
        matches!(self, DriveKind::None)
    }

    fn is_atapi(&self) -> bool {
        matches!(self, DriveKind::Atapi(_))
    }
}

/// One half of a two-step LBA48 register write: the first write latches the
/// high byte, the second supplies the low byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ByteLatch {
    #[default]
    Empty,
    High(u8),
}

impl ByteLatch {
    fn encode(self) -> u16 {
        match self {
            ByteLatch::Empty => 0,
            ByteLatch::High(v) => 0x0100 | u16::from(v),
        }
    }

    fn decode(raw: u16) -> Self {
        if raw & 0x0100 != 0 {
            ByteLatch::High(raw as u8)
        } else {
            ByteLatch::Empty
        }
    }
}

/// LBA48 address assembly: 16-bit sector count plus six LBA bytes, filled
/// through the two-step writes to the task-file registers.
#[derive(Debug, Default)]
pub(crate) struct Lba48State {
    count: u16,
    lba_bytes: [u8; 6],
    count_latch: ByteLatch,
    lba_latch: [ByteLatch; 3],
}

impl Lba48State {
    fn lba(&self) -> u64 {
        self.lba_bytes
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (i * 8)))
    }

    /// Sector count of 0 encodes the architectural maximum of 65536.
    fn sector_count(&self) -> u64 {
        if self.count == 0 {
            0x1_0000
        } else {
            u64::from(self.count)
        }
    }

    fn push_count(&mut self, value: u8) {
        match self.count_latch {
            ByteLatch::Empty => self.count_latch = ByteLatch::High(value),
            ByteLatch::High(high) => {
                self.count = u16::from(high) << 8 | u16::from(value);
                self.count_latch = ByteLatch::Empty;
            }
        }
    }

    /// `reg` 0..=2 maps the sector-number / cylinder-low / cylinder-high
    /// task-file registers onto LBA bytes (reg, reg+3).
    fn push_lba(&mut self, reg: usize, value: u8) {
        match self.lba_latch[reg] {
            ByteLatch::Empty => self.lba_latch[reg] = ByteLatch::High(value),
            ByteLatch::High(high) => {
                self.lba_bytes[reg + 3] = high;
                self.lba_bytes[reg] = value;
                self.lba_latch[reg] = ByteLatch::Empty;
            }
        }
    }

    fn reset_latches(&mut self) {
        self.count_latch = ByteLatch::Empty;
        self.lba_latch = [ByteLatch::Empty; 3];
    }
}

/// Per-slot task-file shadow registers and transfer bookkeeping.
pub(crate) struct DriveState {
    pub(crate) kind: DriveKind,

    /// Doubles as the ATAPI interrupt-reason register.
    pub(crate) sector_count: u8,
    pub(crate) sector_num: u8,
    pub(crate) cylinder_low: u8,
    pub(crate) cylinder_high: u8,
    pub(crate) lba48: Lba48State,

    pub(crate) data_buf: [u8; DATA_BUFFER_SIZE],
    pub(crate) transfer_index: u64,
    pub(crate) transfer_length: u64,
    pub(crate) current_lba: u64,
    /// ATAPI data-in burst size mirrored into the byte-count registers.
    pub(crate) req_len: u32,
}

impl DriveState {
    fn new() -> Self {
        Self {
            kind: DriveKind::None,
            sector_count: 0x01,
            sector_num: 0x01,
            cylinder_low: 0,
            cylinder_high: 0,
            lba48: Lba48State::default(),
            data_buf: [0; DATA_BUFFER_SIZE],
            transfer_index: 0,
            transfer_length: 0,
            current_lba: 0,
            req_len: 0,
        }
    }

    pub(crate) fn cylinder(&self) -> u16 {
        u16::from(self.cylinder_high) << 8 | u16::from(self.cylinder_low)
    }

    pub(crate) fn set_cylinder(&mut self, value: u16) {
        self.cylinder_low = value as u8;
        self.cylinder_high = (value >> 8) as u8;
    }

    /// Post-reset signature: CD-ROM drives report 0xEB14 in the cylinder
    /// pair, disks report zero.
    fn reset(&mut self) {
        self.sector_count = 0x01;
        self.sector_num = 0x01;
        if self.kind.is_atapi() {
            self.set_cylinder(0xEB14);
        } else {
            self.set_cylinder(0);
        }
        self.data_buf = [0; DATA_BUFFER_SIZE];
        self.transfer_index = 0;
    }
}

/// Bus-master engine registers of one channel.
#[derive(Debug, Default)]
pub(crate) struct BusMaster {
    pub(crate) cmd: BmCommand,
    pub(crate) status: BmStatus,
    pub(crate) prd_addr: u32,
    pub(crate) tbl_index: u32,
}

pub struct IdeChannel {
    pub(crate) drives: [DriveState; 2],

    pub(crate) error: ErrorReg,
    pub(crate) features: u8,
    pub(crate) drive_head: DriveHead,
    pub(crate) status: Status,
    pub(crate) cmd_reg: u8,
    pub(crate) ctrl: DevControl,
    pub(crate) dma: BusMaster,

    irq_line: Box<dyn IrqLine>,
    irq_level: bool,
}

/// Result of one PIO data-port access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PioOutcome {
    Ok,
    IoError,
    Overrun,
}

/// Task-file register selected by a port within a channel's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortReg {
    Data,
    Features,
    SectCount,
    SectNum,
    CylLow,
    CylHigh,
    DriveSel,
    Command,
    Control,
    AddrReg,
}

impl IdeChannel {
    fn new(irq_line: Box<dyn IrqLine>) -> Self {
        Self {
            drives: [DriveState::new(), DriveState::new()],
            error: ErrorReg::AMNF,
            features: 0,
            drive_head: DriveHead(0),
            status: Status::empty(),
            cmd_reg: 0,
            ctrl: DevControl::from_bits_retain(0x08),
            dma: BusMaster::default(),
            irq_line,
            irq_level: false,
        }
    }

    pub(crate) fn selected_index(&self) -> usize {
        self.drive_head.drive_sel()
    }

    pub(crate) fn selected(&self) -> &DriveState {
        &self.drives[self.selected_index()]
    }

    pub(crate) fn selected_mut(&mut self) -> &mut DriveState {
        &mut self.drives[self.drive_head.drive_sel()]
    }

    pub(crate) fn irq_pending(&self) -> bool {
        self.irq_level
    }

    pub(crate) fn raise_irq(&mut self) {
        if !self.ctrl.contains(DevControl::NIEN) {
            self.dma.status.insert(BmStatus::INT);
            self.irq_level = true;
            self.irq_line.raise();
        } else {
            debug!("channel interrupt suppressed by nIEN");
        }
    }

    fn lower_irq(&mut self) {
        self.irq_level = false;
        self.irq_line.lower();
    }

    /// Guest-visible command failure: error + ready, abort bit, interrupt.
    pub(crate) fn abort_command(&mut self) {
        self.status = Status::ERR | Status::DRDY;
        self.error = ErrorReg::ABRT;
        self.raise_irq();
    }

    /* Soft reset */

    fn reset_begin(&mut self) {
        self.status = Status::BSY | Status::DSC;
        self.error = ErrorReg::AMNF;
        self.cmd_reg = 0;
    }

    fn reset_complete(&mut self) {
        self.status.remove(Status::BSY);
        self.status.insert(Status::DRDY);
        self.drive_head = DriveHead(self.drive_head.0 & 0xF0);
        self.drives[0].reset();
        self.drives[1].reset();
    }

    /* Task-file registers */

    fn write_reg(&mut self, reg: PortReg, value: u8) {
        match reg {
            PortReg::Control => {
                let new = DevControl::from_bits_retain(value);
                if !self.ctrl.contains(DevControl::SRST) && new.contains(DevControl::SRST) {
                    self.reset_begin();
                } else if self.ctrl.contains(DevControl::SRST) && !new.contains(DevControl::SRST) {
                    self.reset_complete();
                }
                self.ctrl = new;
            }
            PortReg::Features => self.features = value,
            PortReg::SectCount => {
                let lba48 = self.drive_head.is_lba48();
                for drive in &mut self.drives {
                    drive.sector_count = value;
                    if lba48 {
                        drive.lba48.push_count(value);
                    }
                }
            }
            PortReg::SectNum => {
                let lba48 = self.drive_head.is_lba48();
                for drive in &mut self.drives {
                    drive.sector_num = value;
                    if lba48 {
                        drive.lba48.push_lba(0, value);
                    }
                }
            }
            PortReg::CylLow => {
                let lba48 = self.drive_head.is_lba48();
                for drive in &mut self.drives {
                    drive.cylinder_low = value;
                    if lba48 {
                        drive.lba48.push_lba(1, value);
                    }
                }
            }
            PortReg::CylHigh => {
                let lba48 = self.drive_head.is_lba48();
                for drive in &mut self.drives {
                    drive.cylinder_high = value;
                    if lba48 {
                        drive.lba48.push_lba(2, value);
                    }
                }
            }
            PortReg::DriveSel => {
                let new = DriveHead(value);
                if new.mode_bits() != self.drive_head.mode_bits() {
                    for drive in &mut self.drives {
                        drive.lba48.reset_latches();
                    }
                }
                self.drive_head = new;

                if self.selected().kind.is_none() {
                    debug!("guest selected an empty drive slot");
                    self.error.insert(ErrorReg::ABRT);
                    self.status.insert(Status::ERR);
                } else {
                    self.status = Status::DRDY | Status::DSC;
                    self.dma.status.remove(BmStatus::ACTIVE | BmStatus::ERR);
                }
            }
            PortReg::AddrReg => {}
            PortReg::Data | PortReg::Command => unreachable!("handled by the port decoder"),
        }
    }

    fn read_reg(&mut self, reg: PortReg) -> u8 {
        if reg == PortReg::AddrReg {
            return 0xFF;
        }

        if self.selected().kind.is_none() {
            // Empty slot: reserved drive-select bits only, everything else 0.
            return if reg == PortReg::DriveSel { 0xA0 } else { 0 };
        }

        match reg {
            PortReg::Features => self.error.bits(),
            PortReg::SectCount => self.selected().sector_count,
            PortReg::SectNum => self.selected().sector_num,
            PortReg::CylLow => self.selected().cylinder_low,
            PortReg::CylHigh => self.selected().cylinder_high,
            PortReg::DriveSel => self.drive_head.0,
            PortReg::Command => {
                // Reading the command-block status deasserts INTRQ.
                self.lower_irq();
                self.status.bits()
            }
            PortReg::Control => self.status.bits(),
            PortReg::Data | PortReg::AddrReg => unreachable!("handled by the port decoder"),
        }
    }

    /* Addressing */

    /// CHS / LBA28 / LBA48 address assembly plus the capacity range check.
    fn lba_and_count(&self) -> Option<(u64, u64)> {
        let drive = self.selected();
        let DriveKind::Ata(ata) = &drive.kind else {
            return None;
        };

        let (lba, count) = if self.drive_head.is_lba48() {
            (drive.lba48.lba(), drive.lba48.sector_count())
        } else {
            let count = if drive.sector_count == 0 {
                256
            } else {
                u64::from(drive.sector_count)
            };
            if self.drive_head.is_lba28() {
                let lba = u64::from(drive.sector_num)
                    | u64::from(drive.cylinder_low) << 8
                    | u64::from(drive.cylinder_high) << 16
                    | u64::from(self.drive_head.head_num()) << 24;
                (lba, count)
            } else {
                // CHS; the sector number is 1-based.
                let (_, heads, sectors) = ata.geometry();
                let lba = (u64::from(drive.cylinder()) * u64::from(heads)
                    + u64::from(self.drive_head.head_num()))
                    * u64::from(sectors)
                    + u64::from(drive.sector_num).saturating_sub(1);
                (lba, count)
            }
        };

        if lba + count > ata.sector_count() {
            warn!(lba, count, capacity = ata.sector_count(), "request beyond disk capacity");
            return None;
        }
        Some((lba, count))
    }

    /* ATA PIO commands */

    fn ata_read_sectors(&mut self) {
        let Some((lba, count)) = self.lba_and_count() else {
            self.abort_command();
            return;
        };

        let sel = self.selected_index();
        let DriveState { kind, data_buf, current_lba, transfer_index, transfer_length, .. } =
            &mut self.drives[sel];
        let DriveKind::Ata(ata) = kind else {
            self.abort_command();
            return;
        };

        *current_lba = lba;
        if ata.read(lba, 1, data_buf).is_err() {
            self.abort_command();
            return;
        }
        *transfer_length = count * SECTOR_SIZE as u64;
        *transfer_index = 0;

        self.status.remove(Status::BSY | Status::DRDY | Status::DWF | Status::ERR);
        self.status.insert(Status::DRQ);
        self.raise_irq();
    }

    fn ata_write_sectors(&mut self) {
        let Some((lba, count)) = self.lba_and_count() else {
            self.abort_command();
            return;
        };

        let drive = self.selected_mut();
        drive.current_lba = lba;
        drive.transfer_length = count * SECTOR_SIZE as u64;
        drive.transfer_index = 0;

        self.status.remove(Status::BSY | Status::DRDY | Status::DWF | Status::ERR);
        self.status.insert(Status::DRQ);
    }

    /// Arms a DMA transfer; the bus-master start bit kicks it off.
    fn ata_setup_dma(&mut self) {
        let Some((lba, count)) = self.lba_and_count() else {
            self.abort_command();
            return;
        };
        let drive = self.selected_mut();
        drive.current_lba = lba;
        drive.transfer_length = count * SECTOR_SIZE as u64;
        drive.transfer_index = 0;
    }

    /* Command dispatch */

    fn write_command(&mut self, value: u8) {
        self.cmd_reg = value;

        if self.selected().kind.is_none() {
            debug!(command = format_args!("{value:#x}"), "command issued to empty slot");
            self.abort_command();
            return;
        }

        match value {
            ata::ATA_PIDENTIFY => {
                let sel = self.selected_index();
                let DriveState { kind, data_buf, transfer_index, transfer_length, .. } =
                    &mut self.drives[sel];
                if let DriveKind::Atapi(cd) = kind {
                    data_buf[..512].copy_from_slice(&cd.identify_block());
                    *transfer_length = 512;
                    *transfer_index = 0;
                    self.error = ErrorReg::empty();
                    self.status = Status::DRDY | Status::DRQ | Status::DSC;
                    self.raise_irq();
                } else {
                    self.selected_mut().reset();
                    self.abort_command();
                }
            }

            ata::ATA_IDENTIFY => {
                let sel = self.selected_index();
                let DriveState { kind, data_buf, transfer_index, transfer_length, .. } =
                    &mut self.drives[sel];
                if let DriveKind::Ata(ata) = kind {
                    data_buf[..512].copy_from_slice(&ata.identify_block());
                    *transfer_length = 512;
                    *transfer_index = 0;
                    self.error = ErrorReg::empty();
                    self.status = Status::DRDY | Status::DRQ | Status::DSC;
                    self.raise_irq();
                } else {
                    self.selected_mut().reset();
                    self.abort_command();
                }
            }

            ata::ATA_PACKETCMD => {
                if !self.selected().kind.is_atapi() {
                    self.abort_command();
                    return;
                }
                let drive = self.selected_mut();
                drive.sector_count = ATAPI_REASON_CD; // command phase
                drive.transfer_length = ATAPI_PACKET_SIZE as u64;
                drive.transfer_index = 0;
                self.status.remove(Status::BSY | Status::DWF | Status::ERR);
                self.status.insert(Status::DRQ);
            }

            ata::ATA_READ | ata::ATA_READ_ONCE | ata::ATA_MULTREAD | ata::ATA_READ_EXT => {
                if !self.set_cluster_size(value == ata::ATA_MULTREAD) {
                    return;
                }
                self.ata_read_sectors();
            }

            ata::ATA_WRITE | ata::ATA_WRITE_ONCE | ata::ATA_MULTWRITE | ata::ATA_WRITE_EXT => {
                if !self.set_cluster_size(value == ata::ATA_MULTWRITE) {
                    return;
                }
                self.ata_write_sectors();
            }

            ata::ATA_READDMA | ata::ATA_READDMA_ONCE | ata::ATA_READDMA_EXT
            | ata::ATA_WRITEDMA | ata::ATA_WRITEDMA_ONCE | ata::ATA_WRITEDMA_EXT => {
                if !self.set_cluster_size(false) {
                    return;
                }
                self.ata_setup_dma();
            }

            ata::ATA_STANDBYNOW1 | ata::ATA_IDLEIMMEDIATE | ata::ATA_STANDBY
            | ata::ATA_SETIDLE1 | ata::ATA_SLEEPNOW1 | ata::ATA_STANDBYNOW2
            | ata::ATA_IDLEIMMEDIATE2 | ata::ATA_STANDBY2 | ata::ATA_SETIDLE2
            | ata::ATA_SLEEPNOW2 => {
                self.status = Status::DRDY;
                self.raise_irq();
            }

            ata::ATA_SETFEATURES => {
                self.status.remove(Status::BSY | Status::DWF | Status::ERR);
                self.status.insert(Status::DRDY | Status::DSC);
                self.raise_irq();
            }

            ata::ATA_SPECIFY | ata::ATA_RECAL => {
                self.status.remove(Status::ERR);
                self.status.insert(Status::DRDY | Status::DSC);
                self.raise_irq();
            }

            ata::ATA_SETMULT => {
                let requested = u32::from(self.selected().sector_count);
                let sel = self.selected_index();
                let DriveKind::Ata(ata) = &mut self.drives[sel].kind else {
                    self.abort_command();
                    return;
                };
                if requested == 0 || requested > ata::MAX_MULT_SECTORS {
                    ata.mult_sector_num = 1;
                    self.abort_command();
                    return;
                }
                ata.mult_sector_num = requested;
                self.status.remove(Status::ERR);
                self.status.insert(Status::DRDY);
                self.raise_irq();
            }

            ata::ATA_DEVICE_RESET => {
                self.selected_mut().reset();
                self.error = ErrorReg::AMNF;
                self.status = Status::DRDY | Status::DSC;
                self.raise_irq();
            }

            ata::ATA_CHECKPOWERMODE1 => {
                // 0xFF: active or idle.
                self.selected_mut().sector_count = 0xFF;
                self.status = Status::DRDY;
                self.raise_irq();
            }

            other => {
                warn!(command = format_args!("{other:#x}"), "unimplemented IDE command");
                self.abort_command();
            }
        }
    }

    /// Cluster size for interrupt pacing: the SET MULTIPLE value for the
    /// MULTIPLE commands, one sector otherwise. False when the selected
    /// drive is not a disk.
    fn set_cluster_size(&mut self, multiple: bool) -> bool {
        let sel = self.selected_index();
        let DriveKind::Ata(ata) = &mut self.drives[sel].kind else {
            self.abort_command();
            return false;
        };
        ata.cur_sector_num = if multiple { ata.mult_sector_num } else { 1 };
        true
    }

    /* PIO data phase */

    fn read_data(&mut self, buf: &mut [u8]) {
        if self.cmd_reg == ata::ATA_IDENTIFY || self.cmd_reg == ata::ATA_PIDENTIFY {
            self.read_drive_id(buf);
            return;
        }
        match self.selected().kind {
            DriveKind::Ata(_) => self.read_hd_data(buf),
            DriveKind::Atapi(_) => self.read_cd_data(buf),
            DriveKind::None => buf.fill(0),
        }
    }

    fn write_data(&mut self, data: &[u8]) {
        match self.selected().kind {
            DriveKind::Atapi(_) if self.cmd_reg == ata::ATA_PACKETCMD => {
                self.write_packet_data(data);
            }
            DriveKind::Atapi(_) => {
                warn!(
                    command = format_args!("{:#x}", self.cmd_reg),
                    "data-port write to a CD-ROM outside a packet command"
                );
            }
            DriveKind::Ata(_) => self.write_hd_data(data),
            // Writable empty slots do not exist.
            DriveKind::None => {}
        }
    }

    fn read_drive_id(&mut self, buf: &mut [u8]) {
        self.status.remove(Status::BSY | Status::DWF | Status::CORR | Status::ERR);
        self.status.insert(Status::DRDY | Status::DSC);

        let drive = self.selected_mut();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = drive
                .data_buf
                .get(drive.transfer_index as usize + i)
                .copied()
                .unwrap_or(0);
        }
        drive.transfer_index += buf.len() as u64;
        if drive.transfer_index >= drive.transfer_length {
            self.status.remove(Status::DRQ);
        }
    }

    fn read_hd_data(&mut self, buf: &mut [u8]) {
        let sel = self.selected_index();
        let cluster = match &self.drives[sel].kind {
            DriveKind::Ata(ata) => u64::from(ata.cur_sector_num.max(1)),
            _ => 1,
        };

        let outcome = {
            let DriveState { kind, data_buf, current_lba, transfer_index, transfer_length, .. } =
                &mut self.drives[sel];

            if *transfer_index >= *transfer_length {
                warn!("data-port read past the end of the transfer");
                buf.fill(0);
                PioOutcome::Overrun
            } else {
                let offset = (*transfer_index % SECTOR_SIZE as u64) as usize;

                // The first sector was loaded by the command; refill lazily
                // at each sector boundary after that.
                let refill_failed = if offset == 0 && *transfer_index > 0 {
                    *current_lba += 1;
                    match kind {
                        DriveKind::Ata(ata) => ata.read(*current_lba, 1, data_buf).is_err(),
                        _ => true,
                    }
                } else {
                    false
                };

                if refill_failed {
                    buf.fill(0);
                    PioOutcome::IoError
                } else {
                    buf.copy_from_slice(&data_buf[offset..offset + buf.len()]);
                    *transfer_index += buf.len() as u64;
                    PioOutcome::Ok
                }
            }
        };

        self.finish_hd_access(sel, cluster, outcome);
    }

    fn write_hd_data(&mut self, data: &[u8]) {
        let sel = self.selected_index();
        let cluster = match &self.drives[sel].kind {
            DriveKind::Ata(ata) => u64::from(ata.cur_sector_num.max(1)),
            _ => 1,
        };

        let outcome = {
            let DriveState { kind, data_buf, current_lba, transfer_index, transfer_length, .. } =
                &mut self.drives[sel];

            if *transfer_index >= *transfer_length {
                warn!("data-port write past the end of the transfer");
                PioOutcome::Overrun
            } else {
                let offset = (*transfer_index % SECTOR_SIZE as u64) as usize;
                data_buf[offset..offset + data.len()].copy_from_slice(data);
                *transfer_index += data.len() as u64;

                // Flush each completed sector and advance.
                if offset + data.len() >= SECTOR_SIZE {
                    let flush_failed = match kind {
                        DriveKind::Ata(ata) => ata.write(*current_lba, 1, data_buf).is_err(),
                        _ => true,
                    };
                    if flush_failed {
                        PioOutcome::IoError
                    } else {
                        *current_lba += 1;
                        PioOutcome::Ok
                    }
                } else {
                    PioOutcome::Ok
                }
            }
        };

        self.finish_hd_access(sel, cluster, outcome);
    }

    fn finish_hd_access(&mut self, sel: usize, cluster: u64, outcome: PioOutcome) {
        match outcome {
            PioOutcome::Ok => self.finish_hd_increment(sel, cluster),
            PioOutcome::IoError => {
                self.status.insert(Status::ERR);
                self.status.remove(Status::DRQ);
                self.raise_irq();
            }
            PioOutcome::Overrun => {}
        }
    }

    /// Interrupt pacing shared by the PIO read and write paths: fire on
    /// each cluster boundary and on the final byte of the transfer.
    fn finish_hd_increment(&mut self, sel: usize, cluster: u64) {
        let (index, length) = {
            let drive = &self.drives[sel];
            (drive.transfer_index, drive.transfer_length)
        };

        let boundary = index % (SECTOR_SIZE as u64 * cluster) == 0;
        if boundary || index == length {
            if index < length {
                self.status.insert(Status::DRQ);
            } else {
                self.status.remove(Status::DRQ);
            }
            self.status.insert(Status::DRDY);
            self.status.remove(Status::BSY);
            self.raise_irq();
        }
    }

    /* Bus master */

    pub(crate) fn bm_read(&self, offset: u16, size: usize) -> u32 {
        let bytes = [
            self.dma.cmd.bits(),
            0,
            self.dma.status.bits(),
            0,
            self.dma.prd_addr as u8,
            (self.dma.prd_addr >> 8) as u8,
            (self.dma.prd_addr >> 16) as u8,
            (self.dma.prd_addr >> 24) as u8,
        ];
        let mut value = 0u32;
        for i in 0..size {
            let byte = bytes.get(offset as usize + i).copied().unwrap_or(0xFF);
            value |= u32::from(byte) << (i * 8);
        }
        value
    }

    pub(crate) fn bm_write(&mut self, offset: u16, size: usize, value: u32) {
        match offset {
            0 => {
                self.dma.cmd = BmCommand::from_bits_truncate(value as u8);
                if self.dma.cmd.contains(BmCommand::START) {
                    // Arm the engine; the walk runs at the next tick.
                    self.dma.status.insert(BmStatus::ACTIVE);
                } else {
                    self.dma.tbl_index = 0;
                    self.dma.status.remove(BmStatus::ACTIVE);
                }
            }
            2 => {
                if size != 1 {
                    warn!(size, "bus-master status write must be one byte");
                    return;
                }
                let value = value as u8;
                let current = self.dma.status.bits();
                // Capability hints are plain R/W, ACTIVE is read-only, and
                // ERR/INT clear on writing one.
                let next = (value & 0x60) | (current & 0x01) | (current & !value & 0x06);
                self.dma.status = BmStatus::from_bits_truncate(next);
            }
            4 => {
                if size != 4 {
                    debug!(size, "partial PRD pointer write ignored");
                    return;
                }
                self.dma.prd_addr = value & !0x3;
            }
            _ => debug!(offset, "write to unhandled bus-master register"),
        }
    }

    fn dma_error(&mut self) {
        self.dma.status.insert(BmStatus::ERR);
        self.dma.status.remove(BmStatus::ACTIVE);
        self.raise_irq();
    }

    fn dma_success(&mut self) {
        self.status = Status::DRDY | Status::DSC;
        self.dma.status.remove(BmStatus::ACTIVE | BmStatus::ERR);
        self.raise_irq();
    }

    /// Runs the armed transfer against the PRD table.
    pub(crate) fn run_dma(&mut self, mem: &mut dyn MemoryBus, allow_cmd_response_dma: bool) {
        let to_memory = self.dma.cmd.contains(BmCommand::READ);
        let sel = self.selected_index();

        // Direction and quantum implied by the armed command.
        let expected = match (&self.drives[sel].kind, self.cmd_reg) {
            (DriveKind::Ata(_), ata::ATA_READDMA | ata::ATA_READDMA_ONCE | ata::ATA_READDMA_EXT) => {
                Some((true, SECTOR_SIZE))
            }
            (
                DriveKind::Ata(_),
                ata::ATA_WRITEDMA | ata::ATA_WRITEDMA_ONCE | ata::ATA_WRITEDMA_EXT,
            ) => Some((false, SECTOR_SIZE)),
            (DriveKind::Atapi(cd), ata::ATA_PACKETCMD) => {
                if cd.command_is_data_in() {
                    Some((true, ATAPI_BLOCK_SIZE))
                } else if allow_cmd_response_dma {
                    // Short command responses copied through the first PRD.
                    self.run_response_dma(mem, to_memory);
                    return;
                } else {
                    warn!("bus-master start against a non-data ATAPI command");
                    self.dma_error();
                    return;
                }
            }
            _ => None,
        };

        let Some((dir_to_memory, quantum)) = expected else {
            warn!(command = format_args!("{:#x}", self.cmd_reg), "bus-master start with no DMA armed");
            self.dma_error();
            return;
        };

        if dir_to_memory != to_memory {
            warn!("bus-master direction disagrees with the armed transfer");
            self.dma_error();
            return;
        }

        let mut bytes_left = {
            let drive = &self.drives[sel];
            drive.transfer_length - drive.transfer_index
        };
        if bytes_left == 0 {
            warn!("bus-master start with nothing to transfer");
            self.dma_error();
            return;
        }

        while bytes_left > 0 {
            let entry_addr =
                u64::from(self.dma.prd_addr) + PRD_ENTRY_SIZE * u64::from(self.dma.tbl_index);
            let base = mem.read_u32(entry_addr);
            let size = mem.read_u16(entry_addr + 4);
            let eot = mem.read_u16(entry_addr + 6) & PRD_EOT != 0;

            let mut prd_left: usize = if size == 0 { 0x1_0000 } else { usize::from(size) };
            let mut prd_offset: u64 = 0;

            while prd_left > 0 && bytes_left > 0 {
                let chunk = quantum.min(bytes_left as usize);
                if prd_left < chunk {
                    warn!("transfer quantum spans PRD entries");
                    self.dma_error();
                    return;
                }

                if !self.dma_quantum(mem, sel, u64::from(base) + prd_offset, chunk, dir_to_memory) {
                    self.dma_error();
                    return;
                }

                prd_left -= chunk;
                prd_offset += chunk as u64;
                bytes_left -= chunk as u64;
            }

            self.dma.tbl_index += 1;

            if bytes_left > 0 {
                if eot {
                    warn!(remaining = bytes_left, "PRD table exhausted before the transfer");
                    self.dma_error();
                    return;
                }
            } else if !eot {
                warn!("transfer complete but the PRD table has no end-of-table entry");
                self.dma_error();
                return;
            }
        }

        if let DriveKind::Atapi(_) = self.drives[sel].kind {
            // Status phase: command complete, data to host.
            self.drives[sel].sector_count = ATAPI_REASON_CD | ATAPI_REASON_IO;
        }
        self.dma_success();
    }

    /// Moves one device quantum between the drive and guest memory.
    fn dma_quantum(
        &mut self,
        mem: &mut dyn MemoryBus,
        sel: usize,
        gpa: u64,
        chunk: usize,
        to_memory: bool,
    ) -> bool {
        let DriveState { kind, data_buf, current_lba, transfer_index, .. } = &mut self.drives[sel];

        match kind {
            DriveKind::Ata(ata) => {
                if to_memory {
                    if ata.read(*current_lba, 1, data_buf).is_err() {
                        return false;
                    }
                    mem.write_physical(gpa, &data_buf[..chunk]);
                } else {
                    mem.read_physical(gpa, &mut data_buf[..chunk]);
                    if chunk == SECTOR_SIZE && ata.write(*current_lba, 1, data_buf).is_err() {
                        return false;
                    }
                }
            }
            DriveKind::Atapi(cd) => {
                debug_assert!(to_memory);
                if cd.read_block(*current_lba as u32, data_buf).is_err() {
                    return false;
                }
                mem.write_physical(gpa, &data_buf[..chunk]);
            }
            DriveKind::None => return false,
        }

        *current_lba += 1;
        *transfer_index += chunk as u64;
        true
    }

    /// Opt-in path for guests that bus-master the short response of a
    /// non-data ATAPI command instead of reading it over PIO.
    fn run_response_dma(&mut self, mem: &mut dyn MemoryBus, to_memory: bool) {
        if !to_memory {
            self.dma_error();
            return;
        }
        let sel = self.selected_index();

        let entry_addr = u64::from(self.dma.prd_addr) + PRD_ENTRY_SIZE * u64::from(self.dma.tbl_index);
        let base = mem.read_u32(entry_addr);
        let size = mem.read_u16(entry_addr + 4);
        let prd_len = if size == 0 { 0x1_0000 } else { usize::from(size) };

        let drive = &mut self.drives[sel];
        let remaining = (drive.transfer_length - drive.transfer_index) as usize;
        let chunk = remaining.min(prd_len).min(DATA_BUFFER_SIZE);
        mem.write_physical(u64::from(base), &drive.data_buf[..chunk]);
        drive.transfer_index += chunk as u64;
        drive.sector_count = ATAPI_REASON_CD | ATAPI_REASON_IO;
        self.dma.tbl_index += 1;

        self.dma_success();
    }

    /* Snapshot */

    fn save_state(&self, snap: &mut IoSnapshot, prefix: &str) {
        snap.put_u8(&format!("{prefix}.error"), self.error.bits());
        snap.put_u8(&format!("{prefix}.features"), self.features);
        snap.put_u8(&format!("{prefix}.drive_head"), self.drive_head.0);
        snap.put_u8(&format!("{prefix}.status"), self.status.bits());
        snap.put_u8(&format!("{prefix}.cmd_reg"), self.cmd_reg);
        snap.put_u8(&format!("{prefix}.ctrl"), self.ctrl.bits());
        snap.put_u8(&format!("{prefix}.irq_level"), u8::from(self.irq_level));
        snap.put_u8(&format!("{prefix}.dma_cmd"), self.dma.cmd.bits());
        snap.put_u8(&format!("{prefix}.dma_status"), self.dma.status.bits());
        snap.put_u32(&format!("{prefix}.dma_prd_addr"), self.dma.prd_addr);
        snap.put_u32(&format!("{prefix}.dma_tbl_index"), self.dma.tbl_index);

        for (i, drive) in self.drives.iter().enumerate() {
            let p = format!("{prefix}.drive{i}");
            snap.put_u8(&format!("{p}.sector_count"), drive.sector_count);
            snap.put_u8(&format!("{p}.sector_num"), drive.sector_num);
            snap.put_u16(&format!("{p}.cylinder"), drive.cylinder());
            snap.put_u64(&format!("{p}.current_lba"), drive.current_lba);
            snap.put_u64(&format!("{p}.transfer_length"), drive.transfer_length);
            snap.put_u64(&format!("{p}.transfer_index"), drive.transfer_index);
            snap.put_u32(&format!("{p}.req_len"), drive.req_len);
            snap.put_bytes(&format!("{p}.data_buf"), &drive.data_buf);
            snap.put_u16(&format!("{p}.lba48_count"), drive.lba48.count);
            snap.put_bytes(&format!("{p}.lba48_bytes"), &drive.lba48.lba_bytes);
            snap.put_u16(&format!("{p}.lba48_count_latch"), drive.lba48.count_latch.encode());
            for (j, latch) in drive.lba48.lba_latch.iter().enumerate() {
                snap.put_u16(&format!("{p}.lba48_latch{j}"), latch.encode());
            }

            match &drive.kind {
                DriveKind::Ata(ata) => {
                    snap.put_u8(&format!("{p}.accessed"), u8::from(ata.accessed));
                    snap.put_u32(&format!("{p}.mult_sector_num"), ata.mult_sector_num);
                    snap.put_u32(&format!("{p}.cur_sector_num"), ata.cur_sector_num);
                }
                DriveKind::Atapi(cd) => {
                    snap.put_u8(&format!("{p}.sense_key"), cd.sense.key);
                    snap.put_u8(&format!("{p}.sense_asc"), cd.sense.asc);
                    snap.put_u8(&format!("{p}.sense_ascq"), cd.sense.ascq);
                    snap.put_u8(&format!("{p}.atapi_cmd"), cd.atapi_cmd);
                }
                DriveKind::None => {}
            }
        }
    }

    fn load_state(&mut self, snap: &IoSnapshot, prefix: &str) -> Result<(), SnapshotError> {
        self.error = ErrorReg::from_bits_retain(snap.get_u8(&format!("{prefix}.error"))?);
        self.features = snap.get_u8(&format!("{prefix}.features"))?;
        self.drive_head = DriveHead(snap.get_u8(&format!("{prefix}.drive_head"))?);
        self.status = Status::from_bits_retain(snap.get_u8(&format!("{prefix}.status"))?);
        self.cmd_reg = snap.get_u8(&format!("{prefix}.cmd_reg"))?;
        self.ctrl = DevControl::from_bits_retain(snap.get_u8(&format!("{prefix}.ctrl"))?);
        self.irq_level = snap.get_u8(&format!("{prefix}.irq_level"))? != 0;
        self.dma.cmd = BmCommand::from_bits_truncate(snap.get_u8(&format!("{prefix}.dma_cmd"))?);
        self.dma.status =
            BmStatus::from_bits_truncate(snap.get_u8(&format!("{prefix}.dma_status"))?);
        self.dma.prd_addr = snap.get_u32(&format!("{prefix}.dma_prd_addr"))?;
        self.dma.tbl_index = snap.get_u32(&format!("{prefix}.dma_tbl_index"))?;

        for (i, drive) in self.drives.iter_mut().enumerate() {
            let p = format!("{prefix}.drive{i}");
            drive.sector_count = snap.get_u8(&format!("{p}.sector_count"))?;
            drive.sector_num = snap.get_u8(&format!("{p}.sector_num"))?;
            let cylinder = snap.get_u16(&format!("{p}.cylinder"))?;
            drive.set_cylinder(cylinder);
            drive.current_lba = snap.get_u64(&format!("{p}.current_lba"))?;
            drive.transfer_length = snap.get_u64(&format!("{p}.transfer_length"))?;
            drive.transfer_index = snap.get_u64(&format!("{p}.transfer_index"))?;
            drive.req_len = snap.get_u32(&format!("{p}.req_len"))?;
            drive.data_buf = snap.get_array(&format!("{p}.data_buf"))?;
            drive.lba48.count = snap.get_u16(&format!("{p}.lba48_count"))?;
            drive.lba48.lba_bytes = snap.get_array(&format!("{p}.lba48_bytes"))?;
            drive.lba48.count_latch =
                ByteLatch::decode(snap.get_u16(&format!("{p}.lba48_count_latch"))?);
            for j in 0..3 {
                drive.lba48.lba_latch[j] =
                    ByteLatch::decode(snap.get_u16(&format!("{p}.lba48_latch{j}"))?);
            }

            match &mut drive.kind {
                DriveKind::Ata(ata) => {
                    ata.accessed = snap.get_u8(&format!("{p}.accessed"))? != 0;
                    ata.mult_sector_num = snap.get_u32(&format!("{p}.mult_sector_num"))?;
                    ata.cur_sector_num = snap.get_u32(&format!("{p}.cur_sector_num"))?;
                }
                DriveKind::Atapi(cd) => {
                    cd.sense.key = snap.get_u8(&format!("{p}.sense_key"))?;
                    cd.sense.asc = snap.get_u8(&format!("{p}.sense_asc"))?;
                    cd.sense.ascq = snap.get_u8(&format!("{p}.sense_ascq"))?;
                    cd.atapi_cmd = snap.get_u8(&format!("{p}.atapi_cmd"))?;
                }
                DriveKind::None => {}
            }
        }
        Ok(())
    }
}

/// The controller: two channels at the legacy port blocks.
pub struct IdeController {
    pub(crate) channels: [IdeChannel; 2],
    allow_cmd_response_dma: bool,
}

impl IdeController {
    pub fn new(primary_irq: Box<dyn IrqLine>, secondary_irq: Box<dyn IrqLine>) -> Self {
        Self {
            channels: [IdeChannel::new(primary_irq), IdeChannel::new(secondary_irq)],
            allow_cmd_response_dma: false,
        }
    }

    /// Opt-in for ide-class guests that DMA short ATAPI command responses
    /// (outside the ATAPI spec; off by default).
    pub fn set_allow_cmd_response_dma(&mut self, allowed: bool) {
        self.allow_cmd_response_dma = allowed;
    }

    fn attach(&mut self, channel: usize, slot: usize, kind: DriveKind) {
        let drive = &mut self.channels[channel].drives[slot];
        if !drive.kind.is_none() {
            warn!(channel, slot, "drive slot already occupied, replacing");
        }
        drive.kind = kind;
        drive.reset();
    }

    pub fn attach_primary_master_ata(&mut self, drive: AtaDrive) {
        self.attach(0, 0, DriveKind::Ata(drive));
    }

    pub fn attach_primary_slave_ata(&mut self, drive: AtaDrive) {
        self.attach(0, 1, DriveKind::Ata(drive));
    }

    pub fn attach_secondary_master_ata(&mut self, drive: AtaDrive) {
        self.attach(1, 0, DriveKind::Ata(drive));
    }

    pub fn attach_primary_master_atapi(&mut self, drive: AtapiCdrom) {
        self.attach(0, 0, DriveKind::Atapi(drive));
    }

    pub fn attach_secondary_master_atapi(&mut self, drive: AtapiCdrom) {
        self.attach(1, 0, DriveKind::Atapi(drive));
    }

    pub fn attach_secondary_slave_atapi(&mut self, drive: AtapiCdrom) {
        self.attach(1, 1, DriveKind::Atapi(drive));
    }

    pub fn primary_irq_pending(&self) -> bool {
        self.channels[0].irq_pending()
    }

    pub fn secondary_irq_pending(&self) -> bool {
        self.channels[1].irq_pending()
    }

    fn decode(port: u16) -> Option<(usize, PortReg)> {
        let (channel, reg) = match port {
            0x1F0..=0x1F7 => (0, port - 0x1F0),
            0x170..=0x177 => (1, port - 0x170),
            0x3F6 => return Some((0, PortReg::Control)),
            0x3F7 => return Some((0, PortReg::AddrReg)),
            0x376 => return Some((1, PortReg::Control)),
            0x377 => return Some((1, PortReg::AddrReg)),
            _ => return None,
        };
        let reg = match reg {
            0 => PortReg::Data,
            1 => PortReg::Features,
            2 => PortReg::SectCount,
            3 => PortReg::SectNum,
            4 => PortReg::CylLow,
            5 => PortReg::CylHigh,
            6 => PortReg::DriveSel,
            _ => PortReg::Command,
        };
        Some((channel, reg))
    }

    pub fn io_read(&mut self, port: u16, size: usize) -> u32 {
        let Some((channel, reg)) = Self::decode(port) else {
            warn!(port = format_args!("{port:#x}"), "read from unclaimed IDE port");
            return u32::MAX;
        };
        let channel = &mut self.channels[channel];

        match reg {
            PortReg::Data => {
                let mut buf = [0u8; 4];
                let size = size.min(4);
                channel.read_data(&mut buf[..size]);
                u32::from_le_bytes(buf)
            }
            _ => {
                if size != 1 {
                    debug!(port = format_args!("{port:#x}"), size, "wide read of a byte register");
                }
                u32::from(channel.read_reg(reg))
            }
        }
    }

    pub fn io_write(&mut self, port: u16, size: usize, value: u32) {
        let Some((channel_idx, reg)) = Self::decode(port) else {
            warn!(port = format_args!("{port:#x}"), "write to unclaimed IDE port");
            return;
        };
        let channel = &mut self.channels[channel_idx];

        match reg {
            PortReg::Data => {
                let size = size.min(4);
                let bytes = value.to_le_bytes();
                channel.write_data(&bytes[..size]);
            }
            PortReg::Command => {
                if size != 1 {
                    debug!(port = format_args!("{port:#x}"), size, "wide write of the command register");
                }
                channel.write_command(value as u8);
            }
            _ => {
                if size != 1 {
                    debug!(port = format_args!("{port:#x}"), size, "wide write of a byte register");
                }
                channel.write_reg(reg, value as u8);
            }
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.io_read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.io_write(port, 1, u32::from(value));
    }

    /// Bus-master register block access, `offset` relative to BAR4
    /// (0–7 primary, 8–15 secondary).
    pub fn bm_read(&mut self, offset: u16, size: usize) -> u32 {
        let channel = usize::from(offset >> 3) & 1;
        self.channels[channel].bm_read(offset & 0x7, size)
    }

    pub fn bm_write(&mut self, offset: u16, size: usize, value: u32) {
        let channel = usize::from(offset >> 3) & 1;
        self.channels[channel].bm_write(offset & 0x7, size, value);
    }

    /// Executes any armed bus-master transfers against guest memory.
    pub fn tick(&mut self, mem: &mut dyn MemoryBus) {
        let allow = self.allow_cmd_response_dma;
        for channel in &mut self.channels {
            if channel.dma.cmd.contains(BmCommand::START)
                && channel.dma.status.contains(BmStatus::ACTIVE)
            {
                channel.run_dma(mem, allow);
                // The guest cannot abort a transfer in progress.
                channel.dma.cmd.remove(BmCommand::START);
            }
        }
    }

    pub fn save_state_into(&self, snap: &mut IoSnapshot) {
        for (i, channel) in self.channels.iter().enumerate() {
            channel.save_state(snap, &format!("ide.ch{i}"));
        }
    }

    pub fn load_state_from(&mut self, snap: &IoSnapshot) -> Result<(), SnapshotError> {
        for (i, channel) in self.channels.iter_mut().enumerate() {
            channel.load_state(snap, &format!("ide.ch{i}"))?;
        }
        Ok(())
    }
}
