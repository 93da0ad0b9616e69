//! Bit-level layouts of the task-file and bus-master registers.

use bitflags::bitflags;

bitflags! {
    /// Command-block status register (0x1F7 read / 0x3F6 alternate).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        const ERR = 1 << 0;
        const IDX = 1 << 1;
        const CORR = 1 << 2;
        const DRQ = 1 << 3;
        const DSC = 1 << 4;
        const DWF = 1 << 5;
        const DRDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

bitflags! {
    /// Error register (0x1F1 read). For ATAPI completions the high nibble
    /// carries the sense key instead.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorReg: u8 {
        const AMNF = 1 << 0;
        const TK0NF = 1 << 1;
        const ABRT = 1 << 2;
        const IDNF = 1 << 4;
        const UNC = 1 << 6;
        const BBK = 1 << 7;
    }
}

bitflags! {
    /// Device-control register (0x3F6 write).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevControl: u8 {
        const NIEN = 1 << 1;
        const SRST = 1 << 2;
    }
}

bitflags! {
    /// Bus-master command register (BAR4 + 0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmCommand: u8 {
        const START = 1 << 0;
        /// Set: device-to-memory (a read transfer).
        const READ = 1 << 3;
    }
}

bitflags! {
    /// Bus-master status register (BAR4 + 2). ERR and INT are RW1C.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmStatus: u8 {
        const ACTIVE = 1 << 0;
        const ERR = 1 << 1;
        const INT = 1 << 2;
        const DRIVE0_CAP = 1 << 5;
        const DRIVE1_CAP = 1 << 6;
    }
}

/// Drive/head register (0x1F6). Bits 5 and 7 are the legacy "reserved"
/// bits whose pattern distinguishes LBA28 (both set) from LBA48 (both
/// clear) when the LBA-mode bit is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveHead(pub u8);

impl DriveHead {
    pub fn drive_sel(self) -> usize {
        usize::from(self.0 >> 4 & 1)
    }

    pub fn head_num(self) -> u8 {
        self.0 & 0xF
    }

    pub fn is_lba28(self) -> bool {
        self.0 & 0xE0 == 0xE0
    }

    pub fn is_lba48(self) -> bool {
        self.0 & 0xE0 == 0x40
    }

    /// The addressing-mode bits whose change resets the LBA48 latches.
    pub fn mode_bits(self) -> u8 {
        self.0 & 0xE0
    }
}

/// ATAPI interrupt-reason flags, surfaced through the sector-count
/// register: bit 0 command/data, bit 1 transfer direction (to host).
pub const ATAPI_REASON_CD: u8 = 1 << 0;
pub const ATAPI_REASON_IO: u8 = 1 << 1;
