//! ATA hard-disk drive model.

use palacios_storage::{DiskError, VirtualDisk, SECTOR_SIZE};
use tracing::warn;

/// Largest cluster size SET MULTIPLE MODE accepts, advertised in IDENTIFY.
pub const MAX_MULT_SECTORS: u32 = 255;

const DEFAULT_SECTORS_PER_TRACK: u32 = 63;
const DEFAULT_HEADS: u32 = 16;

/// A fixed disk attached to an IDE slot: block backend plus the drive-level
/// configuration the channel state machine consults.
pub struct AtaDrive {
    disk: Box<dyn VirtualDisk>,
    model: [u8; 40],

    pub(crate) num_cylinders: u32,
    pub(crate) num_heads: u32,
    pub(crate) num_sectors: u32,

    /// Cluster size configured by SET MULTIPLE MODE.
    pub(crate) mult_sector_num: u32,
    /// Cluster size of the op in flight: `mult_sector_num` for READ/WRITE
    /// MULTIPLE, 1 for everything else.
    pub(crate) cur_sector_num: u32,
    /// The drive has serviced at least one media access.
    pub(crate) accessed: bool,
}

impl AtaDrive {
    /// Attaches a block backend as a disk, deriving a classic 63-sector,
    /// 16-head translated geometry from its capacity.
    pub fn new(disk: Box<dyn VirtualDisk>) -> Result<Self, DiskError> {
        let capacity = disk.capacity_bytes();
        if capacity == 0 || capacity % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::UnalignedCapacity(capacity));
        }

        let track_sectors = u64::from(DEFAULT_SECTORS_PER_TRACK * DEFAULT_HEADS);
        let cylinders = (capacity / SECTOR_SIZE as u64 / track_sectors) as u32;

        let mut drive = Self {
            disk,
            model: [b' '; 40],
            num_cylinders: cylinders,
            num_heads: DEFAULT_HEADS,
            num_sectors: DEFAULT_SECTORS_PER_TRACK,
            mult_sector_num: 1,
            cur_sector_num: 1,
            accessed: false,
        };
        drive.set_model("PALACIOS HARDDISK");
        Ok(drive)
    }

    pub fn set_model(&mut self, model: &str) {
        self.model = [b' '; 40];
        for (dst, src) in self.model.iter_mut().zip(model.bytes()) {
            *dst = src;
        }
    }

    pub fn model(&self) -> &[u8; 40] {
        &self.model
    }

    pub fn geometry(&self) -> (u32, u32, u32) {
        (self.num_cylinders, self.num_heads, self.num_sectors)
    }

    pub fn sector_count(&self) -> u64 {
        self.disk.capacity_bytes() / SECTOR_SIZE as u64
    }

    /// Reads `count` sectors starting at `lba` into `buf`.
    pub(crate) fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), DiskError> {
        self.accessed = true;
        self.disk.read_sectors(lba, &mut buf[..count * SECTOR_SIZE]).map_err(|err| {
            warn!(lba, %err, "disk read failed");
            err
        })
    }

    /// Writes `count` sectors starting at `lba` from `buf`.
    pub(crate) fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> Result<(), DiskError> {
        self.accessed = true;
        self.disk.write_sectors(lba, &buf[..count * SECTOR_SIZE]).map_err(|err| {
            warn!(lba, %err, "disk write failed");
            err
        })
    }

    /// The 512-byte IDENTIFY DEVICE block.
    pub(crate) fn identify_block(&self) -> [u8; 512] {
        let mut words = [0u16; 256];
        let total_sectors = self.sector_count();

        words[0] = 0x0040; // fixed drive
        words[1] = self.num_cylinders as u16;
        words[3] = self.num_heads as u16;
        words[4] = (self.num_sectors * SECTOR_SIZE as u32) as u16;
        words[5] = SECTOR_SIZE as u16;
        words[6] = self.num_sectors as u16;

        put_ata_string(&mut words[10..20], b" VT00001");
        put_ata_string(&mut words[23..27], b"ALPHA1  ");
        put_ata_string(&mut words[27..47], &self.model);

        words[47] = 0x8000 | MAX_MULT_SECTORS as u16;
        words[48] = 0x0001; // 32-bit PIO
        words[49] = 0x0300; // LBA + DMA capable
        words[53] = 0x0007; // words 54-58, 64-70, 88 valid
        words[54] = self.num_cylinders as u16;
        words[55] = self.num_heads as u16;
        words[56] = self.num_sectors as u16;
        let current = total_sectors.min(u64::from(u32::MAX)) as u32;
        words[57] = current as u16;
        words[58] = (current >> 16) as u16;

        let lba28 = total_sectors.min(0x0FFF_FFFF) as u32;
        words[60] = lba28 as u16;
        words[61] = (lba28 >> 16) as u16;

        words[63] = 0x0007; // MWDMA 0-2 supported
        words[64] = 0x0001; // PIO mode support
        words[65] = 0x00B4;
        words[66] = 0x00B4;
        words[67] = 0x012C;
        words[68] = 0x00B4;
        words[71] = 30;
        words[72] = 30;
        words[80] = 0x0040; // ATA/ATAPI-6
        words[83] = 0x0400; // LBA48
        words[88] = 0x2020; // UDMA5 supported and selected

        words[100] = total_sectors as u16;
        words[101] = (total_sectors >> 16) as u16;
        words[102] = (total_sectors >> 32) as u16;
        words[103] = (total_sectors >> 48) as u16;

        words_to_bytes(&words)
    }
}

/// ATA strings are ASCII packed big-endian within each 16-bit word.
pub(crate) fn put_ata_string(words: &mut [u16], text: &[u8]) {
    for (i, word) in words.iter_mut().enumerate() {
        let hi = text.get(i * 2).copied().unwrap_or(b' ');
        let lo = text.get(i * 2 + 1).copied().unwrap_or(b' ');
        *word = u16::from(hi) << 8 | u16::from(lo);
    }
}

pub(crate) fn words_to_bytes(words: &[u16; 256]) -> [u8; 512] {
    let mut bytes = [0u8; 512];
    for (i, word) in words.iter().enumerate() {
        bytes[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/* Command opcodes (ACS command-code table). */

pub(crate) const ATA_DEVICE_RESET: u8 = 0x08;
pub(crate) const ATA_RECAL: u8 = 0x10;
pub(crate) const ATA_READ: u8 = 0x20;
pub(crate) const ATA_READ_ONCE: u8 = 0x21;
pub(crate) const ATA_READ_EXT: u8 = 0x24;
pub(crate) const ATA_READDMA_EXT: u8 = 0x25;
pub(crate) const ATA_WRITE: u8 = 0x30;
pub(crate) const ATA_WRITE_ONCE: u8 = 0x31;
pub(crate) const ATA_WRITE_EXT: u8 = 0x34;
pub(crate) const ATA_WRITEDMA_EXT: u8 = 0x35;
pub(crate) const ATA_SPECIFY: u8 = 0x91;
pub(crate) const ATA_STANDBYNOW2: u8 = 0x94;
pub(crate) const ATA_IDLEIMMEDIATE2: u8 = 0x95;
pub(crate) const ATA_STANDBY2: u8 = 0x96;
pub(crate) const ATA_SETIDLE2: u8 = 0x97;
pub(crate) const ATA_SLEEPNOW2: u8 = 0x99;
pub(crate) const ATA_PACKETCMD: u8 = 0xA0;
pub(crate) const ATA_PIDENTIFY: u8 = 0xA1;
pub(crate) const ATA_MULTREAD: u8 = 0xC4;
pub(crate) const ATA_MULTWRITE: u8 = 0xC5;
pub(crate) const ATA_SETMULT: u8 = 0xC6;
pub(crate) const ATA_READDMA: u8 = 0xC8;
pub(crate) const ATA_READDMA_ONCE: u8 = 0xC9;
pub(crate) const ATA_WRITEDMA: u8 = 0xCA;
pub(crate) const ATA_WRITEDMA_ONCE: u8 = 0xCB;
pub(crate) const ATA_STANDBYNOW1: u8 = 0xE0;
pub(crate) const ATA_IDLEIMMEDIATE: u8 = 0xE1;
pub(crate) const ATA_STANDBY: u8 = 0xE2;
pub(crate) const ATA_SETIDLE1: u8 = 0xE3;
pub(crate) const ATA_CHECKPOWERMODE1: u8 = 0xE5;
pub(crate) const ATA_SLEEPNOW1: u8 = 0xE6;
pub(crate) const ATA_IDENTIFY: u8 = 0xEC;
pub(crate) const ATA_SETFEATURES: u8 = 0xEF;
