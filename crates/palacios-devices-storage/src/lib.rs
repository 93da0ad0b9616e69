//! Dual-channel IDE host controller with ATA disk and ATAPI CD-ROM drives.
//!
//! [`ide::IdeController`] models the two legacy channels at the register
//! level: programmed I/O transfers, the ATA command set, the ATAPI packet
//! engine, and the PIIX3-style bus-master DMA engine driven from a PRD
//! table. [`pci_ide::Piix3IdePciDevice`] wraps the controller in the PCI
//! function guests expect at 00:01.1.

pub mod ata;
pub mod atapi;
pub mod ide;
pub mod pci_ide;

mod regs;
