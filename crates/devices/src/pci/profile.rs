//! Identities of the PCI functions this workspace models.

use super::{PciBdf, PciClassCode, PciDeviceProfile};

/// PIIX3 IDE controller function: mass storage, IDE subclass, bus-master
/// capable programming interface, conventionally at 00:01.1.
pub const IDE_PIIX3: PciDeviceProfile = PciDeviceProfile {
    vendor_id: 0x8086,
    device_id: 0x7010,
    revision_id: 0x00,
    class: PciClassCode {
        base_class: 0x01,
        sub_class: 0x01,
        prog_if: 0x80,
    },
    bdf: PciBdf {
        bus: 0,
        device: 1,
        function: 1,
    },
    status: 0x0280,
};
