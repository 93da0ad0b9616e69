//! Flat guest-physical memory and the bus trait device models DMA through.
//!
//! Devices never touch guest RAM directly; they go through [`MemoryBus`] so a
//! machine integration can interpose (A20 masking, tracing, sparse backings)
//! without the device models knowing.

mod bus;

pub use bus::Bus;

/// Guest-physical memory as seen by a bus-mastering device.
///
/// Accesses that fall outside the populated range behave like open bus: reads
/// return all-ones, writes are dropped. DMA engines rely on this instead of
/// propagating errors for guest-programmed garbage addresses.
pub trait MemoryBus {
    fn read_physical(&self, addr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, addr: u64, data: &[u8]);

    fn read_u8(&self, addr: u64) -> u8 {
        let mut b = [0u8; 1];
        self.read_physical(addr, &mut b);
        b[0]
    }

    fn read_u16(&self, addr: u64) -> u16 {
        let mut b = [0u8; 2];
        self.read_physical(addr, &mut b);
        u16::from_le_bytes(b)
    }

    fn read_u32(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read_physical(addr, &mut b);
        u32::from_le_bytes(b)
    }

    fn write_u8(&mut self, addr: u64, value: u8) {
        self.write_physical(addr, &[value]);
    }

    fn write_u16(&mut self, addr: u64, value: u16) {
        self.write_physical(addr, &value.to_le_bytes());
    }

    fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_physical(addr, &value.to_le_bytes());
    }
}
