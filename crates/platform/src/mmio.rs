//! Memory-mapped I/O dispatch.
//!
//! The generic "hook a physical range" mechanism devices register their
//! windows with. Dispatch is per-vCPU because some windows (the local APIC's
//! 4 KiB page) decode to different state depending on which vCPU touches
//! them.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

/// A device claiming a physical address range.
pub trait MmioHandler {
    fn mmio_read(&mut self, vcpu: usize, gpa: u64, len: usize) -> u32;
    fn mmio_write(&mut self, vcpu: usize, gpa: u64, len: usize, value: u32);
}

struct MmioRegion {
    base: u64,
    len: u64,
    handler: Rc<RefCell<dyn MmioHandler>>,
}

/// Routes guest physical accesses that fall outside plain RAM.
///
/// Unclaimed addresses behave like open bus: reads return all-ones for the
/// access width, writes are dropped.
#[derive(Default)]
pub struct MmioRouter {
    regions: Vec<MmioRegion>,
}

fn open_bus(len: usize) -> u32 {
    match len {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

impl MmioRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks `[base, base + len)`. Overlapping an existing region replaces
    /// nothing; the older registration keeps winning until it is removed.
    pub fn register(&mut self, base: u64, len: u64, handler: Rc<RefCell<dyn MmioHandler>>) {
        if self.find(base).is_some() || len == 0 {
            warn!(base = format_args!("{base:#x}"), len, "overlapping MMIO registration ignored");
            return;
        }
        self.regions.push(MmioRegion { base, len, handler });
    }

    /// Removes the region starting at exactly `base`.
    pub fn unregister(&mut self, base: u64) {
        self.regions.retain(|region| region.base != base);
    }

    pub fn is_hooked(&self, gpa: u64) -> bool {
        self.find(gpa).is_some()
    }

    fn find(&self, gpa: u64) -> Option<&MmioRegion> {
        self.regions
            .iter()
            .find(|region| (region.base..region.base + region.len).contains(&gpa))
    }

    pub fn read(&self, vcpu: usize, gpa: u64, len: usize) -> u32 {
        match self.find(gpa) {
            Some(region) => region.handler.borrow_mut().mmio_read(vcpu, gpa, len) & open_bus(len),
            None => open_bus(len),
        }
    }

    pub fn write(&self, vcpu: usize, gpa: u64, len: usize, value: u32) {
        if let Some(region) = self.find(gpa) {
            region.handler.borrow_mut().mmio_write(vcpu, gpa, len, value & open_bus(len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Window {
        last: Option<(usize, u64, usize, u32)>,
    }

    impl MmioHandler for Window {
        fn mmio_read(&mut self, vcpu: usize, _gpa: u64, _len: usize) -> u32 {
            0xAA00_0000 | vcpu as u32
        }

        fn mmio_write(&mut self, vcpu: usize, gpa: u64, len: usize, value: u32) {
            self.last = Some((vcpu, gpa, len, value));
        }
    }

    #[test]
    fn unmapped_addresses_are_open_bus() {
        let router = MmioRouter::new();
        assert_eq!(router.read(0, 0xFEE0_0000, 4), 0xFFFF_FFFF);
        assert_eq!(router.read(0, 0xFEE0_0000, 1), 0xFF);
        router.write(0, 0xFEE0_0000, 4, 1); // dropped
    }

    #[test]
    fn registered_window_dispatches_with_the_accessing_vcpu() {
        let mut router = MmioRouter::new();
        let window = Rc::new(RefCell::new(Window::default()));
        router.register(0xFEE0_0000, 0x1000, window.clone());

        assert_eq!(router.read(2, 0xFEE0_0020, 4), 0xAA00_0002);
        router.write(1, 0xFEE0_00B0, 4, 0x1234);
        assert_eq!(window.borrow().last, Some((1, 0xFEE0_00B0, 4, 0x1234)));

        assert!(router.is_hooked(0xFEE0_0FFF));
        assert!(!router.is_hooked(0xFEE0_1000));
    }

    #[test]
    fn unregister_restores_open_bus() {
        let mut router = MmioRouter::new();
        let window = Rc::new(RefCell::new(Window::default()));
        router.register(0x8000_0000, 0x100, window);
        assert_ne!(router.read(0, 0x8000_0000, 4), 0xFFFF_FFFF);

        router.unregister(0x8000_0000);
        assert_eq!(router.read(0, 0x8000_0000, 4), 0xFFFF_FFFF);
    }
}
