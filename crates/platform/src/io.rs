//! Port-mapped I/O dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::warn;

/// A device claiming a range of I/O ports.
pub trait IoPortHandler {
    fn io_read(&mut self, port: u16, size: usize) -> u32;
    fn io_write(&mut self, port: u16, size: usize, value: u32);
}

/// Dispatches guest `in`/`out` accesses to registered handlers.
///
/// Unclaimed ports behave like open bus: reads return all-ones for the
/// access width, writes are dropped.
#[derive(Default)]
pub struct IoPortBus {
    handlers: HashMap<u16, Rc<RefCell<dyn IoPortHandler>>>,
}

fn open_bus(size: usize) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `len` consecutive ports starting at `base`. A port can only
    /// have one owner; re-registration replaces the old one.
    pub fn register(&mut self, base: u16, len: u16, handler: Rc<RefCell<dyn IoPortHandler>>) {
        for port in base..base.saturating_add(len) {
            if self.handlers.insert(port, handler.clone()).is_some() {
                warn!(port = format_args!("{port:#x}"), "I/O port re-registered");
            }
        }
    }

    pub fn unregister(&mut self, base: u16, len: u16) {
        for port in base..base.saturating_add(len) {
            self.handlers.remove(&port);
        }
    }

    pub fn is_registered(&self, port: u16) -> bool {
        self.handlers.contains_key(&port)
    }

    pub fn read(&mut self, port: u16, size: usize) -> u32 {
        match self.handlers.get(&port) {
            Some(handler) => handler.borrow_mut().io_read(port, size) & open_bus(size),
            None => open_bus(size),
        }
    }

    pub fn write(&mut self, port: u16, size: usize, value: u32) {
        if let Some(handler) = self.handlers.get(&port) {
            handler.borrow_mut().io_write(port, size, value & open_bus(size));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch {
        last_write: Option<(u16, usize, u32)>,
        value: u32,
    }

    impl IoPortHandler for Scratch {
        fn io_read(&mut self, _port: u16, _size: usize) -> u32 {
            self.value
        }

        fn io_write(&mut self, port: u16, size: usize, value: u32) {
            self.last_write = Some((port, size, value));
        }
    }

    #[test]
    fn unclaimed_ports_are_open_bus() {
        let mut bus = IoPortBus::new();
        assert_eq!(bus.read(0x1F0, 1), 0xFF);
        assert_eq!(bus.read(0x1F0, 2), 0xFFFF);
        assert_eq!(bus.read(0x1F0, 4), 0xFFFF_FFFF);
        bus.write(0x1F0, 1, 0x42); // dropped
    }

    #[test]
    fn registered_range_dispatches_and_unregister_restores_open_bus() {
        let mut bus = IoPortBus::new();
        let dev = Rc::new(RefCell::new(Scratch { last_write: None, value: 0xAB12_34CD }));
        bus.register(0x1F0, 8, dev.clone());

        assert_eq!(bus.read(0x1F0, 1), 0xCD);
        assert_eq!(bus.read(0x1F7, 4), 0xAB12_34CD);
        assert_eq!(bus.read(0x1F8, 1), 0xFF);

        bus.write(0x1F3, 2, 0xDEAD_BEEF);
        assert_eq!(dev.borrow().last_write, Some((0x1F3, 2, 0xBEEF)));

        bus.unregister(0x1F0, 8);
        assert_eq!(bus.read(0x1F0, 2), 0xFFFF);
    }
}
