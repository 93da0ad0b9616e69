//! The PIIX3-style PCI function wrapping the IDE controller: configuration
//! space, legacy port registration, and the BAR4 bus-master block.

use std::cell::RefCell;
use std::rc::Rc;

use memory::MemoryBus;
use palacios_devices::irq::{IrqLine, NullIrqLine};
use palacios_devices::pci::profile::IDE_PIIX3;
use palacios_devices::pci::{PciBarDefinition, PciConfigSpace, PciDevice};
use palacios_io_snapshot::io::state::{IoSnapshot, SnapshotError};
use palacios_platform::io::{IoPortBus, IoPortHandler};

use crate::ide::IdeController;

/// Legacy command/control port blocks of one channel.
#[derive(Debug, Clone, Copy)]
pub struct IdePortBlock {
    pub cmd_base: u16,
    pub ctrl_base: u16,
}

pub const PRIMARY_PORTS: IdePortBlock = IdePortBlock { cmd_base: 0x1F0, ctrl_base: 0x3F6 };
pub const SECONDARY_PORTS: IdePortBlock = IdePortBlock { cmd_base: 0x170, ctrl_base: 0x376 };

const BUS_MASTER_PORTS: u16 = 16;

pub struct Piix3IdePciDevice {
    pub controller: IdeController,
    config: PciConfigSpace,
}

impl Default for Piix3IdePciDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Piix3IdePciDevice {
    pub const DEFAULT_BUS_MASTER_BASE: u16 = 0xC000;

    pub fn new() -> Self {
        Self::with_irq_lines(Box::new(NullIrqLine), Box::new(NullIrqLine))
    }

    /// Builds the function with the channel interrupt lines wired to the
    /// platform (IRQ 14/15 on a legacy setup).
    pub fn with_irq_lines(primary: Box<dyn IrqLine>, secondary: Box<dyn IrqLine>) -> Self {
        let mut config = PciConfigSpace::new(&IDE_PIIX3);
        config.define_bar(0, PciBarDefinition::Io { size: 8 }, u32::from(PRIMARY_PORTS.cmd_base));
        config.define_bar(1, PciBarDefinition::Io { size: 4 }, 0x3F4);
        config.define_bar(2, PciBarDefinition::Io { size: 8 }, u32::from(SECONDARY_PORTS.cmd_base));
        config.define_bar(3, PciBarDefinition::Io { size: 4 }, 0x374);
        config.define_bar(
            4,
            PciBarDefinition::Io { size: u32::from(BUS_MASTER_PORTS) },
            u32::from(Self::DEFAULT_BUS_MASTER_BASE),
        );

        Self {
            controller: IdeController::new(primary, secondary),
            config,
        }
    }

    pub fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    /// Current base of the 16-port bus-master block (BAR4).
    pub fn bus_master_base(&self) -> u16 {
        self.config
            .bar_base(4)
            .map(|base| base as u16)
            .unwrap_or(Self::DEFAULT_BUS_MASTER_BASE)
    }

    /// Runs armed bus-master transfers. Gated on the PCI bus-master enable
    /// bit, like the real function.
    pub fn tick(&mut self, mem: &mut dyn MemoryBus) {
        if self.config.bus_master_enabled() {
            self.controller.tick(mem);
        }
    }

    fn port_read(&mut self, port: u16, size: usize) -> u32 {
        if !self.config.io_enabled() {
            return u32::MAX;
        }
        let bm_base = self.bus_master_base();
        if (bm_base..bm_base + BUS_MASTER_PORTS).contains(&port) {
            self.controller.bm_read(port - bm_base, size)
        } else {
            self.controller.io_read(port, size)
        }
    }

    fn port_write(&mut self, port: u16, size: usize, value: u32) {
        if !self.config.io_enabled() {
            return;
        }
        let bm_base = self.bus_master_base();
        if (bm_base..bm_base + BUS_MASTER_PORTS).contains(&port) {
            self.controller.bm_write(port - bm_base, size, value);
        } else {
            self.controller.io_write(port, size, value);
        }
    }

    /* Snapshot */

    pub fn save_state(&self) -> IoSnapshot {
        let mut snap = IoSnapshot::new();
        snap.put_u16("piix3.command", self.config.command());
        self.controller.save_state_into(&mut snap);
        snap
    }

    pub fn load_state(&mut self, snap: &IoSnapshot) -> Result<(), SnapshotError> {
        snap.check_version()?;
        self.config.set_command(snap.get_u16("piix3.command")?);
        self.controller.load_state_from(snap)
    }
}

impl PciDevice for Piix3IdePciDevice {
    fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }
}

struct Piix3PortHandler(Rc<RefCell<Piix3IdePciDevice>>);

impl IoPortHandler for Piix3PortHandler {
    fn io_read(&mut self, port: u16, size: usize) -> u32 {
        self.0.borrow_mut().port_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: usize, value: u32) {
        self.0.borrow_mut().port_write(port, size, value);
    }
}

/// Wires both legacy channel blocks and the current BAR4 block onto the
/// port bus. Call again after reprogramming BAR4 to move the bus-master
/// window.
pub fn register_piix3_ide_ports(io: &mut IoPortBus, dev: Rc<RefCell<Piix3IdePciDevice>>) {
    let handler: Rc<RefCell<dyn IoPortHandler>> =
        Rc::new(RefCell::new(Piix3PortHandler(dev.clone())));

    io.register(PRIMARY_PORTS.cmd_base, 8, handler.clone());
    io.register(PRIMARY_PORTS.ctrl_base, 2, handler.clone());
    io.register(SECONDARY_PORTS.cmd_base, 8, handler.clone());
    io.register(SECONDARY_PORTS.ctrl_base, 2, handler.clone());

    let bm_base = dev.borrow().bus_master_base();
    io.register(bm_base, BUS_MASTER_PORTS, handler);
}
