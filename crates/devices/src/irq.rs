//! Interrupt-line capability handed to devices.

use std::cell::RefCell;
use std::rc::Rc;

use palacios_platform::interrupts::PlatformInterrupts;

/// One interrupt line as a device sees it. Devices assert and deassert;
/// routing, trigger mode, and vector assignment live with the platform.
pub trait IrqLine {
    fn raise(&mut self);
    fn lower(&mut self);
}

/// A line wired into the platform interrupt fabric.
pub struct PlatformIrqLine {
    interrupts: Rc<RefCell<PlatformInterrupts>>,
    line: usize,
}

impl PlatformIrqLine {
    /// A legacy ISA line (0–15).
    pub fn isa(interrupts: Rc<RefCell<PlatformInterrupts>>, line: usize) -> Self {
        Self { interrupts, line }
    }

    pub fn line(&self) -> usize {
        self.line
    }
}

impl IrqLine for PlatformIrqLine {
    fn raise(&mut self) {
        self.interrupts.borrow_mut().raise_line(self.line);
    }

    fn lower(&mut self) {
        self.interrupts.borrow_mut().lower_line(self.line);
    }
}

/// A line wired to nothing; useful for bring-up and bench setups.
#[derive(Default)]
pub struct NullIrqLine;

impl IrqLine for NullIrqLine {
    fn raise(&mut self) {}
    fn lower(&mut self) {}
}
