//! The per-vCPU interrupt fabric facade.
//!
//! Devices assert numbered lines; the fabric turns line activity into vector
//! raises on the routed APIC, tracks level-triggered service state through
//! the EOI ack hook, and answers the CPU loop's pending/ack poll. Additional
//! interrupt controllers can register per vCPU and are consulted after the
//! local APIC.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use palacios_interrupts::{
    ApicRelocation, InterruptError, IpiMessage, IrqAck, LocalApicSet, VcpuRunControl,
    APIC_MMIO_LEN,
};

/// Number of platform interrupt lines.
pub const NUM_LINES: usize = 16;

/// Secondary interrupt controller consulted when the local APIC has nothing
/// deliverable. Registration order is priority order.
pub trait InterruptController {
    fn intr_pending(&mut self) -> bool;
    fn get_intr_number(&mut self) -> Option<u8>;
    /// The CPU is injecting `vector`; return true if this controller owns it.
    fn begin_irq(&mut self, vector: u8) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTrigger {
    Edge,
    Level,
}

/// Bookkeeping shared with the EOI ack hook of a level-triggered line.
#[derive(Debug, Default)]
struct LineBook {
    in_service: bool,
}

struct LineAck {
    book: Arc<Mutex<LineBook>>,
}

impl IrqAck for LineAck {
    fn on_ack(&mut self, _vector: u8) {
        lock(&self.book).in_service = false;
    }
}

struct IrqLineState {
    vector: u8,
    dst_vcpu: usize,
    trigger: LineTrigger,
    asserted: bool,
    book: Arc<Mutex<LineBook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PlatformInterrupts {
    apics: LocalApicSet,
    lines: Vec<IrqLineState>,
    controllers: Vec<Vec<Box<dyn InterruptController>>>,
}

impl Default for PlatformInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformInterrupts {
    pub fn new() -> Self {
        let lines = (0..NUM_LINES)
            .map(|line| IrqLineState {
                // Legacy identity route: line n lands on vector 0x20 + n at
                // the bootstrap APIC until remapped.
                vector: 0x20 + line as u8,
                dst_vcpu: 0,
                trigger: LineTrigger::Edge,
                asserted: false,
                book: Arc::new(Mutex::new(LineBook::default())),
            })
            .collect();

        Self {
            apics: LocalApicSet::new(),
            lines,
            controllers: Vec::new(),
        }
    }

    /// Adds the APIC for the next vCPU and returns its index.
    pub fn add_vcpu(&mut self, vcpu: Box<dyn VcpuRunControl>) -> usize {
        self.controllers.push(Vec::new());
        self.apics.add_apic(vcpu)
    }

    pub fn num_vcpus(&self) -> usize {
        self.apics.num_apics()
    }

    pub fn apics(&self) -> &LocalApicSet {
        &self.apics
    }

    pub fn apics_mut(&mut self) -> &mut LocalApicSet {
        &mut self.apics
    }

    /// Registers an additional controller for `vcpu`, consulted after the
    /// local APIC in registration order.
    pub fn register_controller(&mut self, vcpu: usize, controller: Box<dyn InterruptController>) {
        if vcpu < self.controllers.len() {
            self.controllers[vcpu].push(controller);
        } else {
            warn!(vcpu, "controller registered for unknown vCPU, dropping");
        }
    }

    /* Line fabric */

    /// Routes `line` to `vector` on `dst_vcpu` with the given trigger mode.
    pub fn set_line_route(&mut self, line: usize, dst_vcpu: usize, vector: u8, trigger: LineTrigger) {
        let Some(state) = self.lines.get_mut(line) else {
            warn!(line, "route for unknown interrupt line ignored");
            return;
        };
        state.vector = vector;
        state.dst_vcpu = dst_vcpu;
        state.trigger = trigger;
    }

    pub fn raise_line(&mut self, line: usize) {
        let Some(state) = self.lines.get_mut(line) else {
            warn!(line, "raise of unknown interrupt line ignored");
            return;
        };
        let was_asserted = state.asserted;
        state.asserted = true;

        if self.apics.num_apics() == 0 {
            return;
        }

        match state.trigger {
            LineTrigger::Edge => {
                if !was_asserted {
                    let _ = Self::inject_line(&self.apics, state);
                }
            }
            LineTrigger::Level => {
                if !lock(&state.book).in_service {
                    let _ = Self::inject_line(&self.apics, state);
                }
            }
        }
    }

    pub fn lower_line(&mut self, line: usize) {
        if let Some(state) = self.lines.get_mut(line) {
            state.asserted = false;
        } else {
            warn!(line, "lower of unknown interrupt line ignored");
        }
    }

    pub fn line_asserted(&self, line: usize) -> bool {
        self.lines.get(line).is_some_and(|state| state.asserted)
    }

    fn inject_line(
        apics: &LocalApicSet,
        state: &IrqLineState,
    ) -> Result<(), InterruptError> {
        let ack: Option<Box<dyn IrqAck>> = match state.trigger {
            LineTrigger::Edge => None,
            LineTrigger::Level => {
                lock(&state.book).in_service = true;
                Some(Box::new(LineAck { book: Arc::clone(&state.book) }))
            }
        };
        let result = apics.raise_vector(state.dst_vcpu, state.vector, ack);
        if let Err(ref err) = result {
            warn!(vector = state.vector, %err, "line injection failed");
        }
        result
    }

    /// Re-injects level lines that are still asserted after their EOI.
    fn poll_level_lines(&mut self) {
        if self.apics.num_apics() == 0 {
            return;
        }
        for state in &mut self.lines {
            if state.trigger == LineTrigger::Level
                && state.asserted
                && !lock(&state.book).in_service
            {
                let _ = Self::inject_line(&self.apics, state);
            }
        }
    }

    /* CPU-loop poll surface */

    /// The deliverable vector for `vcpu`, if any. Drains queued raises and
    /// re-injects outstanding level lines first.
    pub fn get_pending(&mut self, vcpu: usize) -> Option<u8> {
        self.poll_level_lines();

        match self.apics.pending(vcpu) {
            Ok(true) => {
                if let Ok(vector) = self.apics.get_vector(vcpu) {
                    return vector;
                }
                None
            }
            Ok(false) => {
                let controllers = self.controllers.get_mut(vcpu)?;
                let mut result = None;
                for c in controllers.iter_mut() {
                    if c.intr_pending() {
                        result = c.get_intr_number();
                        break;
                    }
                }
                result
            }
            Err(err) => {
                warn!(vcpu, %err, "pending poll against unknown vCPU");
                None
            }
        }
    }

    /// The CPU is injecting `vector` on `vcpu`: transition the owning
    /// controller's request to in-service.
    pub fn acknowledge(&mut self, vcpu: usize, vector: u8) {
        match self.apics.begin_irq(vcpu, vector) {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                warn!(vcpu, %err, "acknowledge against unknown vCPU");
                return;
            }
        }
        if let Some(controllers) = self.controllers.get_mut(vcpu) {
            for controller in controllers {
                if controller.begin_irq(vector) {
                    return;
                }
            }
        }
    }

    /* APIC window plumbing */

    /// True when `gpa` falls inside `vcpu`'s current APIC window.
    pub fn is_apic_mmio(&self, vcpu: usize, gpa: u64) -> bool {
        self.apics
            .base_addr(vcpu)
            .map(|base| (base..base + APIC_MMIO_LEN).contains(&gpa))
            .unwrap_or(false)
    }

    pub fn mmio_read(&self, vcpu: usize, gpa: u64, len: usize) -> u32 {
        match self.apics.base_addr(vcpu) {
            Ok(base) if (base..base + APIC_MMIO_LEN).contains(&gpa) => self
                .apics
                .mmio_read(vcpu, (gpa - base) as u32, len)
                .unwrap_or(0),
            _ => {
                warn!(vcpu, gpa, "APIC MMIO read outside the window");
                0
            }
        }
    }

    pub fn mmio_write(&mut self, vcpu: usize, gpa: u64, len: usize, value: u32) {
        if len != 4 {
            warn!(vcpu, gpa, len, "APIC window writes must be 32-bit, dropping");
            return;
        }
        match self.apics.base_addr(vcpu) {
            Ok(base) if (base..base + APIC_MMIO_LEN).contains(&gpa) => {
                if let Err(err) = self.apics.mmio_write(vcpu, (gpa - base) as u32, value) {
                    warn!(vcpu, gpa, %err, "APIC MMIO write failed");
                }
            }
            _ => warn!(vcpu, gpa, "APIC MMIO write outside the window"),
        }
    }

    pub fn read_apic_msr(&self, vcpu: usize) -> u64 {
        self.apics.read_msr(vcpu).unwrap_or(0)
    }

    /// Relocates the APIC window. The returned pair tells a paging-aware
    /// integration which region to unhook and which to hook; dispatch through
    /// this facade follows the new base immediately.
    pub fn write_apic_msr(&mut self, vcpu: usize, value: u64) -> Option<ApicRelocation> {
        match self.apics.write_msr(vcpu, value) {
            Ok(relocation) => Some(relocation),
            Err(err) => {
                warn!(vcpu, %err, "APIC MSR write failed");
                None
            }
        }
    }

    /* Pass-throughs */

    pub fn send_ipi(&self, src: Option<usize>, msg: IpiMessage) -> Result<(), InterruptError> {
        self.apics.send_ipi(src, msg)
    }

    pub fn update_time(&self, vcpu: usize, cpu_cycles: u64, cpu_freq: u64) {
        if let Err(err) = self.apics.update_time(vcpu, cpu_cycles, cpu_freq) {
            warn!(vcpu, %err, "timer update against unknown vCPU");
        }
    }
}

/// Adapter hooking the APIC windows onto an [`crate::mmio::MmioRouter`].
///
/// One region per window base; accesses carry the touching vCPU, and the
/// facade resolves them against that vCPU's current window. After an MSR
/// relocation the integration moves the hook to the returned new base.
pub struct ApicMmioWindow {
    interrupts: std::rc::Rc<std::cell::RefCell<PlatformInterrupts>>,
}

impl ApicMmioWindow {
    pub fn new(interrupts: std::rc::Rc<std::cell::RefCell<PlatformInterrupts>>) -> Self {
        Self { interrupts }
    }
}

impl crate::mmio::MmioHandler for ApicMmioWindow {
    fn mmio_read(&mut self, vcpu: usize, gpa: u64, len: usize) -> u32 {
        self.interrupts.borrow().mmio_read(vcpu, gpa, len)
    }

    fn mmio_write(&mut self, vcpu: usize, gpa: u64, len: usize, value: u32) {
        self.interrupts.borrow_mut().mmio_write(vcpu, gpa, len, value);
    }
}
