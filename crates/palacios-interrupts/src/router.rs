use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use palacios_io_snapshot::io::state::{IoSnapshot, SnapshotError};

use crate::lapic::{IpiState, LocalApic, WriteEffect};
use crate::regs::{DeliveryMode, IpiMessage, Shorthand};
use crate::vcpu::{IrqAck, VcpuRunControl};
use crate::{InterruptError, Result};

/// Vectors 0–15 belong to exceptions and may never be raised as interrupts.
const FIRST_VALID_VECTOR: u8 = 16;

struct QueuedIrq {
    vector: u8,
    ack: Option<Box<dyn IrqAck>>,
}

/// One per-vCPU record: the APIC itself plus the producer-side IRQ queue.
///
/// Remote senders only ever take the queue lock; the owning vCPU drains the
/// queue into the APIC at the top of its poll, which establishes the
/// happens-before edge between "sent" and "observed".
struct ApicSlot {
    queue: Mutex<VecDeque<QueuedIrq>>,
    apic: Mutex<LocalApic>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of an APIC base-address MSR write: the glue must move the 4 KiB
/// MMIO hook from the old window to the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApicRelocation {
    pub old_base: u64,
    pub new_base: u64,
}

/// All local APICs of a VM plus the IPI routing fabric between them.
pub struct LocalApicSet {
    slots: Vec<ApicSlot>,
    vm_barrier: Arc<Mutex<()>>,
    enqueue_missed_timer_irqs: bool,
    strict_init_sipi: bool,
}

impl Default for LocalApicSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalApicSet {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            vm_barrier: Arc::new(Mutex::new(())),
            enqueue_missed_timer_irqs: false,
            strict_init_sipi: false,
        }
    }

    /// Registers the APIC for the next vCPU; vCPU 0 becomes the bootstrap
    /// processor. Returns the vCPU index.
    pub fn add_apic(&mut self, vcpu: Box<dyn VcpuRunControl>) -> usize {
        let index = self.slots.len();
        self.slots.push(ApicSlot {
            queue: Mutex::new(VecDeque::new()),
            apic: Mutex::new(LocalApic::new(index as u32, vcpu)),
        });
        index
    }

    pub fn num_apics(&self) -> usize {
        self.slots.len()
    }

    /// Replay of periodic timer ticks that elapsed while another interrupt
    /// was outstanding (off by default).
    pub fn set_enqueue_missed_timer_irqs(&mut self, enabled: bool) {
        self.enqueue_missed_timer_irqs = enabled;
    }

    /// Strict INIT-SIPI-SIPI sequencing: INIT only arms the target, the
    /// first startup IPI is swallowed, and the second one acts. Off by
    /// default, where the first startup IPI already starts the vCPU.
    pub fn set_strict_init_sipi(&mut self, enabled: bool) {
        self.strict_init_sipi = enabled;
    }

    /// The VM-wide barrier taken while INIT mutates a vCPU's run state.
    /// Integrations hold it across guest entry to serialize against that.
    pub fn vm_barrier(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.vm_barrier)
    }

    fn slot(&self, vcpu: usize) -> Result<&ApicSlot> {
        self.slots.get(vcpu).ok_or(InterruptError::NoSuchApic(vcpu))
    }

    /// Runs `f` against a vCPU's APIC record. Mostly useful to inspect
    /// register state in integrations and tests.
    pub fn with_apic<R>(&self, vcpu: usize, f: impl FnOnce(&LocalApic) -> R) -> Result<R> {
        Ok(f(&lock(&self.slot(vcpu)?.apic)))
    }

    pub fn base_addr(&self, vcpu: usize) -> Result<u64> {
        self.with_apic(vcpu, |apic| apic.base_addr())
    }

    /* Guest-facing windows */

    pub fn mmio_read(&self, vcpu: usize, offset: u32, len: usize) -> Result<u32> {
        Ok(lock(&self.slot(vcpu)?.apic).mmio_read(offset, len))
    }

    pub fn mmio_write(&self, vcpu: usize, offset: u32, value: u32) -> Result<()> {
        let effect = lock(&self.slot(vcpu)?.apic).mmio_write(offset, value);
        match effect {
            WriteEffect::None => Ok(()),
            // Route with the source lock dropped; delivery re-locks peers
            // (and the source, for self-addressed commands) one at a time.
            WriteEffect::SendIpi(msg) => self.route_ipi(Some(vcpu), &msg),
        }
    }

    pub fn read_msr(&self, vcpu: usize) -> Result<u64> {
        self.with_apic(vcpu, |apic| apic.base_addr_msr())
    }

    pub fn write_msr(&self, vcpu: usize, value: u64) -> Result<ApicRelocation> {
        let mut apic = lock(&self.slot(vcpu)?.apic);
        let old_base = apic.base_addr();
        let new_base = apic.write_msr(value);
        Ok(ApicRelocation { old_base, new_base })
    }

    /* Interrupt-controller surface (per owning vCPU) */

    /// Drains the IRQ queue, then reports whether a deliverable vector is
    /// waiting.
    pub fn pending(&self, vcpu: usize) -> Result<bool> {
        let slot = self.slot(vcpu)?;
        let mut apic = lock(&slot.apic);
        Self::drain_queue(slot, &mut apic);
        Ok(apic.interrupt_pending())
    }

    /// The vector `pending` reported; `None` when priority state moved on.
    pub fn get_vector(&self, vcpu: usize) -> Result<Option<u8>> {
        self.with_apic(vcpu, |apic| apic.deliverable_vector())
    }

    /// CPU is injecting `vector` now: move it from requested to in-service.
    /// Returns false when this APIC did not originate the vector.
    pub fn begin_irq(&self, vcpu: usize, vector: u8) -> Result<bool> {
        let mut apic = lock(&self.slot(vcpu)?.apic);
        Ok(apic.begin_irq(vector))
    }

    /// Guest EOI outside the MMIO path (tests, fast EOI MSR).
    pub fn end_of_interrupt(&self, vcpu: usize) -> Result<()> {
        let mut apic = lock(&self.slot(vcpu)?.apic);
        apic.end_of_interrupt();
        Ok(())
    }

    /// External injection of `vector` into a specific vCPU's APIC, with an
    /// optional EOI acknowledgement hook. Used by the platform fabric for
    /// line-based interrupts.
    pub fn raise_vector(
        &self,
        vcpu: usize,
        vector: u8,
        ack: Option<Box<dyn IrqAck>>,
    ) -> Result<()> {
        let slot = self.slot(vcpu)?;
        Self::queue_irq(slot, vector, ack)?;
        lock(&slot.apic).vcpu.kick();
        Ok(())
    }

    /// Timer driver: the owning vCPU advanced by `cpu_cycles` cycles.
    pub fn update_time(&self, vcpu: usize, cpu_cycles: u64, _cpu_freq: u64) -> Result<()> {
        let slot = self.slot(vcpu)?;
        let mut apic = lock(&slot.apic);
        // Drain first so the missed-tick gate sees accurate pending state.
        Self::drain_queue(slot, &mut apic);
        apic.timer_tick(cpu_cycles, self.enqueue_missed_timer_irqs);
        Ok(())
    }

    /* IPI routing */

    /// Routes a decoded interrupt command. `src` is the sending vCPU, or
    /// `None` for injections that do not originate from an APIC.
    pub fn send_ipi(&self, src: Option<usize>, msg: IpiMessage) -> Result<()> {
        self.route_ipi(src, &msg)
    }

    fn route_ipi(&self, src: Option<usize>, msg: &IpiMessage) -> Result<()> {
        debug!(?src, ?msg, "routing IPI");

        match msg.shorthand {
            Shorthand::None if !msg.logical => {
                let dst = self
                    .find_physical_apic(msg.dst)
                    .ok_or(InterruptError::UnknownDestination(msg.dst))?;
                self.deliver(src, dst, msg)
            }
            Shorthand::None => {
                if msg.mode == DeliveryMode::LowestPriority {
                    let Some(best) = self.lowest_priority_target(msg.dst) else {
                        debug!(mda = msg.dst, "lowest-priority IPI matched no APIC");
                        return Ok(());
                    };
                    self.deliver(src, best, msg)
                } else {
                    for dst in self.logical_targets(msg.dst) {
                        self.deliver(src, dst, msg)?;
                    }
                    Ok(())
                }
            }
            Shorthand::SelfOnly => {
                let src_idx = src.ok_or(InterruptError::SelfWithoutSource)?;
                self.deliver(src, src_idx, msg)
            }
            Shorthand::All => {
                for dst in 0..self.slots.len() {
                    self.deliver(src, dst, msg)?;
                }
                Ok(())
            }
            Shorthand::AllButSelf => {
                for dst in 0..self.slots.len() {
                    if Some(dst) != src {
                        self.deliver(src, dst, msg)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn find_physical_apic(&self, dst: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| lock(&slot.apic).apic_id() == dst)
    }

    fn logical_targets(&self, mda: u8) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| lock(&slot.apic).matches_logical(mda))
            .map(|(i, _)| i)
            .collect()
    }

    /// Among the logical matches, the APIC with the lowest arbitration
    /// priority class; ties keep the earliest index.
    fn lowest_priority_target(&self, mda: u8) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let apic = lock(&slot.apic);
            if !apic.matches_logical(mda) {
                continue;
            }
            let apr = apic.apr() & 0xF0;
            match best {
                Some((_, best_apr)) if apr >= best_apr => {}
                _ => best = Some((i, apr)),
            }
        }
        best.map(|(i, _)| i)
    }

    fn queue_irq(slot: &ApicSlot, vector: u8, ack: Option<Box<dyn IrqAck>>) -> Result<()> {
        if vector < FIRST_VALID_VECTOR {
            warn!(vector, "attempt to raise an invalid interrupt vector");
            return Err(InterruptError::InvalidVector(vector));
        }
        lock(&slot.queue).push_back(QueuedIrq { vector, ack });
        Ok(())
    }

    fn drain_queue(slot: &ApicSlot, apic: &mut LocalApic) {
        loop {
            let entry = lock(&slot.queue).pop_front();
            let Some(entry) = entry else { break };
            apic.activate_irq(entry.vector, entry.ack);
        }
    }

    fn deliver(&self, src: Option<usize>, dst: usize, msg: &IpiMessage) -> Result<()> {
        let slot = self.slot(dst)?;

        match msg.mode {
            DeliveryMode::Fixed | DeliveryMode::LowestPriority => {
                Self::queue_irq(slot, msg.vector, None)?;
                if src != Some(dst) {
                    // The victim may be in guest mode; force it out so it
                    // drains the queue on re-entry.
                    lock(&slot.apic).vcpu.kick();
                }
                Ok(())
            }
            DeliveryMode::Init => {
                let mut apic = lock(&slot.apic);
                if apic.is_bsp() {
                    warn!(dst, "INIT addressed to the bootstrap APIC, ignoring");
                    return Ok(());
                }
                if apic.ipi_state != IpiState::Init {
                    // Stop the target deterministically before touching its
                    // run state; integrations hold the same barrier across
                    // guest entry.
                    let _barrier = lock(&self.vm_barrier);
                    apic.vcpu.park();
                    apic.ipi_state = IpiState::Init;
                }
                if !self.strict_init_sipi {
                    // The target accepts the very next startup IPI.
                    apic.ipi_state = IpiState::Sipi;
                }
                Ok(())
            }
            DeliveryMode::Startup => {
                let mut apic = lock(&slot.apic);
                match apic.ipi_state {
                    IpiState::Sipi => {
                        apic.vcpu.start_up(msg.vector);
                        apic.ipi_state = IpiState::Started;
                    }
                    IpiState::Init if self.strict_init_sipi => {
                        debug!(dst, "first startup IPI arms the target");
                        apic.ipi_state = IpiState::Sipi;
                    }
                    state => {
                        debug!(dst, ?state, "startup IPI outside SIPI window, ignoring");
                    }
                }
                Ok(())
            }
            // The external PIC drives the line; nothing to do at the APIC.
            DeliveryMode::ExtInt => Ok(()),
            DeliveryMode::Smi | DeliveryMode::Nmi | DeliveryMode::Reserved => {
                warn!(dst, mode = ?msg.mode, "unsupported IPI delivery mode");
                Err(InterruptError::UnsupportedDeliveryMode(msg.mode))
            }
        }
    }

    /* Snapshot */

    pub fn save_state(&self) -> IoSnapshot {
        let mut snap = IoSnapshot::new();
        snap.put_u32("apic.count", self.slots.len() as u32);
        for (i, slot) in self.slots.iter().enumerate() {
            let mut apic = lock(&slot.apic);
            // Queued raises become IRR bits so the snapshot is self-contained.
            Self::drain_queue(slot, &mut apic);
            apic.save_state(&mut snap, &format!("apic{i}"));
        }
        snap
    }

    pub fn load_state(&self, snap: &IoSnapshot) -> std::result::Result<(), SnapshotError> {
        snap.check_version()?;
        let count = snap.get_u32("apic.count")?;
        if count as usize != self.slots.len() {
            return Err(SnapshotError::InvalidValue {
                key: "apic.count".to_owned(),
                value: u64::from(count),
            });
        }
        for (i, slot) in self.slots.iter().enumerate() {
            let mut apic = lock(&slot.apic);
            Self::drain_queue(slot, &mut apic);
            apic.load_state(snap, &format!("apic{i}"))?;
        }
        Ok(())
    }
}
