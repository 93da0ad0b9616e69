use tracing::{debug, warn};

use palacios_io_snapshot::io::state::{IoSnapshot, SnapshotError};

use crate::regs::{self, DeliveryMode, DestinationFormat, IpiMessage, Lvt};
use crate::vcpu::{IrqAck, VcpuRunControl};

/// Outcome of raising a vector on an APIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The IRR bit was set and any ack hook installed.
    Raised,
    /// The bit was already pending; the raise collapses into it and the
    /// ack hook recorded on the first raise stays in place.
    Coalesced,
    /// The vector is disabled in the IER; the raise was dropped.
    Masked,
}

/// INIT/SIPI bring-up progress of the owning vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IpiState {
    Init,
    Sipi,
    Started,
}

impl IpiState {
    fn to_u8(self) -> u8 {
        match self {
            IpiState::Init => 0,
            IpiState::Sipi => 1,
            IpiState::Started => 2,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(IpiState::Init),
            1 => Some(IpiState::Sipi),
            2 => Some(IpiState::Started),
            _ => None,
        }
    }
}

/// Side effect a register write asks the surrounding set to perform once the
/// per-APIC lock has been released.
#[derive(Debug)]
pub(crate) enum WriteEffect {
    None,
    SendIpi(IpiMessage),
}

/// Architectural state of one vCPU's local APIC.
pub struct LocalApic {
    base_addr: u64,
    base_addr_msr: u64,

    id_reg: u32,
    ldr: u32,
    dfr: u32,
    spurious: u32,
    esr: u32,
    icr_lo: u32,
    icr_hi: u32,
    rem_rd: u32,

    lvt_timer: u32,
    lvt_thermal: u32,
    lvt_perf: u32,
    lvt_lint0: u32,
    lvt_lint1: u32,
    lvt_error: u32,
    ext_int_lvt: [u32; 4],

    tmr_div: u32,
    tmr_init_cnt: u32,
    tmr_cur_cnt: u32,
    missed_ints: u32,

    pub(crate) ipi_state: IpiState,

    irr: [u8; 32],
    isr: [u8; 32],
    ier: [u8; 32],
    tmr: [u8; 32],

    ack_handlers: [Option<Box<dyn IrqAck>>; 256],

    pub(crate) vcpu: Box<dyn VcpuRunControl>,
}

fn vector_bit(vector: u8) -> (usize, u8) {
    ((vector >> 3) as usize, 1 << (vector & 0x7))
}

fn bitmap_word(bitmap: &[u8; 32], index: usize) -> u32 {
    let base = index * 4;
    u32::from_le_bytes([
        bitmap[base],
        bitmap[base + 1],
        bitmap[base + 2],
        bitmap[base + 3],
    ])
}

fn set_bitmap_word(bitmap: &mut [u8; 32], index: usize, value: u32) {
    bitmap[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

impl LocalApic {
    pub fn new(index: u32, vcpu: Box<dyn VcpuRunControl>) -> Self {
        let mut msr = regs::APIC_DEFAULT_BASE | regs::MSR_ENABLE_BIT;
        if index == 0 {
            msr |= regs::MSR_BSP_BIT;
        }

        let mut apic = Self {
            base_addr: regs::APIC_DEFAULT_BASE,
            base_addr_msr: msr,
            id_reg: index << 24,
            ldr: 0,
            dfr: 0xFFFF_FFFF,
            spurious: 0x0000_00FF,
            esr: 0,
            icr_lo: 0,
            icr_hi: 0,
            rem_rd: 0,
            lvt_timer: Lvt::RESET,
            lvt_thermal: Lvt::RESET,
            lvt_perf: Lvt::RESET,
            lvt_lint0: Lvt::RESET,
            lvt_lint1: Lvt::RESET,
            lvt_error: Lvt::RESET,
            ext_int_lvt: [Lvt::RESET; 4],
            tmr_div: 0,
            tmr_init_cnt: 0,
            tmr_cur_cnt: 0,
            missed_ints: 0,
            ipi_state: IpiState::Init,
            irr: [0; 32],
            isr: [0; 32],
            ier: [0xFF; 32],
            tmr: [0; 32],
            ack_handlers: std::array::from_fn(|_| None),
            vcpu,
        };
        apic.vcpu.set_tpr(0);
        apic
    }

    pub fn apic_id(&self) -> u8 {
        (self.id_reg >> 24) as u8
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn base_addr_msr(&self) -> u64 {
        self.base_addr_msr
    }

    pub fn is_bsp(&self) -> bool {
        self.base_addr_msr & regs::MSR_BSP_BIT != 0
    }

    pub fn is_enabled(&self) -> bool {
        self.base_addr_msr & regs::MSR_ENABLE_BIT != 0
    }

    /// Applies an MSR 0x1B write and returns the new window base.
    pub(crate) fn write_msr(&mut self, value: u64) -> u64 {
        self.base_addr_msr = value;
        self.base_addr = value & !0xFFF;
        self.base_addr
    }

    pub fn ldr_byte(&self) -> u8 {
        (self.ldr >> 24) as u8
    }

    /// Logical-mode destination match per the DFR model. A broadcast MDA
    /// always matches; an invalid DFR model never does.
    pub fn matches_logical(&self, mda: u8) -> bool {
        if mda == 0xFF {
            return true;
        }
        let log_id = self.ldr_byte();
        match DestinationFormat::from_dfr(self.dfr) {
            DestinationFormat::Flat => log_id & mda != 0,
            DestinationFormat::Cluster => {
                (mda & 0xF0) == (log_id & 0xF0) && (mda & 0x0F) & (log_id & 0x0F) != 0
            }
            DestinationFormat::Invalid(model) => {
                warn!(
                    apic = self.apic_id(),
                    model, "invalid destination format model for logical delivery"
                );
                false
            }
        }
    }

    /* Priority logic */

    /// Highest requested-and-enabled vector, scanning from vector 255 down.
    pub fn highest_irr(&self) -> Option<u8> {
        for i in (0..32).rev() {
            let masked = self.irr[i] & self.ier[i];
            if masked != 0 {
                for j in (0..8).rev() {
                    if masked & (1 << j) != 0 {
                        return Some((i * 8 + j) as u8);
                    }
                }
            }
        }
        None
    }

    /// Highest in-service vector.
    pub fn highest_isr(&self) -> Option<u8> {
        for i in (0..32).rev() {
            if self.isr[i] != 0 {
                for j in (0..8).rev() {
                    if self.isr[i] & (1 << j) != 0 {
                        return Some((i * 8 + j) as u8);
                    }
                }
            }
        }
        None
    }

    pub fn tpr(&self) -> u32 {
        self.vcpu.tpr()
    }

    fn set_tpr(&mut self, value: u32) {
        self.vcpu.set_tpr(value);
    }

    pub fn ppr(&self) -> u32 {
        let tpr = self.tpr();
        let isrv = u32::from(self.highest_isr().unwrap_or(0));
        if ((tpr >> 4) & 0xF) >= ((isrv >> 4) & 0xF) {
            tpr
        } else {
            isrv & 0xF0
        }
    }

    pub fn apr(&self) -> u32 {
        let tpr = self.tpr();
        let isrv = u32::from(self.highest_isr().unwrap_or(0));
        let irrv = u32::from(self.highest_irr().unwrap_or(0));
        let (t, s, r) = ((tpr >> 4) & 0xF, (isrv >> 4) & 0xF, (irrv >> 4) & 0xF);
        if t >= s && t >= r {
            tpr
        } else if s >= r {
            isrv & 0xF0
        } else {
            irrv & 0xF0
        }
    }

    /// Raises `vector` into the IRR. Callers have already validated the
    /// vector range via the queue insertion path.
    pub fn activate_irq(
        &mut self,
        vector: u8,
        ack: Option<Box<dyn IrqAck>>,
    ) -> ActivationOutcome {
        let (major, flag) = vector_bit(vector);

        if self.ier[major] & flag == 0 {
            debug!(apic = self.apic_id(), vector, "vector disabled, dropping raise");
            return ActivationOutcome::Masked;
        }
        if self.irr[major] & flag != 0 {
            debug!(apic = self.apic_id(), vector, "vector already requested, coalescing");
            return ActivationOutcome::Coalesced;
        }

        self.irr[major] |= flag;
        self.ack_handlers[vector as usize] = ack;
        ActivationOutcome::Raised
    }

    /// True when a requested vector outranks both the in-service vector and
    /// the processor priority class. Queue draining has already happened.
    pub fn interrupt_pending(&self) -> bool {
        self.deliverable_vector().is_some()
    }

    pub fn deliverable_vector(&self) -> Option<u8> {
        let req = self.highest_irr()?;
        let svc = self.highest_isr().map_or(-1, i32::from);
        if i32::from(req) > svc && (req & 0xF0) as u32 > self.ppr() & 0xF0 {
            Some(req)
        } else {
            None
        }
    }

    /// The CPU is about to inject `vector`: move it from requested to
    /// in-service. Returns false (and does nothing) for a vector this APIC
    /// never raised.
    pub fn begin_irq(&mut self, vector: u8) -> bool {
        let (major, flag) = vector_bit(vector);
        if self.irr[major] & flag != 0 {
            self.isr[major] |= flag;
            self.irr[major] &= !flag;
            true
        } else {
            false
        }
    }

    /// Guest EOI: retire the highest in-service vector and fire its ack
    /// hook exactly once.
    pub fn end_of_interrupt(&mut self) {
        let Some(vector) = self.highest_isr() else {
            // Spurious EOI.
            return;
        };
        let (major, flag) = vector_bit(vector);
        self.isr[major] &= !flag;

        if let Some(mut ack) = self.ack_handlers[vector as usize].take() {
            ack.on_ack(vector);
        }
    }

    /* Timer */

    /// Advances the timer by `cycles` guest cycles.
    ///
    /// Injection goes through the timer LVT as a fixed self-interrupt; when
    /// `enqueue_missed` is set, periodic ticks that elapsed while an
    /// interrupt was already outstanding are replayed one per call.
    pub fn timer_tick(&mut self, cycles: u64, enqueue_missed: bool) {
        if self.tmr_init_cnt == 0 {
            return;
        }
        let lvt = Lvt(self.lvt_timer);
        if !lvt.periodic() && self.tmr_cur_cnt == 0 {
            return;
        }

        let ticks = cycles >> regs::timer_divide_shift(self.tmr_div);

        if ticks < u64::from(self.tmr_cur_cnt) {
            self.tmr_cur_cnt -= ticks as u32;
            if enqueue_missed && self.missed_ints > 0 && !self.interrupt_pending() {
                self.inject_timer_irq();
                self.missed_ints -= 1;
            }
        } else {
            let remainder = ticks - u64::from(self.tmr_cur_cnt);
            self.tmr_cur_cnt = 0;

            self.inject_timer_irq();

            if lvt.periodic() {
                let init = u64::from(self.tmr_init_cnt);
                self.missed_ints += (remainder / init) as u32;
                self.tmr_cur_cnt = (init - remainder % init) as u32;
            }
        }
    }

    fn inject_timer_irq(&mut self) {
        let lvt = Lvt(self.lvt_timer);
        if lvt.masked() {
            debug!(apic = self.apic_id(), "timer LVT masked, dropping tick");
            return;
        }
        if lvt.delivery_mode() != DeliveryMode::Fixed {
            warn!(
                apic = self.apic_id(),
                mode = ?lvt.delivery_mode(),
                "unsupported timer LVT delivery mode"
            );
            return;
        }
        self.activate_irq(lvt.vector(), None);
    }

    /* Register window */

    /// 32-bit value of the register at the aligned offset; sub-word reads
    /// are extracted by the caller-facing wrapper.
    fn register_value(&self, aligned: u32) -> u32 {
        match aligned {
            regs::REG_EOI => 0,
            regs::REG_ID => self.id_reg,
            regs::REG_VERSION => regs::APIC_VERSION_VALUE,
            regs::REG_TPR => self.tpr(),
            regs::REG_APR => self.apr(),
            regs::REG_PPR => self.ppr(),
            regs::REG_REMOTE_READ => self.rem_rd,
            regs::REG_LDR => self.ldr,
            regs::REG_DFR => self.dfr,
            regs::REG_SVR => self.spurious,
            regs::REG_ESR => self.esr,
            regs::REG_LVT_TIMER => self.lvt_timer,
            regs::REG_LVT_THERMAL => self.lvt_thermal,
            regs::REG_LVT_PERF => self.lvt_perf,
            regs::REG_LVT_LINT0 => self.lvt_lint0,
            regs::REG_LVT_LINT1 => self.lvt_lint1,
            regs::REG_LVT_ERROR => self.lvt_error,
            regs::REG_TIMER_ICR => self.tmr_init_cnt,
            regs::REG_TIMER_CCR => self.tmr_cur_cnt,
            regs::REG_TIMER_DCR => self.tmr_div,
            regs::REG_ICR_LOW => self.icr_lo,
            regs::REG_ICR_HIGH => self.icr_hi,
            regs::REG_EXT_FEATURE => regs::EXT_FEATURE_VALUE,
            o if (regs::REG_ISR_BASE..=regs::REG_ISR_BASE + 0x70).contains(&o)
                && o & 0xF == 0 =>
            {
                bitmap_word(&self.isr, ((o - regs::REG_ISR_BASE) >> 4) as usize)
            }
            o if (regs::REG_TMR_BASE..=regs::REG_TMR_BASE + 0x70).contains(&o)
                && o & 0xF == 0 =>
            {
                bitmap_word(&self.tmr, ((o - regs::REG_TMR_BASE) >> 4) as usize)
            }
            o if (regs::REG_IRR_BASE..=regs::REG_IRR_BASE + 0x70).contains(&o)
                && o & 0xF == 0 =>
            {
                bitmap_word(&self.irr, ((o - regs::REG_IRR_BASE) >> 4) as usize)
            }
            o if (regs::REG_IER_BASE..=regs::REG_IER_BASE + 0x70).contains(&o)
                && o & 0xF == 0 =>
            {
                bitmap_word(&self.ier, ((o - regs::REG_IER_BASE) >> 4) as usize)
            }
            o if (regs::REG_EXTINT_LVT_BASE..=regs::REG_EXTINT_LVT_BASE + 0x30).contains(&o)
                && o & 0xF == 0 =>
            {
                self.ext_int_lvt[((o - regs::REG_EXTINT_LVT_BASE) >> 4) as usize]
            }
            other => {
                debug!(
                    apic = self.apic_id(),
                    offset = format_args!("{other:#x}"),
                    "read from unhandled APIC register"
                );
                0
            }
        }
    }

    /// Guest read of `len` bytes at `offset` within the window.
    pub fn mmio_read(&self, offset: u32, len: usize) -> u32 {
        if !self.is_enabled() {
            warn!(apic = self.apic_id(), "read from disabled APIC window");
            return 0;
        }

        let value = self.register_value(offset & !0x3);
        let byte = offset & 0x3;
        match len {
            4 => value,
            2 if byte < 3 => (value >> (byte * 8)) & 0xFFFF,
            1 => (value >> (byte * 8)) & 0xFF,
            _ => {
                warn!(apic = self.apic_id(), offset, len, "invalid APIC read access");
                0
            }
        }
    }

    /// Guest 32-bit write at `offset`; narrower writes were rejected by the
    /// dispatch layer.
    pub(crate) fn mmio_write(&mut self, offset: u32, value: u32) -> WriteEffect {
        if !self.is_enabled() {
            warn!(apic = self.apic_id(), "write to disabled APIC window");
            return WriteEffect::None;
        }

        match offset {
            // Read-only and derived registers.
            regs::REG_VERSION
            | regs::REG_APR
            | regs::REG_PPR
            | regs::REG_REMOTE_READ
            | regs::REG_EXT_FEATURE
            | regs::REG_TIMER_CCR => {
                warn!(
                    apic = self.apic_id(),
                    offset = format_args!("{offset:#x}"),
                    "write to read-only APIC register ignored"
                );
            }
            o if (regs::REG_ISR_BASE..=regs::REG_ISR_BASE + 0x70).contains(&o)
                || (regs::REG_TMR_BASE..=regs::REG_TMR_BASE + 0x70).contains(&o)
                || (regs::REG_IRR_BASE..=regs::REG_IRR_BASE + 0x70).contains(&o) =>
            {
                warn!(
                    apic = self.apic_id(),
                    offset = format_args!("{offset:#x}"),
                    "write to read-only APIC bitmap ignored"
                );
            }

            regs::REG_ID => self.id_reg = value,
            regs::REG_TPR => self.set_tpr(value),
            regs::REG_LDR => self.ldr = value,
            regs::REG_DFR => self.dfr = value,
            regs::REG_SVR => self.spurious = value,
            regs::REG_ESR => self.esr = value,
            regs::REG_LVT_TIMER => self.lvt_timer = value,
            regs::REG_LVT_THERMAL => self.lvt_thermal = value,
            regs::REG_LVT_PERF => self.lvt_perf = value,
            regs::REG_LVT_LINT0 => self.lvt_lint0 = value,
            regs::REG_LVT_LINT1 => self.lvt_lint1 = value,
            regs::REG_LVT_ERROR => self.lvt_error = value,
            regs::REG_TIMER_ICR => {
                self.tmr_init_cnt = value;
                self.tmr_cur_cnt = value;
            }
            regs::REG_TIMER_DCR => self.tmr_div = value,
            regs::REG_EOI => self.end_of_interrupt(),
            regs::REG_ICR_HIGH => self.icr_hi = value,
            regs::REG_ICR_LOW => {
                self.icr_lo = value;
                return WriteEffect::SendIpi(IpiMessage::from_icr(self.icr_lo, self.icr_hi));
            }
            o if (regs::REG_IER_BASE..=regs::REG_IER_BASE + 0x70).contains(&o) && o & 0xF == 0 => {
                set_bitmap_word(&mut self.ier, ((o - regs::REG_IER_BASE) >> 4) as usize, value);
            }
            o if (regs::REG_EXTINT_LVT_BASE..=regs::REG_EXTINT_LVT_BASE + 0x30).contains(&o)
                && o & 0xF == 0 =>
            {
                self.ext_int_lvt[((o - regs::REG_EXTINT_LVT_BASE) >> 4) as usize] = value;
            }
            other => {
                warn!(
                    apic = self.apic_id(),
                    offset = format_args!("{other:#x}"),
                    "write to unhandled APIC register ignored"
                );
            }
        }

        WriteEffect::None
    }

    /* Snapshot */

    pub(crate) fn save_state(&self, snap: &mut IoSnapshot, prefix: &str) {
        snap.put_u64(&format!("{prefix}.base_addr"), self.base_addr);
        snap.put_u64(&format!("{prefix}.base_addr_msr"), self.base_addr_msr);
        snap.put_u32(&format!("{prefix}.id"), self.id_reg);
        snap.put_u32(&format!("{prefix}.ldr"), self.ldr);
        snap.put_u32(&format!("{prefix}.dfr"), self.dfr);
        snap.put_u32(&format!("{prefix}.svr"), self.spurious);
        snap.put_u32(&format!("{prefix}.esr"), self.esr);
        snap.put_u32(&format!("{prefix}.icr_lo"), self.icr_lo);
        snap.put_u32(&format!("{prefix}.icr_hi"), self.icr_hi);
        snap.put_u32(&format!("{prefix}.rem_rd"), self.rem_rd);
        snap.put_u32(&format!("{prefix}.tpr"), self.tpr());
        snap.put_u32(&format!("{prefix}.lvt_timer"), self.lvt_timer);
        snap.put_u32(&format!("{prefix}.lvt_thermal"), self.lvt_thermal);
        snap.put_u32(&format!("{prefix}.lvt_perf"), self.lvt_perf);
        snap.put_u32(&format!("{prefix}.lvt_lint0"), self.lvt_lint0);
        snap.put_u32(&format!("{prefix}.lvt_lint1"), self.lvt_lint1);
        snap.put_u32(&format!("{prefix}.lvt_error"), self.lvt_error);
        for (i, lvt) in self.ext_int_lvt.iter().enumerate() {
            snap.put_u32(&format!("{prefix}.ext_int_lvt{i}"), *lvt);
        }
        snap.put_u32(&format!("{prefix}.tmr_div"), self.tmr_div);
        snap.put_u32(&format!("{prefix}.tmr_init_cnt"), self.tmr_init_cnt);
        snap.put_u32(&format!("{prefix}.tmr_cur_cnt"), self.tmr_cur_cnt);
        snap.put_u32(&format!("{prefix}.missed_ints"), self.missed_ints);
        snap.put_u8(&format!("{prefix}.ipi_state"), self.ipi_state.to_u8());
        snap.put_bytes(&format!("{prefix}.irr"), &self.irr);
        snap.put_bytes(&format!("{prefix}.isr"), &self.isr);
        snap.put_bytes(&format!("{prefix}.ier"), &self.ier);
        snap.put_bytes(&format!("{prefix}.tmr"), &self.tmr);
    }

    pub(crate) fn load_state(
        &mut self,
        snap: &IoSnapshot,
        prefix: &str,
    ) -> Result<(), SnapshotError> {
        self.base_addr = snap.get_u64(&format!("{prefix}.base_addr"))?;
        self.base_addr_msr = snap.get_u64(&format!("{prefix}.base_addr_msr"))?;
        self.id_reg = snap.get_u32(&format!("{prefix}.id"))?;
        self.ldr = snap.get_u32(&format!("{prefix}.ldr"))?;
        self.dfr = snap.get_u32(&format!("{prefix}.dfr"))?;
        self.spurious = snap.get_u32(&format!("{prefix}.svr"))?;
        self.esr = snap.get_u32(&format!("{prefix}.esr"))?;
        self.icr_lo = snap.get_u32(&format!("{prefix}.icr_lo"))?;
        self.icr_hi = snap.get_u32(&format!("{prefix}.icr_hi"))?;
        self.rem_rd = snap.get_u32(&format!("{prefix}.rem_rd"))?;
        let tpr = snap.get_u32(&format!("{prefix}.tpr"))?;
        self.set_tpr(tpr);
        self.lvt_timer = snap.get_u32(&format!("{prefix}.lvt_timer"))?;
        self.lvt_thermal = snap.get_u32(&format!("{prefix}.lvt_thermal"))?;
        self.lvt_perf = snap.get_u32(&format!("{prefix}.lvt_perf"))?;
        self.lvt_lint0 = snap.get_u32(&format!("{prefix}.lvt_lint0"))?;
        self.lvt_lint1 = snap.get_u32(&format!("{prefix}.lvt_lint1"))?;
        self.lvt_error = snap.get_u32(&format!("{prefix}.lvt_error"))?;
        for i in 0..self.ext_int_lvt.len() {
            self.ext_int_lvt[i] = snap.get_u32(&format!("{prefix}.ext_int_lvt{i}"))?;
        }
        self.tmr_div = snap.get_u32(&format!("{prefix}.tmr_div"))?;
        self.tmr_init_cnt = snap.get_u32(&format!("{prefix}.tmr_init_cnt"))?;
        self.tmr_cur_cnt = snap.get_u32(&format!("{prefix}.tmr_cur_cnt"))?;
        self.missed_ints = snap.get_u32(&format!("{prefix}.missed_ints"))?;
        let raw_state = snap.get_u8(&format!("{prefix}.ipi_state"))?;
        self.ipi_state = IpiState::from_u8(raw_state).ok_or(SnapshotError::InvalidValue {
            key: format!("{prefix}.ipi_state"),
            value: u64::from(raw_state),
        })?;
        self.irr = snap.get_array(&format!("{prefix}.irr"))?;
        self.isr = snap.get_array(&format!("{prefix}.isr"))?;
        self.ier = snap.get_array(&format!("{prefix}.ier"))?;
        self.tmr = snap.get_array(&format!("{prefix}.tmr"))?;
        Ok(())
    }
}
