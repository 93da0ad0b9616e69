//! Per-vCPU local APIC emulation.
//!
//! One [`LocalApic`] record exists per vCPU; the [`LocalApicSet`] owns all of
//! them and routes inter-processor interrupts between them. The owning vCPU
//! drives its APIC through the set's MMIO/MSR entry points and the
//! pending/ack/EOI poll cycle; remote vCPUs only ever touch a peer through
//! its IRQ queue, which the owner drains at the top of the next poll.

mod lapic;
mod regs;
mod router;
mod vcpu;

pub use lapic::{ActivationOutcome, LocalApic};
pub use regs::{
    DeliveryMode, DestinationFormat, IpiMessage, Lvt, Shorthand, TriggerMode, APIC_DEFAULT_BASE,
    APIC_MMIO_LEN, MSR_BSP_BIT, MSR_ENABLE_BIT, REG_APR, REG_DFR, REG_EOI, REG_ESR,
    REG_EXT_FEATURE, REG_ICR_HIGH, REG_ICR_LOW, REG_ID, REG_IER_BASE, REG_IRR_BASE, REG_ISR_BASE,
    REG_LDR, REG_LVT_ERROR, REG_LVT_LINT0, REG_LVT_LINT1, REG_LVT_PERF, REG_LVT_THERMAL,
    REG_LVT_TIMER, REG_PPR, REG_SVR, REG_TIMER_CCR, REG_TIMER_DCR, REG_TIMER_ICR, REG_TMR_BASE,
    REG_TPR, REG_VERSION,
};
pub use router::{ApicRelocation, LocalApicSet};
pub use vcpu::{IrqAck, VcpuRunControl};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("no local APIC is registered for vCPU {0}")]
    NoSuchApic(usize),
    #[error("IPI addressed to unregistered APIC id {0}")]
    UnknownDestination(u8),
    #[error("delivery mode {0:?} is not implemented")]
    UnsupportedDeliveryMode(DeliveryMode),
    #[error("vector {0} is below the architectural minimum")]
    InvalidVector(u8),
    #[error("self-shorthand IPI has no source APIC")]
    SelfWithoutSource,
}

pub type Result<T> = std::result::Result<T, InterruptError>;
