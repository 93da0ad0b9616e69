mod common;

use common::apic_set;
use palacios_interrupts::{
    APIC_DEFAULT_BASE, REG_ICR_HIGH, REG_ICR_LOW, REG_ID, REG_IRR_BASE, REG_LDR, REG_LVT_TIMER,
    REG_SVR, REG_TIMER_DCR, REG_TIMER_ICR, REG_TPR,
};

#[test]
fn msr_write_relocates_the_mmio_window() {
    let (set, _) = apic_set(1);

    let msr = set.read_msr(0).unwrap();
    assert_eq!(msr & !0xFFF, APIC_DEFAULT_BASE);
    assert_ne!(msr & (1 << 8), 0, "vCPU 0 is the bootstrap processor");
    assert_ne!(msr & (1 << 11), 0, "APIC enabled at reset");

    let relocation = set.write_msr(0, 0xFEC0_0000 | (1 << 11) | (1 << 8)).unwrap();
    assert_eq!(relocation.old_base, APIC_DEFAULT_BASE);
    assert_eq!(relocation.new_base, 0xFEC0_0000);
    assert_eq!(set.base_addr(0).unwrap(), 0xFEC0_0000);
}

#[test]
fn application_processors_reset_without_the_bsp_bit() {
    let (set, _) = apic_set(2);
    assert_ne!(set.read_msr(0).unwrap() & (1 << 8), 0);
    assert_eq!(set.read_msr(1).unwrap() & (1 << 8), 0);
    assert_eq!(set.mmio_read(1, REG_ID, 4).unwrap() >> 24, 1);
}

#[test]
fn snapshot_round_trips_registers_and_pending_state() {
    let (set, _) = apic_set(2);

    set.mmio_write(0, REG_TPR, 0x20).unwrap();
    set.mmio_write(0, REG_LDR, 0x04u32 << 24).unwrap();
    set.mmio_write(0, REG_SVR, 0x1FF).unwrap();
    set.mmio_write(1, REG_LVT_TIMER, 0x2_0040).unwrap();
    set.mmio_write(1, REG_TIMER_DCR, 3).unwrap();
    set.mmio_write(1, REG_TIMER_ICR, 500).unwrap();
    set.raise_vector(1, 0x77, None).unwrap();

    // An undrained queued raise must be folded into the snapshot.
    let snap = set.save_state();

    let (restored, states) = apic_set(2);
    restored.load_state(&snap).unwrap();

    assert_eq!(restored.mmio_read(0, REG_TPR, 4).unwrap(), 0x20);
    assert_eq!(states[0].lock().unwrap().tpr, 0x20);
    assert_eq!(restored.mmio_read(0, REG_LDR, 4).unwrap(), 0x04 << 24);
    assert_eq!(restored.mmio_read(0, REG_SVR, 4).unwrap(), 0x1FF);
    assert_eq!(restored.mmio_read(1, REG_LVT_TIMER, 4).unwrap(), 0x2_0040);
    assert_eq!(restored.mmio_read(1, REG_TIMER_ICR, 4).unwrap(), 500);

    // Vector 0x77 was queued pre-snapshot: IRR word 3, bit 23.
    assert_eq!(restored.mmio_read(1, REG_IRR_BASE + 0x30, 4).unwrap(), 1 << 23);
    assert!(restored.pending(1).unwrap());
    assert_eq!(restored.get_vector(1).unwrap(), Some(0x77));
}

#[test]
fn snapshot_with_mismatched_topology_is_rejected() {
    let (set, _) = apic_set(2);
    let snap = set.save_state();

    let (restored, _) = apic_set(3);
    assert!(restored.load_state(&snap).is_err());
}

#[test]
fn icr_registers_read_back_the_last_command() {
    let (set, _) = apic_set(2);

    set.mmio_write(0, REG_ICR_HIGH, 1 << 24).unwrap();
    set.mmio_write(0, REG_ICR_LOW, 0x4041).unwrap();

    assert_eq!(set.mmio_read(0, REG_ICR_HIGH, 4).unwrap(), 1 << 24);
    assert_eq!(set.mmio_read(0, REG_ICR_LOW, 4).unwrap(), 0x4041);
}
