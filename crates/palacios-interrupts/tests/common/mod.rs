#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use palacios_interrupts::{LocalApicSet, VcpuRunControl};

/// Observable vCPU state for assertions.
#[derive(Debug, Default)]
pub struct VcpuState {
    pub tpr: u32,
    pub kicks: u32,
    pub parked: bool,
    pub start_pages: Vec<u8>,
}

/// Test vCPU: records every control action the APIC complex takes.
pub struct RecordingVcpu {
    state: Arc<Mutex<VcpuState>>,
}

impl VcpuRunControl for RecordingVcpu {
    fn tpr(&self) -> u32 {
        self.state.lock().unwrap().tpr
    }

    fn set_tpr(&mut self, value: u32) {
        self.state.lock().unwrap().tpr = value;
    }

    fn kick(&mut self) {
        self.state.lock().unwrap().kicks += 1;
    }

    fn park(&mut self) {
        self.state.lock().unwrap().parked = true;
    }

    fn start_up(&mut self, start_page: u8) {
        let mut state = self.state.lock().unwrap();
        state.parked = false;
        state.start_pages.push(start_page);
    }
}

/// A set with `n` APICs plus handles onto each vCPU's recorded state.
pub fn apic_set(n: usize) -> (LocalApicSet, Vec<Arc<Mutex<VcpuState>>>) {
    let mut set = LocalApicSet::new();
    let mut states = Vec::new();
    for _ in 0..n {
        let state = Arc::new(Mutex::new(VcpuState::default()));
        states.push(state.clone());
        set.add_apic(Box::new(RecordingVcpu { state }));
    }
    (set, states)
}
