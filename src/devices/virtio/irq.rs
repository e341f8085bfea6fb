//! Interrupt-signaling handle shared between a device's worker threads and
//! the transport that registered it. One `IrqLine` per device (virtio-mmio
//! multiplexes queue vs. config-change causes through `INTERRUPT_STATUS`,
//! not through distinct GSIs).

use crate::kvm::VmFd;
use std::sync::Arc;

#[derive(Clone)]
pub struct IrqLine {
    vm: Arc<VmFd>,
    gsi: u32,
}

impl IrqLine {
    pub fn new(vm: Arc<VmFd>, gsi: u32) -> Self {
        Self { vm, gsi }
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    /// Pulse the line. Worker threads call this after publishing to the
    /// used ring and finding `should_signal` true; it does not itself know
    /// about `INTERRUPT_STATUS` bookkeeping, that is the transport's job.
    pub fn pulse(&self) {
        if let Err(e) = self.vm.set_irq_line(self.gsi) {
            eprintln!("[virtio] failed to raise irq {}: {}", self.gsi, e);
        }
    }
}
