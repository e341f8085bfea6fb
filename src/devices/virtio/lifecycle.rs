//! Device lifecycle: the virtio status byte state machine, feature
//! negotiation, and the `VirtioDeviceOps` vtable every device personality
//! implements. Modeled directly on the reference implementation's
//! `struct virtio_ops` (init_vq/exit_vq/notify_vq/get_host_features/...),
//! translated into a Rust trait object boundary.

use super::common::{
    STATUS_ACKNOWLEDGE, STATUS_CONFIG, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FAILED,
    STATUS_FEATURES_OK, STATUS_NEEDS_RESET, STATUS_START, STATUS_STOP,
};
use crate::boot::GuestMemory;

/// Tracks the status byte and enforces invariant 7 (status bits are only
/// ever added, never silently cleared, except by an explicit reset or the
/// NEEDS_RESET/FAILED recovery path) plus the synthetic internal
/// START/STOP/CONFIG bits that tell `notify_status` what just happened.
#[derive(Debug, Default)]
pub struct StatusMachine {
    bits: u32,
}

/// What a status write asked the device to do, beyond just recording bits.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// Guest wrote 0: tear everything down and return to the pre-init state.
    Reset,
    /// ACKNOWLEDGE|DRIVER -> DRIVER_OK transition completed: queues may
    /// start processing.
    Start,
    /// Ordinary bit was OR'd in; no lifecycle transition.
    None,
}

impl StatusMachine {
    pub fn bits(&self) -> u32 {
        self.bits & !(STATUS_START | STATUS_STOP | STATUS_CONFIG)
    }

    pub fn is_failed(&self) -> bool {
        self.bits & STATUS_FAILED != 0
    }

    pub fn needs_reset(&self) -> bool {
        self.bits & STATUS_NEEDS_RESET != 0
    }

    pub fn driver_ok(&self) -> bool {
        self.bits & STATUS_DRIVER_OK != 0
    }

    /// Apply a guest write to the status register, returning the synthetic
    /// event the transport should dispatch to `VirtioDeviceOps::notify_status`.
    pub fn write(&mut self, value: u32) -> StatusEvent {
        if value == 0 {
            self.bits = 0;
            return StatusEvent::Reset;
        }
        let was_driver_ok = self.driver_ok();
        // Status bits are monotone: only ORed in, never cleared by a guest
        // write (virtio 1.x 2.1). The driver must write 0 to go backwards.
        self.bits |= value;
        if !was_driver_ok && self.driver_ok() {
            return StatusEvent::Start;
        }
        StatusEvent::None
    }

    /// Device-internal transition into the unrecoverable-protocol-violation
    /// state: the next status byte the guest reads will have NEEDS_RESET
    /// set, and no further descriptor processing happens until the guest
    /// writes 0.
    pub fn set_needs_reset(&mut self) {
        self.bits |= STATUS_NEEDS_RESET;
    }

    /// Device-internal transition into the unrecoverable configuration/
    /// transport failure state.
    pub fn set_failed(&mut self) {
        self.bits |= STATUS_FAILED;
    }

    pub fn acknowledged(&self) -> bool {
        self.bits & STATUS_ACKNOWLEDGE != 0
    }

    pub fn driver_loaded(&self) -> bool {
        self.bits & STATUS_DRIVER != 0
    }

    pub fn features_ok(&self) -> bool {
        self.bits & STATUS_FEATURES_OK != 0
    }
}

/// Negotiates the 64-bit feature bitmap: device offers bits, driver acks a
/// subset, the effective feature set is the intersection.
#[derive(Debug, Default)]
pub struct FeatureNegotiation {
    pub host_features: u64,
    driver_ack: u64,
    sel: u32,
}

impl FeatureNegotiation {
    pub fn new(host_features: u64) -> Self {
        Self {
            host_features,
            driver_ack: 0,
            sel: 0,
        }
    }

    pub fn select(&mut self, sel: u32) {
        self.sel = sel;
    }

    pub fn read_host_word(&self) -> u32 {
        if self.sel == 0 {
            (self.host_features & 0xffff_ffff) as u32
        } else {
            (self.host_features >> 32) as u32
        }
    }

    pub fn write_driver_word(&mut self, value: u32) {
        if self.sel == 0 {
            self.driver_ack = (self.driver_ack & 0xffff_ffff_0000_0000) | value as u64;
        } else {
            self.driver_ack = (self.driver_ack & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
        }
    }

    /// The negotiated feature set: only bits the device offered AND the
    /// driver acknowledged take effect.
    pub fn negotiated(&self) -> u64 {
        self.host_features & self.driver_ack
    }

    /// Raw bits the driver has acked so far, independent of what the host
    /// offered. Used to detect a driver acking a bit the host never offered
    /// (invariant: must transition the device to FAILED, not silently drop
    /// the bit).
    pub fn driver_acked(&self) -> u64 {
        self.driver_ack
    }
}

/// The external collaborator every concrete device (block, network, ...)
/// implements. Mirrors the reference `struct virtio_ops` vtable: transport
/// code calls these, never touches ring state directly.
pub trait VirtioDeviceOps: Send {
    /// Virtio device-type ID (2 = block, 1 = net).
    fn device_id(&self) -> u32;

    /// Raw configuration space bytes at `offset`, zero-padded past the end.
    fn config_read(&self, offset: u64, data: &mut [u8]);
    /// Configuration space write (most devices ignore this; net uses it for
    /// nothing today but the hook exists for symmetry with the reference
    /// vtable).
    fn config_write(&mut self, offset: u64, data: &[u8]);

    fn host_features(&self) -> u64;
    /// Called once FEATURES_OK is set, with the intersection of host-offered
    /// and driver-acked bits. Devices use this to decide split vs. packed
    /// ring layout and to enable merged-rxbuf/event-idx behavior.
    fn set_negotiated_features(&mut self, features: u64);

    fn queue_count(&self) -> u16;
    /// Maximum size a given queue index may be configured to.
    fn max_queue_size(&self, idx: u16) -> u16;
    fn set_queue_size(&mut self, idx: u16, size: u16);
    fn set_queue_addr(&mut self, idx: u16, desc: u64, avail: u64, used: u64);

    /// Queue `idx` has just been marked ready (`ready = true`) with its
    /// final address/size, or is being torn down (`ready = false`) by a
    /// reset or explicit `QUEUE_READY` write of zero; start or stop any
    /// worker thread the device needs for it.
    fn set_queue_ready(&mut self, idx: u16, ready: bool, memory: &GuestMemory);
    fn queue_ready(&self, idx: u16) -> bool;

    /// The guest rang the doorbell for queue `idx`.
    fn notify_queue(&mut self, idx: u16);

    /// Bits set in the interrupt-status register (USED_BUFFER /
    /// CONFIG_CHANGE); the device is the source of truth since worker
    /// threads set these directly when they publish completions.
    fn interrupt_status(&self) -> u32;
    /// Guest acknowledged interrupt bits; clear them.
    fn interrupt_ack(&mut self, ack: u32);

    /// Status-machine event dispatch: `StatusEvent::Start` on DRIVER_OK,
    /// `StatusEvent::Reset` before queues are torn down. Devices use this to
    /// refresh derived configuration (e.g. blk capacity) and to start/stop
    /// backends that aren't per-queue (e.g. a TAP file descriptor).
    fn notify_status(&mut self, event: StatusEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_monotone_until_reset() {
        let mut s = StatusMachine::default();
        assert_eq!(s.write(STATUS_ACKNOWLEDGE), StatusEvent::None);
        assert_eq!(s.write(STATUS_ACKNOWLEDGE | STATUS_DRIVER), StatusEvent::None);
        assert!(s.acknowledged() && s.driver_loaded());
        assert_eq!(
            s.write(STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK),
            StatusEvent::Start
        );
        assert!(s.driver_ok());
        assert_eq!(s.write(0), StatusEvent::Reset);
        assert_eq!(s.bits(), 0);
    }

    #[test]
    fn needs_reset_is_sticky_until_guest_resets() {
        let mut s = StatusMachine::default();
        s.write(STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_DRIVER_OK);
        s.set_needs_reset();
        assert!(s.needs_reset());
        s.write(STATUS_ACKNOWLEDGE);
        assert!(s.needs_reset());
        s.write(0);
        assert!(!s.needs_reset());
    }

    #[test]
    fn feature_negotiation_is_intersection() {
        let mut f = FeatureNegotiation::new(0b1011);
        f.select(0);
        f.write_driver_word(0b1111);
        assert_eq!(f.negotiated(), 0b1011);

        let mut f2 = FeatureNegotiation::new(0b1011);
        f2.select(0);
        f2.write_driver_word(0b0001);
        assert_eq!(f2.negotiated(), 0b0001);
    }

    #[test]
    fn feature_words_select_high_and_low() {
        let mut f = FeatureNegotiation::new((1u64 << 33) | 1);
        f.select(1);
        assert_eq!(f.read_host_word(), 1 << 1);
        f.write_driver_word(1 << 1);
        f.select(0);
        f.write_driver_word(1);
        assert_eq!(f.negotiated(), (1u64 << 33) | 1);
    }
}
