//! Split virtqueue engine: the legacy/modern ring layout of descriptor table
//! + available ring + used ring, with `VIRTIO_F_RING_EVENT_IDX` notification
//! suppression.
//!
//! Guest and device race on distinct fields by design; correctness rests on
//! explicit acquire/release pairs around the shared `idx` counters rather
//! than a lock around the whole ring, mirroring how the virtio spec itself
//! reasons about this ring (and how rust-vmm's vm-virtio queue abstraction
//! implements it).

use super::common::{VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_USED_F_NO_NOTIFY};
use super::endian::Endian;
use crate::boot::GuestMemory;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

/// Avail ring layout: flags(2) + idx(2) + ring[size](2*size) + used_event(2).
/// Used ring layout: flags(2) + idx(2) + ring[size](8*size) + avail_event(2).
#[derive(Debug, Default)]
pub struct SplitQueue {
    pub size: u16,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    pub endian: Endian,
    pub use_event_idx: bool,
    last_avail_idx: Wrapping<u16>,
    last_used_idx: Wrapping<u16>,
    /// Number of used-ring entries published since the last `should_signal`
    /// check; reset to zero on every call, per the event-index algorithm.
    num_added: Wrapping<u16>,
}

impl SplitQueue {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            ..Default::default()
        }
    }

    fn avail_idx_addr(&self) -> u64 {
        self.avail_ring + 2
    }

    fn avail_ring_elem_addr(&self, slot: u16) -> u64 {
        self.avail_ring + 4 + slot as u64 * 2
    }

    fn used_event_addr(&self) -> u64 {
        // used_event occupies the two bytes following ring[size] in the
        // avail ring per virtio 1.x 2.6.7.
        self.avail_ring + 4 + self.size as u64 * 2
    }

    fn used_idx_addr(&self) -> u64 {
        self.used_ring + 2
    }

    fn used_ring_elem_addr(&self, slot: u16) -> u64 {
        self.used_ring + 4 + slot as u64 * 8
    }

    fn avail_event_addr(&self) -> u64 {
        self.used_ring + 4 + self.size as u64 * 8
    }

    fn avail_flags_addr(&self) -> u64 {
        self.avail_ring
    }

    fn used_flags_addr(&self) -> u64 {
        self.used_ring
    }

    /// True if the guest has published at least one more descriptor than we
    /// have consumed.
    pub fn available(&self, memory: &GuestMemory) -> bool {
        if self.size == 0 {
            return false;
        }
        let idx = match memory.load_u16(self.avail_idx_addr(), Ordering::Acquire) {
            Ok(v) => self.endian.to_host_u16(v),
            Err(_) => return false,
        };
        Wrapping(idx) != self.last_avail_idx
    }

    /// Consume the next available descriptor chain head, if any.
    pub fn pop(&mut self, memory: &GuestMemory) -> Option<u16> {
        if !self.available(memory) {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = self.last_avail_idx.0 % self.size;
        let raw = memory.load_u16(self.avail_ring_elem_addr(slot), Ordering::Relaxed).ok()?;
        let head = self.endian.to_host_u16(raw);
        self.last_avail_idx += Wrapping(1);
        Some(head)
    }

    /// Publish a completed chain: write the used-ring element then bump
    /// `used.idx` with a release barrier so the guest never observes a
    /// partially-written element (invariant 5: used-ring idx is monotone and
    /// every increment is backed by a fully-written element).
    pub fn set_used(&mut self, memory: &GuestMemory, head: u16, len: u32) -> Result<(), ()> {
        let slot = self.last_used_idx.0 % self.size;
        let elem_addr = self.used_ring_elem_addr(slot);
        let id_raw = self.endian.from_host_u32(head as u32);
        memory
            .write(elem_addr, &id_raw.to_ne_bytes())
            .map_err(|_| ())?;
        let len_raw = self.endian.from_host_u32(len);
        memory
            .write(elem_addr + 4, &len_raw.to_ne_bytes())
            .map_err(|_| ())?;

        self.last_used_idx += Wrapping(1);
        self.num_added += Wrapping(1);
        let idx_raw = self.endian.from_host_u16(self.last_used_idx.0);
        memory
            .store_u16(self.used_idx_addr(), idx_raw, Ordering::Release)
            .map_err(|_| ())
    }

    /// Enable or disable the used-buffer interrupt, choosing between the
    /// legacy `VIRTQ_USED_F_NO_NOTIFY`-free signalling and event-index based
    /// suppression depending on negotiated features.
    pub fn set_notification(&mut self, memory: &GuestMemory, enable: bool) {
        if self.use_event_idx {
            if enable {
                let raw = self.endian.from_host_u16(self.last_avail_idx.0);
                let _ = memory.store_u16(self.avail_event_addr(), raw, Ordering::Relaxed);
            }
            // Disabling with EVENT_IDX negotiated is a no-op: the guest only
            // consults avail_event, never used.flags, once negotiated.
            return;
        }
        let flags = if enable { 0 } else { VIRTQ_USED_F_NO_NOTIFY };
        let raw = self.endian.from_host_u16(flags);
        let _ = memory.store_u16(self.used_flags_addr(), raw, Ordering::Relaxed);
    }

    /// True if the guest currently has notifications enabled (legacy
    /// path only; EVENT_IDX guests are always re-armed via `should_signal`).
    pub fn notifications_enabled(&self, memory: &GuestMemory) -> bool {
        if self.use_event_idx {
            return true;
        }
        match memory.load_u16(self.avail_flags_addr(), Ordering::Relaxed) {
            Ok(v) => self.endian.to_host_u16(v) & VIRTQ_AVAIL_F_NO_INTERRUPT == 0,
            Err(_) => true,
        }
    }

    /// Decide whether an interrupt must be raised for the batch of
    /// completions published since the last call (P4: event-index signal
    /// suppression math).
    ///
    /// `used_idx - used_event - 1 < used_idx - old` where `old` is the used
    /// index before this batch, mirrors rust-vmm's vm-virtio queue
    /// `needs_notification` and the virtio spec's `vring_need_event` macro.
    pub fn should_signal(&mut self, memory: &GuestMemory) -> bool {
        if self.num_added.0 == 0 {
            return false;
        }
        if !self.use_event_idx {
            let enabled = self.notifications_enabled(memory);
            self.num_added = Wrapping(0);
            return enabled;
        }

        let old = self.last_used_idx - self.num_added;
        self.num_added = Wrapping(0);

        let raw = match memory.load_u16(self.used_event_addr(), Ordering::Acquire) {
            Ok(v) => v,
            Err(_) => return true,
        };
        let used_event = Wrapping(self.endian.to_host_u16(raw));
        fence(Ordering::SeqCst);

        (self.last_used_idx - used_event - Wrapping(1)) < (self.last_used_idx - old)
    }

    pub fn reset(&mut self) {
        self.last_avail_idx = Wrapping(0);
        self.last_used_idx = Wrapping(0);
        self.num_added = Wrapping(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(size: u16) -> (GuestMemory, SplitQueue) {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let mut q = SplitQueue::new(Endian::Little);
        q.size = size;
        q.desc_table = 0x1000;
        q.avail_ring = 0x2000;
        q.used_ring = 0x3000;
        (mem, q)
    }

    fn publish_avail(mem: &GuestMemory, q: &SplitQueue, slot: u16, head: u16, new_idx: u16) {
        mem.write(
            q.avail_ring + 4 + slot as u64 * 2,
            &head.to_le_bytes(),
        )
        .unwrap();
        mem.store_u16(q.avail_idx_addr(), new_idx, Ordering::Release)
            .unwrap();
    }

    #[test]
    fn pop_consumes_one_entry_at_a_time() {
        let (mem, mut q) = setup(4);
        publish_avail(&mem, &q, 0, 7, 1);
        assert!(q.available(&mem));
        assert_eq!(q.pop(&mem), Some(7));
        assert!(!q.available(&mem));
        assert_eq!(q.pop(&mem), None);
    }

    #[test]
    fn set_used_is_monotone_and_written_fully() {
        let (mem, mut q) = setup(4);
        q.set_used(&mem, 2, 512).unwrap();
        let idx = mem.load_u16(q.used_idx_addr(), Ordering::Acquire).unwrap();
        assert_eq!(idx, 1);
        let mut id_buf = [0u8; 4];
        mem.read(q.used_ring_elem_addr(0), &mut id_buf).unwrap();
        assert_eq!(u32::from_le_bytes(id_buf), 2);
        let mut len_buf = [0u8; 4];
        mem.read(q.used_ring_elem_addr(0) + 4, &mut len_buf).unwrap();
        assert_eq!(u32::from_le_bytes(len_buf), 512);
    }

    #[test]
    fn should_signal_without_event_idx_follows_no_notify_flag() {
        let (mem, mut q) = setup(4);
        q.set_used(&mem, 0, 10).unwrap();
        assert!(q.should_signal(&mem));

        q.set_notification(&mem, false);
        q.set_used(&mem, 1, 10).unwrap();
        assert!(!q.should_signal(&mem));
    }

    #[test]
    fn should_signal_with_event_idx_suppresses_when_guest_not_caught_up() {
        let (mem, mut q) = setup(8);
        q.use_event_idx = true;
        // Guest sets used_event far ahead; first completion should not signal.
        mem.store_u16(q.used_event_addr(), 5, Ordering::Relaxed)
            .unwrap();
        q.set_used(&mem, 0, 1).unwrap();
        assert!(!q.should_signal(&mem));

        // Catch used_idx up to the event threshold.
        for i in 1..5 {
            q.set_used(&mem, i, 1).unwrap();
        }
        assert!(q.should_signal(&mem));
    }

    #[test]
    fn reset_clears_cursors() {
        let (mem, mut q) = setup(4);
        publish_avail(&mem, &q, 0, 3, 1);
        q.pop(&mem);
        q.set_used(&mem, 3, 1).unwrap();
        q.reset();
        assert_eq!(q.last_avail_idx.0, 0);
        assert_eq!(q.last_used_idx.0, 0);
    }
}
