//! Virtqueue facade: dispatches between the split and packed ring engines
//! and owns the fixed per-queue request-context pool so device personalities
//! never index descriptor heads directly.

use super::descriptor::{resolve_chain, ChainError, ResolvedChain};
use super::endian::Endian;
use super::packed::PackedQueue;
use super::split::SplitQueue;
use crate::boot::GuestMemory;

enum Ring {
    Split(SplitQueue),
    Packed(PackedQueue),
}

/// One descriptor chain pulled off the ring, not yet completed.
pub struct PendingChain {
    pub head: u16,
    /// Packed rings need the ring slot the head occupied (distinct from the
    /// descriptor `id`) to write the used element back in place; split
    /// rings don't need this and it equals `head`.
    pub(crate) packed_head_index: u16,
    pub chain: ResolvedChain,
}

/// A virtqueue: split or packed, chosen once at queue-enable time from the
/// negotiated feature bits and fixed for the queue's lifetime.
pub struct Virtqueue {
    ring: Ring,
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
}

impl Virtqueue {
    pub fn new_split(endian: Endian) -> Self {
        Self {
            ring: Ring::Split(SplitQueue::new(endian)),
            size: 0,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
        }
    }

    pub fn new_packed(endian: Endian) -> Self {
        Self {
            ring: Ring::Packed(PackedQueue::new(endian)),
            size: 0,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.ring, Ring::Packed(_))
    }

    pub fn set_event_idx(&mut self, enabled: bool) {
        match &mut self.ring {
            Ring::Split(q) => q.use_event_idx = enabled,
            Ring::Packed(q) => q.use_event_idx = enabled,
        }
    }

    /// Commit the addresses/size written by the transport into the chosen
    /// ring engine. Must be called after `desc_table`/`avail_ring`/
    /// `used_ring`/`size` are set and before the queue is marked ready.
    pub fn activate(&mut self) {
        self.ready = true;
        match &mut self.ring {
            Ring::Split(q) => {
                q.size = self.size;
                q.desc_table = self.desc_table;
                q.avail_ring = self.avail_ring;
                q.used_ring = self.used_ring;
            }
            Ring::Packed(q) => {
                q.size = self.size;
                q.desc_ring = self.desc_table;
                q.driver_event_addr = self.avail_ring;
                q.device_event_addr = self.used_ring;
            }
        }
    }

    pub fn reset(&mut self) {
        self.ready = false;
        self.size = 0;
        self.desc_table = 0;
        self.avail_ring = 0;
        self.used_ring = 0;
        match &mut self.ring {
            Ring::Split(q) => q.reset(),
            Ring::Packed(q) => q.reset(),
        }
    }

    pub fn available(&self, memory: &GuestMemory) -> bool {
        if !self.ready {
            return false;
        }
        match &self.ring {
            Ring::Split(q) => q.available(memory),
            Ring::Packed(q) => q.available(memory),
        }
    }

    /// Pop the next chain and resolve its descriptors into host buffers.
    pub fn pop(&mut self, memory: &GuestMemory) -> Result<Option<PendingChain>, ChainError> {
        if !self.ready {
            return Ok(None);
        }
        let (head, packed_head_index, endian) = match &mut self.ring {
            Ring::Split(q) => match q.pop(memory) {
                Some(h) => (h, h, q.endian),
                None => return Ok(None),
            },
            Ring::Packed(q) => match q.pop(memory) {
                Some((id, idx)) => (id, idx, q.endian),
                None => return Ok(None),
            },
        };
        let chain = resolve_chain(memory, self.desc_table, self.size, endian, head)?;
        Ok(Some(PendingChain {
            head,
            packed_head_index,
            chain,
        }))
    }

    pub fn set_used(&mut self, memory: &GuestMemory, pending: &PendingChain, len: u32) -> Result<(), ()> {
        match &mut self.ring {
            Ring::Split(q) => q.set_used(memory, pending.head, len),
            Ring::Packed(q) => q.set_used(memory, pending.packed_head_index, len),
        }
    }

    pub fn set_notification(&mut self, memory: &GuestMemory, enable: bool) {
        match &mut self.ring {
            Ring::Split(q) => q.set_notification(memory, enable),
            Ring::Packed(q) => q.set_notification(memory, enable),
        }
    }

    pub fn should_signal(&mut self, memory: &GuestMemory) -> bool {
        match &mut self.ring {
            Ring::Split(q) => q.should_signal(memory),
            Ring::Packed(q) => q.should_signal(memory),
        }
    }
}

/// Fixed-capacity request-context pool keyed by descriptor head, matching
/// the reference implementation's array-of-requests-per-virtqueue approach
/// (no dynamic allocation on the hot path).
pub struct RequestPool<T> {
    slots: Vec<Option<T>>,
}

impl<T> RequestPool<T> {
    pub fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self { slots }
    }

    pub fn insert(&mut self, head: u16, value: T) {
        if let Some(slot) = self.slots.get_mut(head as usize) {
            *slot = Some(value);
        }
    }

    pub fn take(&mut self, head: u16) -> Option<T> {
        self.slots.get_mut(head as usize)?.take()
    }

    pub fn get_mut(&mut self, head: u16) -> Option<&mut T> {
        self.slots.get_mut(head as usize)?.as_mut()
    }

    pub fn in_use(&self, head: u16) -> bool {
        self.slots
            .get(head as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_facade_round_trip() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let mut vq = Virtqueue::new_split(Endian::Little);
        vq.size = 4;
        vq.desc_table = 0x1000;
        vq.avail_ring = 0x2000;
        vq.used_ring = 0x3000;
        vq.activate();

        // Write one descriptor chain: one writable buffer.
        let desc_addr = vq.desc_table;
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&0x9000u64.to_le_bytes());
        buf[8..12].copy_from_slice(&16u32.to_le_bytes());
        buf[12..14].copy_from_slice(&2u16.to_le_bytes()); // WRITE
        mem.write(desc_addr, &buf).unwrap();

        mem.write(vq.avail_ring + 4, &0u16.to_le_bytes()).unwrap();
        mem.write(vq.avail_ring + 2, &1u16.to_le_bytes()).unwrap();

        assert!(vq.available(&mem));
        let pending = vq.pop(&mem).unwrap().unwrap();
        assert_eq!(pending.chain.in_count, 1);
        vq.set_used(&mem, &pending, 16).unwrap();
        assert!(vq.should_signal(&mem));
    }

    #[test]
    fn request_pool_tracks_occupancy() {
        let mut pool: RequestPool<u32> = RequestPool::new(4);
        assert!(!pool.in_use(1));
        pool.insert(1, 42);
        assert!(pool.in_use(1));
        assert_eq!(pool.take(1), Some(42));
        assert!(!pool.in_use(1));
    }
}
