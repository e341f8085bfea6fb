//! Generic virtio-mmio transport: maps guest register reads/writes onto a
//! `VirtioDeviceOps` implementation and the device lifecycle state machine.
//! Supports both the legacy (v1, single pfn per queue) and modern (v2,
//! explicit 64-bit addresses) register layouts, selected per instance so the
//! same device personality can be exposed either way.

use super::common::*;
use super::lifecycle::{FeatureNegotiation, StatusEvent, StatusMachine, VirtioDeviceOps};
use crate::boot::GuestMemory;
use crate::devices::mmio::MmioDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioVersion {
    Legacy,
    Modern,
}

/// Per-queue address bookkeeping the transport accumulates before handing a
/// fully-configured queue off to the device via `set_queue_addr`.
#[derive(Debug, Default)]
struct QueueAddr {
    size: u16,
    desc: u64,
    avail: u64,
    used: u64,
    // Legacy-only: single page-frame-number placement.
    pfn: u32,
}

pub struct MmioTransport<D: VirtioDeviceOps> {
    pub device: D,
    version: MmioVersion,
    status: StatusMachine,
    features: FeatureNegotiation,
    queue_sel: u32,
    queues: Vec<QueueAddr>,
    guest_page_size: u32,
    queue_align: u32,
    memory: GuestMemory,
}

impl<D: VirtioDeviceOps> MmioTransport<D> {
    pub fn new(device: D, memory: GuestMemory, version: MmioVersion) -> Self {
        let host_features = device.host_features();
        let queue_count = device.queue_count();
        Self {
            device,
            version,
            status: StatusMachine::default(),
            features: FeatureNegotiation::new(host_features),
            queue_sel: 0,
            queues: (0..queue_count).map(|_| QueueAddr::default()).collect(),
            guest_page_size: 4096,
            queue_align: 4096,
            memory,
        }
    }

    fn cur_queue(&mut self) -> Option<&mut QueueAddr> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    /// Legacy layout (virtio 1.x appendix A): desc table, then avail ring,
    /// then the used ring rounded up to the negotiated alignment.
    fn legacy_addrs(&self, size: u16, pfn: u32) -> (u64, u64, u64) {
        let base = pfn as u64 * self.guest_page_size as u64;
        let desc = base;
        let avail = desc + VIRTQ_DESC_SIZE * size as u64;
        let avail_end = avail + 4 + 2 * size as u64 + 2;
        let align = self.queue_align.max(1) as u64;
        let used = avail_end.div_ceil(align) * align;
        (desc, avail, used)
    }

    fn commit_legacy_queue(&mut self) {
        let idx = self.queue_sel as u16;
        let (size, pfn) = match self.queues.get(idx as usize) {
            Some(q) => (q.size, q.pfn),
            None => return,
        };
        if size == 0 {
            return;
        }
        let (desc, avail, used) = self.legacy_addrs(size, pfn);
        if let Some(q) = self.queues.get_mut(idx as usize) {
            q.desc = desc;
            q.avail = avail;
            q.used = used;
        }
        self.device.set_queue_size(idx, size);
        self.device.set_queue_addr(idx, desc, avail, used);
        self.device.set_queue_ready(idx, pfn != 0, &self.memory);
    }

    fn reset(&mut self) {
        for idx in 0..self.queues.len() as u16 {
            self.device.set_queue_ready(idx, false, &self.memory);
        }
        for q in &mut self.queues {
            *q = QueueAddr::default();
        }
        self.queue_sel = 0;
    }

    fn read_u32(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => match self.version {
                MmioVersion::Legacy => 1,
                MmioVersion::Modern => 2,
            },
            MMIO_DEVICE_ID => self.device.device_id(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => self.features.read_host_word(),
            MMIO_QUEUE_NUM_MAX => self
                .queues
                .get(self.queue_sel as usize)
                .map(|_| self.device.max_queue_size(self.queue_sel as u16))
                .unwrap_or(0) as u32,
            MMIO_QUEUE_PFN if self.version == MmioVersion::Legacy => self
                .queues
                .get(self.queue_sel as usize)
                .map(|q| q.pfn)
                .unwrap_or(0),
            MMIO_QUEUE_READY if self.version == MmioVersion::Modern => {
                self.device.queue_ready(self.queue_sel as u16) as u32
            }
            MMIO_INTERRUPT_STATUS => self.device.interrupt_status(),
            MMIO_STATUS => self.status.bits(),
            MMIO_CONFIG_GENERATION => 0,
            off if off >= MMIO_CONFIG => {
                let mut buf = [0u8; 4];
                self.device.config_read(off - MMIO_CONFIG, &mut buf);
                u32::from_le_bytes(buf)
            }
            _ => 0,
        }
    }

    fn write_u32(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.features.select(value),
            MMIO_DRIVER_FEATURES => self.features.write_driver_word(value),
            MMIO_DRIVER_FEATURES_SEL => self.features.select(value),
            MMIO_GUEST_PAGE_SIZE if self.version == MmioVersion::Legacy => {
                self.guest_page_size = value;
            }
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                let idx = self.queue_sel as u16;
                let max = self.device.max_queue_size(idx);
                let size = (value as u16).min(max.max(1));
                if let Some(q) = self.cur_queue() {
                    q.size = size;
                }
            }
            MMIO_QUEUE_ALIGN if self.version == MmioVersion::Legacy => {
                self.queue_align = value;
            }
            MMIO_QUEUE_PFN if self.version == MmioVersion::Legacy => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.pfn = value;
                }
                self.commit_legacy_queue();
            }
            MMIO_QUEUE_READY if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                let idx = self.queue_sel as u16;
                let ready = value != 0;
                if ready {
                    if let Some(q) = self.queues.get(idx as usize) {
                        let (size, desc, avail, used) = (q.size, q.desc, q.avail, q.used);
                        self.device.set_queue_size(idx, size);
                        self.device.set_queue_addr(idx, desc, avail, used);
                    }
                }
                self.device.set_queue_ready(idx, ready, &self.memory);
            }
            MMIO_QUEUE_NOTIFY => self.device.notify_queue(value as u16),
            MMIO_INTERRUPT_ACK => self.device.interrupt_ack(value),
            MMIO_STATUS => {
                let features_ok_before = self.status.features_ok();
                let event = self.status.write(value);
                match event {
                    StatusEvent::Reset => {
                        self.reset();
                        self.device.notify_status(StatusEvent::Reset);
                    }
                    StatusEvent::Start => {
                        self.device.notify_status(StatusEvent::Start);
                    }
                    StatusEvent::None => {
                        if !features_ok_before && self.status.features_ok() {
                            let host_features = self.features.host_features;
                            if self.features.driver_acked() & !host_features != 0 {
                                self.status.set_failed();
                            } else {
                                self.device.set_negotiated_features(self.features.negotiated());
                            }
                        }
                    }
                }
            }
            MMIO_QUEUE_DESC_LOW if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.desc = (q.desc & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DESC_HIGH if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.desc = (q.desc & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
                }
            }
            MMIO_QUEUE_DRIVER_LOW if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.avail = (q.avail & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DRIVER_HIGH if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.avail = (q.avail & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
                }
            }
            MMIO_QUEUE_DEVICE_LOW if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.used = (q.used & 0xffff_ffff_0000_0000) | value as u64;
                }
            }
            MMIO_QUEUE_DEVICE_HIGH if self.version == MmioVersion::Modern => {
                if self.status.is_failed() || self.status.needs_reset() {
                    return;
                }
                if let Some(q) = self.cur_queue() {
                    q.used = (q.used & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
                }
            }
            off if off >= MMIO_CONFIG => {
                self.device
                    .config_write(off - MMIO_CONFIG, &value.to_le_bytes());
            }
            _ => {}
        }
    }
}

const VIRTQ_DESC_SIZE: u64 = 16;

impl<D: VirtioDeviceOps> MmioDevice for MmioTransport<D> {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let aligned = offset & !0x3;
        let value = self.read_u32(aligned);
        let bytes = value.to_le_bytes();
        let start = (offset & 0x3) as usize;
        let len = data.len().min(4usize.saturating_sub(start));
        data[..len].copy_from_slice(&bytes[start..start + len]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if data.len() != 4 || offset & 0x3 != 0 {
            // Sub-word config-space writes are legal (e.g. a single byte
            // into the middle of a virtio-net MAC field); everything else
            // must be 4-byte aligned.
            if offset >= MMIO_CONFIG {
                self.device.config_write(offset - MMIO_CONFIG, data);
            }
            return;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_u32(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct StubDevice {
        features: u64,
        negotiated: Arc<Mutex<u64>>,
        queue_ready_calls: Arc<Mutex<Vec<(u16, bool)>>>,
        notified: Arc<Mutex<Vec<u16>>>,
    }

    impl VirtioDeviceOps for StubDevice {
        fn device_id(&self) -> u32 {
            2
        }
        fn config_read(&self, _offset: u64, data: &mut [u8]) {
            data.fill(0);
        }
        fn config_write(&mut self, _offset: u64, _data: &[u8]) {}
        fn host_features(&self) -> u64 {
            self.features
        }
        fn set_negotiated_features(&mut self, features: u64) {
            *self.negotiated.lock().unwrap() = features;
        }
        fn queue_count(&self) -> u16 {
            1
        }
        fn max_queue_size(&self, _idx: u16) -> u16 {
            128
        }
        fn set_queue_size(&mut self, _idx: u16, _size: u16) {}
        fn set_queue_addr(&mut self, _idx: u16, _desc: u64, _avail: u64, _used: u64) {}
        fn set_queue_ready(&mut self, idx: u16, ready: bool, _memory: &GuestMemory) {
            self.queue_ready_calls.lock().unwrap().push((idx, ready));
        }
        fn queue_ready(&self, _idx: u16) -> bool {
            false
        }
        fn notify_queue(&mut self, idx: u16) {
            self.notified.lock().unwrap().push(idx);
        }
        fn interrupt_status(&self) -> u32 {
            0
        }
        fn interrupt_ack(&mut self, _ack: u32) {}
        fn notify_status(&mut self, _event: StatusEvent) {}
    }

    #[test]
    fn modern_magic_and_version() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let dev = StubDevice {
            features: 1,
            negotiated: Arc::new(Mutex::new(0)),
            queue_ready_calls: Arc::new(Mutex::new(Vec::new())),
            notified: Arc::new(Mutex::new(Vec::new())),
        };
        let mut t = MmioTransport::new(dev, memory, MmioVersion::Modern);
        let mut buf = [0u8; 4];
        t.read(MMIO_MAGIC_VALUE, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), VIRTIO_MMIO_MAGIC);
        t.read(MMIO_VERSION, &mut buf);
        assert_eq!(u32::from_le_bytes(buf), 2);
    }

    #[test]
    fn status_write_zero_resets_queues() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dev = StubDevice {
            features: 0,
            negotiated: Arc::new(Mutex::new(0)),
            queue_ready_calls: calls.clone(),
            notified: Arc::new(Mutex::new(Vec::new())),
        };
        let mut t = MmioTransport::new(dev, memory, MmioVersion::Modern);
        t.write(MMIO_STATUS, &STATUS_ACKNOWLEDGE.to_le_bytes());
        t.write(MMIO_STATUS, &0u32.to_le_bytes());
        assert!(calls.lock().unwrap().iter().any(|(_, ready)| !ready));
    }

    #[test]
    fn notify_queue_forwards_index() {
        let memory = GuestMemory::new(1 << 20).unwrap();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let dev = StubDevice {
            features: 0,
            negotiated: Arc::new(Mutex::new(0)),
            queue_ready_calls: Arc::new(Mutex::new(Vec::new())),
            notified: notified.clone(),
        };
        let mut t = MmioTransport::new(dev, memory, MmioVersion::Modern);
        t.write(MMIO_QUEUE_SEL, &0u32.to_le_bytes());
        t.write(MMIO_QUEUE_NOTIFY, &0u32.to_le_bytes());
        assert_eq!(*notified.lock().unwrap(), vec![0]);
    }
}
