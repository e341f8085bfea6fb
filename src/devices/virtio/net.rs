//! Virtio network device personality: up to [`MAX_QUEUE_PAIRS`] RX/TX
//! virtqueue pairs plus one control queue, each driven by its own
//! condvar-parked worker thread. Modeled directly on the reference
//! implementation's `net_dev`/`virtio_net_{rx,tx,ctrl}_thread` (see
//! `virtio/net.c` in the original source): a notify wakes the thread, which
//! then drains every available descriptor chain before going back to sleep,
//! and RX supports merged receive buffers (`VIRTIO_NET_F_MRG_RXBUF`) by
//! spanning a single packet across as many chains as it takes and patching
//! `num_buffers` into the first one.
//!
//! Optionally, once negotiation completes, [`set_vhost`] hands a queue pair's
//! data path straight to the kernel's `vhost_net` module (see [`super::vhost`])
//! instead of spawning RX/TX worker threads for it.

use super::common::{
    VIRTIO_F_ANY_LAYOUT, VIRTIO_F_INDIRECT_DESC, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_RING_PACKED,
    VIRTIO_F_VERSION_1,
};
use super::descriptor::ResolvedBuf;
use super::endian::Endian;
use super::irq::IrqLine;
use super::lifecycle::{StatusEvent, VirtioDeviceOps};
use super::queue::{PendingChain, Virtqueue};
use super::vhost::VhostNetHandle;
use crate::boot::GuestMemory;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

const VIRTIO_NET_DEVICE_ID: u32 = 1;
pub const QUEUE_SIZE: u16 = 256;
pub const MAX_QUEUE_PAIRS: u16 = 8;

const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
const VIRTIO_NET_F_MAC: u64 = 1 << 5;
const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;
const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;
const VIRTIO_NET_F_MQ: u64 = 1 << 22;

const VIRTIO_NET_S_LINK_UP: u16 = 1;

const VIRTIO_NET_CTRL_MQ: u8 = 4;
const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET: u16 = 0;
const VIRTIO_NET_OK: u8 = 0;
const VIRTIO_NET_ERR: u8 = 1;

/// Non-merged header is 10 bytes (no `num_buffers`); merged adds 2.
const HDR_LEN_PLAIN: usize = 10;
const HDR_LEN_MRG: usize = 12;
const NUM_BUFFERS_OFFSET: usize = 6;
const MAX_FRAME: usize = 65562;

const CONFIG_MAC: u64 = 0;
const CONFIG_STATUS: u64 = 6;
const CONFIG_MAX_VQ_PAIRS: u64 = 8;
const CONFIG_MTU: u64 = 10;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to open TAP device {name:?}: {source}")]
    TapOpen { name: String, source: io::Error },
    #[error("TAP ioctl failed: {0}")]
    TapIoctl(#[source] nix::errno::Errno),
}

/// Packet-level back-end: TAP device or an in-process loopback stand-in for
/// the user-mode TCP/IP stack this harness does not implement.
pub trait NetBackend: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    /// The file descriptor vhost-net should be handed as its backend, if
    /// this backend type supports kernel offload (TAP does, loopback doesn't).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

#[repr(C)]
struct IfReq {
    name: [u8; 16],
    flags: i16,
    _pad: [u8; 22],
}

const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const IFF_VNET_HDR: i16 = 0x4000;
const TUN_TYPE: u8 = b'T';

nix::ioctl_write_ptr!(tunsetiff, TUN_TYPE, 202, IfReq);
nix::ioctl_write_int!(tunsetoffload, TUN_TYPE, 208);
nix::ioctl_write_int!(tunsetvnethdrsz, TUN_TYPE, 216);

const TUN_F_CSUM: i32 = 0x01;
const TUN_F_TSO4: i32 = 0x02;
const TUN_F_TSO6: i32 = 0x04;
const TUN_F_UFO: i32 = 0x10;

pub struct TapBackend {
    file: std::fs::File,
}

impl TapBackend {
    pub fn open(name: &str) -> Result<Self, NetError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|source| NetError::TapOpen {
                name: name.to_string(),
                source,
            })?;

        let mut req = IfReq {
            name: [0u8; 16],
            flags: IFF_TAP | IFF_NO_PI | IFF_VNET_HDR,
            _pad: [0u8; 22],
        };
        let bytes = name.as_bytes();
        let n = bytes.len().min(15);
        req.name[..n].copy_from_slice(&bytes[..n]);

        unsafe { tunsetiff(file.as_raw_fd(), &req) }.map_err(NetError::TapIoctl)?;

        let offload = TUN_F_CSUM | TUN_F_TSO4 | TUN_F_TSO6 | TUN_F_UFO;
        if unsafe { tunsetoffload(file.as_raw_fd(), offload) }.is_err() {
            // Older kernels reject UFO; retry without it (mirrors the
            // reference implementation's fallback).
            let _ = unsafe { tunsetoffload(file.as_raw_fd(), offload & !TUN_F_UFO) };
        }
        unsafe { tunsetvnethdrsz(file.as_raw_fd(), HDR_LEN_MRG as i32) }
            .map_err(NetError::TapIoctl)?;

        Ok(Self { file })
    }
}

impl NetBackend for TapBackend {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        (&self.file).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        (&self.file).write(buf)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

/// Loopback stand-in: every sent frame is queued for the next `recv`. Useful
/// for exercising the ring plumbing without a configured TAP device; does not
/// implement a user-mode IP stack (out of scope for this harness).
#[derive(Default)]
pub struct LoopbackBackend {
    queue: Mutex<std::collections::VecDeque<Vec<u8>>>,
    cv: Condvar,
}

impl NetBackend for LoopbackBackend {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = self.queue.lock().unwrap();
        while q.is_empty() {
            q = self.cv.wait(q).unwrap();
        }
        let pkt = q.pop_front().unwrap();
        let n = pkt.len().min(buf.len());
        buf[..n].copy_from_slice(&pkt[..n]);
        Ok(n)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.queue.lock().unwrap().push_back(buf.to_vec());
        self.cv.notify_one();
        Ok(buf.len())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Rx(u16),
    Tx(u16),
    Ctrl,
}

struct QueueCellState {
    queue: Virtqueue,
    notified: bool,
    vhost_active: bool,
}

struct QueueCell {
    kind: QueueKind,
    state: Mutex<QueueCellState>,
    cv: Condvar,
}

impl QueueCell {
    fn new(kind: QueueKind, endian: Endian) -> Self {
        Self {
            kind,
            state: Mutex::new(QueueCellState {
                queue: Virtqueue::new_split(endian),
                notified: false,
                vhost_active: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn wait_for_notify(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.notified {
            state = self.cv.wait(state).unwrap();
        }
        state.notified = false;
    }

    fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.notified = true;
        self.cv.notify_one();
    }
}

/// Device-wide lifecycle/interrupt bookkeeping shared by every worker thread.
struct Shared {
    interrupt_status: u32,
    mrg_rxbuf: bool,
    active_queue_pairs: u16,
}

pub struct VirtioNet {
    backend: Arc<dyn NetBackend>,
    cells: Vec<Arc<QueueCell>>,
    shared: Arc<Mutex<Shared>>,
    irq: Option<IrqLine>,
    workers: Vec<Option<JoinHandle<()>>>,
    mac: [u8; 6],
    queue_pairs: u16,
    negotiated: u64,
    endian: Endian,
    vhost: Option<Arc<VhostNetHandle>>,
}

impl VirtioNet {
    pub fn new(backend: Arc<dyn NetBackend>, mac: [u8; 6], queue_pairs: u16) -> Self {
        let queue_pairs = queue_pairs.clamp(1, MAX_QUEUE_PAIRS);
        let endian = Endian::Little;
        let n_queues = 2 * queue_pairs + 1;
        let cells = (0..n_queues)
            .map(|idx| {
                let kind = if idx == 2 * queue_pairs {
                    QueueKind::Ctrl
                } else if idx % 2 == 0 {
                    QueueKind::Rx(idx / 2)
                } else {
                    QueueKind::Tx(idx / 2)
                };
                Arc::new(QueueCell::new(kind, endian))
            })
            .collect();
        let workers = (0..n_queues).map(|_| None).collect();
        Self {
            backend,
            cells,
            shared: Arc::new(Mutex::new(Shared {
                interrupt_status: 0,
                mrg_rxbuf: false,
                active_queue_pairs: 1,
            })),
            irq: None,
            workers,
            mac,
            queue_pairs,
            negotiated: 0,
            endian,
            vhost: None,
        }
    }

    pub fn set_irq(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    /// Enable vhost-net kernel offload for the first queue pair. Must be
    /// called before the guest drives FEATURES_OK (i.e. right after
    /// construction), since feature negotiation needs to intersect with
    /// what vhost itself reports.
    pub fn enable_vhost(&mut self, handle: VhostNetHandle) {
        self.vhost = Some(Arc::new(handle));
    }

    fn hdr_len(&self) -> usize {
        if self.shared.lock().unwrap().mrg_rxbuf {
            HDR_LEN_MRG
        } else {
            HDR_LEN_PLAIN
        }
    }

    fn spawn_worker(&mut self, idx: u16, memory: GuestMemory) {
        let cell = self.cells[idx as usize].clone();
        cell.state.lock().unwrap().queue.activate();

        if let Some(vhost) = &self.vhost {
            if matches!(cell.kind, QueueKind::Rx(0) | QueueKind::Tx(0)) {
                if let Err(e) = offload_to_vhost(vhost, &cell, idx, &self.backend, &memory) {
                    eprintln!("[virtio-net] vhost offload failed for queue {}: {}", idx, e);
                } else {
                    cell.state.lock().unwrap().vhost_active = true;
                    return;
                }
            }
        }

        let backend = self.backend.clone();
        let shared = self.shared.clone();
        let irq = self.irq.clone();
        let handle = std::thread::Builder::new()
            .name(format!("virtio-net-q{}", idx))
            .spawn(move || match cell.kind {
                QueueKind::Rx(_) => rx_worker(cell, memory, backend, shared, irq),
                QueueKind::Tx(_) => tx_worker(cell, memory, backend, shared, irq),
                QueueKind::Ctrl => ctrl_worker(cell, memory, shared, irq),
            })
            .expect("failed to spawn virtio-net worker thread");
        self.workers[idx as usize] = Some(handle);
    }
}

fn offload_to_vhost(
    vhost: &Arc<VhostNetHandle>,
    cell: &Arc<QueueCell>,
    idx: u16,
    backend: &Arc<dyn NetBackend>,
    memory: &GuestMemory,
) -> Result<(), String> {
    let tap_fd = backend.raw_fd().ok_or("backend has no raw fd to hand to vhost")?;
    let (size, desc, avail, used) = {
        let state = cell.state.lock().unwrap();
        // `Virtqueue` keeps these on itself post-`activate`; re-read via the
        // public fields rather than re-deriving them.
        (state.queue.size, state.queue.desc_table, state.queue.avail_ring, state.queue.used_ring)
    };
    vhost.set_owner().map_err(|e| e.to_string())?;
    vhost.set_mem_table(memory).map_err(|e| e.to_string())?;
    let vring_index = (idx % 2) as u32;
    vhost.set_vring_num(vring_index, size as u32).map_err(|e| e.to_string())?;
    vhost.set_vring_addr(vring_index, desc, avail, used).map_err(|e| e.to_string())?;
    vhost.set_vring_base(vring_index, 0).map_err(|e| e.to_string())?;
    vhost.set_backend(vring_index, tap_fd).map_err(|e| e.to_string())?;
    Ok(())
}

fn copy_stream_into_chains(
    memory: &GuestMemory,
    cell: &Arc<QueueCell>,
    stream: &[u8],
) -> Vec<(PendingChain, u32)> {
    let mut chains = Vec::new();
    let mut off = 0usize;
    loop {
        if off >= stream.len() {
            break;
        }
        let pending = {
            let mut state = cell.state.lock().unwrap();
            match state.queue.pop(memory) {
                Ok(Some(p)) => p,
                _ => break,
            }
        };
        let mut written = 0u32;
        for buf in pending.chain.in_bufs() {
            if off >= stream.len() {
                break;
            }
            let n = (buf.len as usize).min(stream.len() - off);
            unsafe {
                std::ptr::copy_nonoverlapping(stream[off..].as_ptr(), buf.ptr, n);
            }
            off += n;
            written += n as u32;
        }
        chains.push((pending, written));
    }
    chains
}

fn first_in_buf(pending: &PendingChain) -> Option<ResolvedBuf> {
    pending.chain.in_bufs().first().copied()
}

fn publish_and_maybe_signal(
    memory: &GuestMemory,
    cell: &Arc<QueueCell>,
    chains: &[(PendingChain, u32)],
) -> bool {
    let mut state = cell.state.lock().unwrap();
    for (pending, len) in chains {
        let _ = state.queue.set_used(memory, pending, *len);
    }
    state.queue.should_signal(memory)
}

fn raise_interrupt(shared: &Arc<Mutex<Shared>>, irq: &Option<IrqLine>, should_signal: bool) {
    if should_signal {
        shared.lock().unwrap().interrupt_status |= super::common::INTERRUPT_USED_BUFFER;
        if let Some(irq) = irq {
            irq.pulse();
        }
    }
}

fn rx_worker(
    cell: Arc<QueueCell>,
    memory: GuestMemory,
    backend: Arc<dyn NetBackend>,
    shared: Arc<Mutex<Shared>>,
    irq: Option<IrqLine>,
) {
    loop {
        cell.wait_for_notify();
        loop {
            let available = cell.state.lock().unwrap().queue.available(&memory);
            if !available {
                break;
            }
            let mrg = shared.lock().unwrap().mrg_rxbuf;
            let hdr_len = if mrg { HDR_LEN_MRG } else { HDR_LEN_PLAIN };
            let mut frame = vec![0u8; MAX_FRAME];
            let n = match backend.recv(&mut frame[hdr_len..]) {
                Ok(n) => n,
                Err(_) => break,
            };
            frame.truncate(hdr_len + n);

            let chains = copy_stream_into_chains(&memory, &cell, &frame);
            if chains.is_empty() {
                break;
            }
            if mrg {
                if let Some(first) = first_in_buf(&chains[0].0) {
                    let num_buffers = (chains.len() as u16).to_le_bytes();
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            num_buffers.as_ptr(),
                            first.ptr.add(NUM_BUFFERS_OFFSET),
                            2,
                        );
                    }
                }
            }
            let signal = publish_and_maybe_signal(&memory, &cell, &chains);
            raise_interrupt(&shared, &irq, signal);
        }
    }
}

fn tx_worker(
    cell: Arc<QueueCell>,
    memory: GuestMemory,
    backend: Arc<dyn NetBackend>,
    shared: Arc<Mutex<Shared>>,
    irq: Option<IrqLine>,
) {
    loop {
        cell.wait_for_notify();
        loop {
            let pending = {
                let mut state = cell.state.lock().unwrap();
                if !state.queue.available(&memory) {
                    break;
                }
                match state.queue.pop(&memory) {
                    Ok(Some(p)) => p,
                    _ => break,
                }
            };
            let hdr_len = if shared.lock().unwrap().mrg_rxbuf {
                HDR_LEN_MRG
            } else {
                HDR_LEN_PLAIN
            };
            let out_bufs = pending.chain.out_bufs();
            let mut payload = Vec::new();
            let mut skip = hdr_len;
            for buf in out_bufs {
                let len = buf.len as usize;
                let start = skip.min(len);
                skip = skip.saturating_sub(len);
                if start < len {
                    let slice = unsafe { std::slice::from_raw_parts(buf.ptr.add(start), len - start) };
                    payload.extend_from_slice(slice);
                }
            }
            let _ = backend.send(&payload);
            let signal = publish_and_maybe_signal(&memory, &cell, &[(pending, 0)]);
            raise_interrupt(&shared, &irq, signal);
        }
    }
}

fn ctrl_worker(
    cell: Arc<QueueCell>,
    memory: GuestMemory,
    shared: Arc<Mutex<Shared>>,
    irq: Option<IrqLine>,
) {
    loop {
        cell.wait_for_notify();
        loop {
            let pending = {
                let mut state = cell.state.lock().unwrap();
                if !state.queue.available(&memory) {
                    break;
                }
                match state.queue.pop(&memory) {
                    Ok(Some(p)) => p,
                    _ => break,
                }
            };
            let out_bufs = pending.chain.out_bufs();
            let mut header = [0u8; 2];
            if let Some(first) = out_bufs.first() {
                let n = (first.len as usize).min(2);
                unsafe {
                    std::ptr::copy_nonoverlapping(first.ptr, header.as_mut_ptr(), n);
                }
            }
            let class = header[0];
            let mut ack = VIRTIO_NET_ERR;
            if class == VIRTIO_NET_CTRL_MQ {
                if let Some(second) = out_bufs.get(1) {
                    let mut cmd = [0u8; 2];
                    let n = (second.len as usize).min(2);
                    unsafe {
                        std::ptr::copy_nonoverlapping(second.ptr, cmd.as_mut_ptr(), n);
                    }
                    if u16::from_le_bytes(cmd) == VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET {
                        ack = VIRTIO_NET_OK;
                    }
                }
            }
            let len = if let Some(in_buf) = pending.chain.in_bufs().first() {
                unsafe {
                    std::ptr::write(in_buf.ptr, ack);
                }
                1
            } else {
                0
            };
            let signal = publish_and_maybe_signal(&memory, &cell, &[(pending, len)]);
            raise_interrupt(&shared, &irq, signal);
        }
    }
}

impl VirtioDeviceOps for VirtioNet {
    fn device_id(&self) -> u32 {
        VIRTIO_NET_DEVICE_ID
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        let status = self.endian.from_host_u16(VIRTIO_NET_S_LINK_UP);
        let max_vq_pairs = self.endian.from_host_u16(self.queue_pairs);
        let mtu = self.endian.from_host_u16(1500);
        let mut config = [0u8; 12];
        config[CONFIG_MAC as usize..CONFIG_MAC as usize + 6].copy_from_slice(&self.mac);
        config[CONFIG_STATUS as usize..CONFIG_STATUS as usize + 2]
            .copy_from_slice(&status.to_ne_bytes());
        config[CONFIG_MAX_VQ_PAIRS as usize..CONFIG_MAX_VQ_PAIRS as usize + 2]
            .copy_from_slice(&max_vq_pairs.to_ne_bytes());
        config[CONFIG_MTU as usize..CONFIG_MTU as usize + 2].copy_from_slice(&mtu.to_ne_bytes());
        let start = offset as usize;
        if start >= config.len() {
            return;
        }
        let n = data.len().min(config.len() - start);
        data[..n].copy_from_slice(&config[start..start + n]);
    }

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    fn host_features(&self) -> u64 {
        let mut features = VIRTIO_NET_F_MAC
            | VIRTIO_NET_F_STATUS
            | VIRTIO_NET_F_MRG_RXBUF
            | VIRTIO_NET_F_CTRL_VQ
            | VIRTIO_F_RING_EVENT_IDX
            | VIRTIO_F_ANY_LAYOUT
            | VIRTIO_F_INDIRECT_DESC
            | VIRTIO_F_RING_PACKED
            | VIRTIO_F_VERSION_1;
        if self.queue_pairs > 1 {
            features |= VIRTIO_NET_F_MQ;
        }
        // Checksum/segmentation offload (CSUM, GUEST_TSO4/6, HOST_TSO4/6,
        // GUEST_UFO) require per-packet header rewriting this harness does
        // not implement; left unoffered rather than advertised-and-ignored.
        let _ = VIRTIO_NET_F_CSUM;
        if let Some(vhost) = &self.vhost {
            if let Ok(vhost_features) = vhost.get_features() {
                features &= vhost_features | VIRTIO_F_VERSION_1;
            }
        }
        features
    }

    fn set_negotiated_features(&mut self, features: u64) {
        self.negotiated = features;
        let is_packed = features & VIRTIO_F_RING_PACKED != 0;
        let use_event_idx = features & VIRTIO_F_RING_EVENT_IDX != 0;
        self.shared.lock().unwrap().mrg_rxbuf = features & VIRTIO_NET_F_MRG_RXBUF != 0;
        for cell in &self.cells {
            let mut state = cell.state.lock().unwrap();
            state.queue = if is_packed {
                Virtqueue::new_packed(self.endian)
            } else {
                Virtqueue::new_split(self.endian)
            };
            state.queue.set_event_idx(use_event_idx);
        }
        if let Some(vhost) = &self.vhost {
            let _ = vhost.set_features(features & !VIRTIO_F_RING_PACKED);
        }
    }

    fn queue_count(&self) -> u16 {
        self.cells.len() as u16
    }

    fn max_queue_size(&self, _idx: u16) -> u16 {
        QUEUE_SIZE
    }

    fn set_queue_size(&mut self, idx: u16, size: u16) {
        if let Some(cell) = self.cells.get(idx as usize) {
            cell.state.lock().unwrap().queue.size = size;
        }
    }

    fn set_queue_addr(&mut self, idx: u16, desc: u64, avail: u64, used: u64) {
        if let Some(cell) = self.cells.get(idx as usize) {
            let mut state = cell.state.lock().unwrap();
            state.queue.desc_table = desc;
            state.queue.avail_ring = avail;
            state.queue.used_ring = used;
        }
    }

    fn set_queue_ready(&mut self, idx: u16, ready: bool, memory: &GuestMemory) {
        if idx as usize >= self.cells.len() {
            return;
        }
        if ready {
            if self.workers[idx as usize].is_none() {
                self.spawn_worker(idx, memory.clone());
            }
        } else {
            self.workers[idx as usize] = None;
            self.cells[idx as usize].state.lock().unwrap().queue.reset();
        }
    }

    fn queue_ready(&self, idx: u16) -> bool {
        self.cells
            .get(idx as usize)
            .map(|c| c.state.lock().unwrap().queue.ready)
            .unwrap_or(false)
    }

    fn notify_queue(&mut self, idx: u16) {
        if let Some(cell) = self.cells.get(idx as usize) {
            cell.notify();
        }
    }

    fn interrupt_status(&self) -> u32 {
        self.shared.lock().unwrap().interrupt_status
    }

    fn interrupt_ack(&mut self, ack: u32) {
        self.shared.lock().unwrap().interrupt_status &= !ack;
    }

    fn notify_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Reset => {
                for (idx, cell) in self.cells.iter().enumerate() {
                    self.workers[idx] = None;
                    let mut state = cell.state.lock().unwrap();
                    if state.vhost_active {
                        if let Some(vhost) = &self.vhost {
                            let _ = vhost.detach_backend((idx as u32) % 2);
                        }
                        state.vhost_active = false;
                    }
                    state.queue.reset();
                }
                self.shared.lock().unwrap().active_queue_pairs = 1;
            }
            StatusEvent::Start | StatusEvent::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_features_offers_mq_only_above_one_pair() {
        let backend = Arc::new(LoopbackBackend::default());
        let single = VirtioNet::new(backend.clone(), [2, 0, 0, 0, 0, 1], 1);
        assert_eq!(single.host_features() & VIRTIO_NET_F_MQ, 0);

        let multi = VirtioNet::new(backend, [2, 0, 0, 0, 0, 1], 4);
        assert_ne!(multi.host_features() & VIRTIO_NET_F_MQ, 0);
    }

    #[test]
    fn config_read_reports_mac_and_status() {
        let backend = Arc::new(LoopbackBackend::default());
        let net = VirtioNet::new(backend, [2, 0, 0, 0, 0, 7], 1);
        let mut buf = [0u8; 6];
        net.config_read(0, &mut buf);
        assert_eq!(buf, [2, 0, 0, 0, 0, 7]);

        let mut status = [0u8; 2];
        net.config_read(CONFIG_STATUS, &mut status);
        assert_eq!(u16::from_le_bytes(status), VIRTIO_NET_S_LINK_UP);
    }

    #[test]
    fn loopback_backend_echoes_sent_frames() {
        let backend = LoopbackBackend::default();
        backend.send(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 16];
        let n = backend.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}
