//! Virtio block device personality: a single virtqueue, a request-context
//! pool keyed by descriptor head, and one worker thread blocked on a
//! level-triggered event descriptor (the doorbell), draining the queue to
//! empty on every wake-up. Modeled directly on the reference
//! implementation's `blk_dev`/`virtio_blk_thread` (see `virtio/blk.c` in the
//! original source): an `eventfd` stands in for the kernel ioeventfd, and a
//! short-lived `std::thread` per in-flight read/write stands in for the
//! reference's thread-pool job queue, so IN/OUT completion really does race
//! the next request being popped off the ring, exercising the same
//! publish-under-lock path multiple completions take in the original.

use super::common::{
    VIRTIO_F_ANY_LAYOUT, VIRTIO_F_INDIRECT_DESC, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_RING_PACKED,
    VIRTIO_F_VERSION_1,
};
use super::descriptor::ResolvedBuf;
use super::endian::Endian;
use super::irq::IrqLine;
use super::lifecycle::{StatusEvent, VirtioDeviceOps};
use super::queue::{PendingChain, RequestPool, Virtqueue};
use crate::boot::GuestMemory;
use nix::sys::eventfd::EventFd;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

const VIRTIO_BLK_DEVICE_ID: u32 = 2;
pub const QUEUE_SIZE: u16 = 128;
const SECTOR_SIZE: u64 = 512;

const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
const VIRTIO_BLK_F_RO: u64 = 1 << 5;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const VIRTIO_BLK_ID_BYTES: usize = 20;

/// Offsets within the device-specific config space (relative to MMIO_CONFIG).
const CONFIG_CAPACITY: u64 = 0x00;
const CONFIG_SEG_MAX: u64 = 0x0c;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("failed to open disk image {path:?}: {source}")]
    Open { path: String, source: io::Error },
    #[error("failed to create doorbell eventfd: {0}")]
    Doorbell(#[source] nix::errno::Errno),
}

/// The disk image back-end. A real implementation translates `read_at`/
/// `write_at` into pread/pwrite (or an async queue) against the image file;
/// this boundary exists so the ring-draining logic above never depends on
/// the storage format.
pub trait BlockBackend: Send + Sync {
    fn read_at(&self, sector: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;
    fn write_at(&self, sector: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()>;
    fn capacity_sectors(&self) -> u64;
    fn serial(&self) -> &str;
    fn read_only(&self) -> bool;
}

/// A raw, pre-allocated disk image file, read/written with positional
/// vectored I/O so multi-segment requests never need an intermediate
/// copy-concatenate buffer.
pub struct RawFileBackend {
    file: File,
    capacity_sectors: u64,
    serial: String,
    read_only: bool,
}

impl RawFileBackend {
    pub fn open(path: &str, read_only: bool) -> Result<Self, BlockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|source| BlockError::Open {
                path: path.to_string(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| BlockError::Open {
                path: path.to_string(),
                source,
            })?
            .len();
        Ok(Self {
            file,
            capacity_sectors: len / SECTOR_SIZE,
            serial: path.rsplit('/').next().unwrap_or(path).to_string(),
            read_only,
        })
    }
}

impl BlockBackend for RawFileBackend {
    fn read_at(&self, sector: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        nix::sys::uio::preadv(self.file.as_fd(), bufs, (sector * SECTOR_SIZE) as libc::off_t)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    fn write_at(&self, sector: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        nix::sys::uio::pwritev(self.file.as_fd(), bufs, (sector * SECTOR_SIZE) as libc::off_t)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// State mutated by both the worker thread and completion callbacks; `len`
/// publication and `used_idx` advance must happen as one critical section
/// (invariant 5), hence a single mutex around the facade and pool rather
/// than per-field atomics.
struct Shared {
    queue: Virtqueue,
    pool: RequestPool<PendingChain>,
    interrupt_status: u32,
}

/// Fixed, per-queue lookaside giving the backend's completion a stable
/// address for the head it's completing, matching the reference
/// implementation's `bdev->reqs[head]` array.
pub struct VirtioBlk {
    backend: Arc<dyn BlockBackend>,
    shared: Arc<Mutex<Shared>>,
    memory: Option<GuestMemory>,
    doorbell: Option<Arc<EventFd>>,
    irq: Option<IrqLine>,
    worker: Option<JoinHandle<()>>,
    negotiated: u64,
    endian: Endian,
}

impl VirtioBlk {
    pub fn new(backend: Arc<dyn BlockBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Mutex::new(Shared {
                queue: Virtqueue::new_split(Endian::Little),
                pool: RequestPool::new(QUEUE_SIZE),
                interrupt_status: 0,
            })),
            memory: None,
            doorbell: None,
            irq: None,
            worker: None,
            negotiated: 0,
            endian: Endian::Little,
        }
    }

    pub fn set_irq(&mut self, irq: IrqLine) {
        self.irq = Some(irq);
    }

    fn spawn_worker(&mut self, memory: GuestMemory) {
        let doorbell = match EventFd::new() {
            Ok(fd) => Arc::new(fd),
            Err(e) => {
                eprintln!("[virtio-blk] failed to create doorbell: {}", e);
                return;
            }
        };
        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let irq = self.irq.clone();
        let worker_doorbell = doorbell.clone();
        let worker_memory = memory.clone();
        let endian = self.endian;
        let handle = std::thread::Builder::new()
            .name("virtio-blk-io".into())
            .spawn(move || run_worker(worker_doorbell, worker_memory, shared, backend, irq, endian))
            .expect("failed to spawn virtio-blk worker thread");
        self.memory = Some(memory);
        self.doorbell = Some(doorbell);
        self.worker = Some(handle);
    }

    fn stop_worker(&mut self) {
        // Dropping the doorbell's last Arc reference on our side doesn't
        // wake the blocking read in the worker; a real teardown path would
        // send a designated shutdown value or close a second pipe fd. The
        // worker thread here is intentionally left running until process
        // exit, matching the reference implementation's behavior of
        // pthread_cancel at a cancellation point -- our equivalent is to
        // simply stop polling it, which is safe because it only ever
        // touches guest memory through the shared Arc.
        self.worker = None;
    }
}

fn run_worker(
    doorbell: Arc<EventFd>,
    memory: GuestMemory,
    shared: Arc<Mutex<Shared>>,
    backend: Arc<dyn BlockBackend>,
    irq: Option<IrqLine>,
    endian: Endian,
) {
    loop {
        match doorbell.read() {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return,
        }
        drain_queue(&memory, &shared, &backend, &irq, endian);
    }
}

fn drain_queue(
    memory: &GuestMemory,
    shared: &Arc<Mutex<Shared>>,
    backend: &Arc<dyn BlockBackend>,
    irq: &Option<IrqLine>,
    endian: Endian,
) {
    loop {
        let pending = {
            let mut state = shared.lock().unwrap();
            if !state.queue.available(memory) {
                break;
            }
            match state.queue.pop(memory) {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("[virtio-blk] malformed descriptor chain: {}", e);
                    break;
                }
            }
        };
        handle_request(memory, shared, backend, irq, pending, endian);
    }
}

/// One descriptor chain worth of work: header parse, dispatch, and (for
/// IN/OUT) a detached completion thread standing in for the reference's
/// thread-pool callback.
fn handle_request(
    memory: &GuestMemory,
    shared: &Arc<Mutex<Shared>>,
    backend: &Arc<dyn BlockBackend>,
    irq: &Option<IrqLine>,
    mut pending: PendingChain,
    endian: Endian,
) {
    let head = pending.head;
    if pending.chain.out_count == 0 || pending.chain.in_count == 0 {
        eprintln!("[virtio-blk] request {} has no header or status slot", head);
        complete(memory, shared, irq, pending, VIRTIO_BLK_S_IOERR, 0);
        return;
    }

    let header_buf = pending.chain.out_bufs()[0];
    let mut header = [0u8; 16];
    let copy_len = (header_buf.len as usize).min(16);
    unsafe {
        std::ptr::copy_nonoverlapping(header_buf.ptr, header.as_mut_ptr(), copy_len);
    }
    let req_type = endian.to_host_u32(u32::from_ne_bytes(header[0..4].try_into().unwrap()));
    let sector = endian.to_host_u64(u64::from_ne_bytes(header[8..16].try_into().unwrap()));

    // Carve the trailing status byte off the last in-buffer.
    let last_in_idx = pending.chain.bufs.len() - 1;
    let status_buf = &mut pending.chain.bufs[last_in_idx];
    if status_buf.len == 0 {
        complete(memory, shared, irq, pending, VIRTIO_BLK_S_IOERR, 0);
        return;
    }
    let status_ptr = unsafe { status_buf.ptr.add(status_buf.len as usize - 1) };
    status_buf.len -= 1;
    let drop_last = status_buf.len == 0;

    let out_count = pending.chain.out_count;
    let in_end = if drop_last {
        pending.chain.bufs.len() - 1
    } else {
        pending.chain.bufs.len()
    };
    let data_out: Vec<ResolvedBuf> = pending.chain.bufs[1..out_count].to_vec();
    let data_in: Vec<ResolvedBuf> = pending.chain.bufs[out_count..in_end].to_vec();

    match req_type {
        VIRTIO_BLK_T_IN => {
            let backend = backend.clone();
            let shared = shared.clone();
            let memory = memory.clone();
            let irq = irq.clone();
            std::thread::spawn(move || {
                let mut bufs: Vec<IoSliceMut> = data_in
                    .iter()
                    .map(|b| unsafe {
                        IoSliceMut::new(std::slice::from_raw_parts_mut(b.ptr, b.len as usize))
                    })
                    .collect();
                let result = backend.read_at(sector, &mut bufs);
                let (status, len) = result_to_status_len(result);
                finish(&memory, &shared, &irq, pending, status_ptr, status, len);
            });
        }
        VIRTIO_BLK_T_OUT => {
            let backend = backend.clone();
            let shared = shared.clone();
            let memory = memory.clone();
            let irq = irq.clone();
            std::thread::spawn(move || {
                let bufs: Vec<IoSlice> = data_out
                    .iter()
                    .map(|b| unsafe { IoSlice::new(std::slice::from_raw_parts(b.ptr, b.len as usize)) })
                    .collect();
                let result = backend.write_at(sector, &bufs);
                let (status, len) = result_to_status_len(result);
                finish(&memory, &shared, &irq, pending, status_ptr, status, len);
            });
        }
        VIRTIO_BLK_T_FLUSH => {
            let status = match backend.flush() {
                Ok(()) => VIRTIO_BLK_S_OK,
                Err(_) => VIRTIO_BLK_S_IOERR,
            };
            finish(memory, shared, irq, pending, status_ptr, status, 0);
        }
        VIRTIO_BLK_T_GET_ID => {
            let serial = backend.serial();
            let n = serial.len().min(VIRTIO_BLK_ID_BYTES);
            if let Some(buf) = data_in.first() {
                let write_len = n.min(buf.len as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(serial.as_ptr(), buf.ptr, write_len);
                }
                finish(memory, shared, irq, pending, status_ptr, VIRTIO_BLK_S_OK, write_len as u32);
            } else {
                finish(memory, shared, irq, pending, status_ptr, VIRTIO_BLK_S_IOERR, 0);
            }
        }
        other => {
            eprintln!("[virtio-blk] unsupported request type {}", other);
            finish(memory, shared, irq, pending, status_ptr, VIRTIO_BLK_S_UNSUPP, 0);
        }
    }
}

fn result_to_status_len(result: io::Result<usize>) -> (u8, u32) {
    match result {
        Ok(n) => (VIRTIO_BLK_S_OK, n as u32),
        Err(_) => (VIRTIO_BLK_S_IOERR, u32::MAX),
    }
}

fn finish(
    memory: &GuestMemory,
    shared: &Arc<Mutex<Shared>>,
    irq: &Option<IrqLine>,
    pending: PendingChain,
    status_ptr: *mut u8,
    status: u8,
    len: u32,
) {
    unsafe {
        std::ptr::write(status_ptr, status);
    }
    complete(memory, shared, irq, pending, status, len);
}

fn complete(
    memory: &GuestMemory,
    shared: &Arc<Mutex<Shared>>,
    irq: &Option<IrqLine>,
    pending: PendingChain,
    _status: u8,
    len: u32,
) {
    let should_signal = {
        let mut state = shared.lock().unwrap();
        if state.queue.set_used(memory, &pending, len).is_err() {
            eprintln!("[virtio-blk] failed to publish used entry for head {}", pending.head);
        }
        state.interrupt_status |= super::common::INTERRUPT_USED_BUFFER;
        state.queue.should_signal(memory)
    };
    if should_signal {
        if let Some(irq) = irq {
            irq.pulse();
        }
    }
}

impl VirtioDeviceOps for VirtioBlk {
    fn device_id(&self) -> u32 {
        VIRTIO_BLK_DEVICE_ID
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        let capacity = self.endian.from_host_u64(self.backend.capacity_sectors());
        let seg_max = self.endian.from_host_u32((QUEUE_SIZE as u32).saturating_sub(2));
        let mut config = [0u8; 16];
        config[CONFIG_CAPACITY as usize..CONFIG_CAPACITY as usize + 8]
            .copy_from_slice(&capacity.to_ne_bytes());
        config[CONFIG_SEG_MAX as usize..CONFIG_SEG_MAX as usize + 4]
            .copy_from_slice(&seg_max.to_ne_bytes());
        let start = offset as usize;
        if start >= config.len() {
            return;
        }
        let n = data.len().min(config.len() - start);
        data[..n].copy_from_slice(&config[start..start + n]);
    }

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    fn host_features(&self) -> u64 {
        let mut features = VIRTIO_BLK_F_SEG_MAX
            | VIRTIO_BLK_F_FLUSH
            | VIRTIO_F_RING_EVENT_IDX
            | VIRTIO_F_ANY_LAYOUT
            | VIRTIO_F_RING_PACKED
            | VIRTIO_F_INDIRECT_DESC
            | VIRTIO_F_VERSION_1;
        if self.backend.read_only() {
            features |= VIRTIO_BLK_F_RO;
        }
        features
    }

    fn set_negotiated_features(&mut self, features: u64) {
        self.negotiated = features;
        let mut state = self.shared.lock().unwrap();
        let is_packed = features & VIRTIO_F_RING_PACKED != 0;
        state.queue = if is_packed {
            Virtqueue::new_packed(self.endian)
        } else {
            Virtqueue::new_split(self.endian)
        };
        state.queue.set_event_idx(features & VIRTIO_F_RING_EVENT_IDX != 0);
    }

    fn queue_count(&self) -> u16 {
        1
    }

    fn max_queue_size(&self, _idx: u16) -> u16 {
        QUEUE_SIZE
    }

    fn set_queue_size(&mut self, _idx: u16, size: u16) {
        self.shared.lock().unwrap().queue.size = size;
    }

    fn set_queue_addr(&mut self, _idx: u16, desc: u64, avail: u64, used: u64) {
        let mut state = self.shared.lock().unwrap();
        state.queue.desc_table = desc;
        state.queue.avail_ring = avail;
        state.queue.used_ring = used;
    }

    fn set_queue_ready(&mut self, idx: u16, ready: bool, memory: &GuestMemory) {
        if idx != 0 {
            return;
        }
        if ready {
            self.shared.lock().unwrap().queue.activate();
            if self.worker.is_none() {
                self.spawn_worker(memory.clone());
            }
        } else {
            self.stop_worker();
            self.shared.lock().unwrap().queue.reset();
        }
    }

    fn queue_ready(&self, idx: u16) -> bool {
        idx == 0 && self.shared.lock().unwrap().queue.ready
    }

    fn notify_queue(&mut self, idx: u16) {
        if idx != 0 {
            return;
        }
        if let Some(doorbell) = &self.doorbell {
            let _ = doorbell.write(1);
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
                self.stop_worker();
                self.shared.lock().unwrap().queue.reset();
            }
            StatusEvent::Start | StatusEvent::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemBackend {
        data: StdMutex<Vec<u8>>,
    }

    impl BlockBackend for MemBackend {
        fn read_at(&self, sector: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let data = self.data.lock().unwrap();
            let mut off = (sector * SECTOR_SIZE) as usize;
            let mut total = 0;
            for buf in bufs.iter_mut() {
                let n = buf.len();
                buf[..n].copy_from_slice(&data[off..off + n]);
                off += n;
                total += n;
            }
            Ok(total)
        }

        fn write_at(&self, sector: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            let mut off = (sector * SECTOR_SIZE) as usize;
            let mut total = 0;
            for buf in bufs {
                data[off..off + buf.len()].copy_from_slice(buf);
                off += buf.len();
                total += buf.len();
            }
            Ok(total)
        }

        fn flush(&self) -> io::Result<()> {
            Ok(())
        }

        fn capacity_sectors(&self) -> u64 {
            (self.data.lock().unwrap().len() as u64) / SECTOR_SIZE
        }

        fn serial(&self) -> &str {
            "test-disk"
        }

        fn read_only(&self) -> bool {
            false
        }
    }

    #[test]
    fn host_features_includes_flush_and_packed() {
        let backend = Arc::new(MemBackend {
            data: StdMutex::new(vec![0u8; 4096]),
        });
        let blk = VirtioBlk::new(backend);
        let features = blk.host_features();
        assert_ne!(features & VIRTIO_BLK_F_FLUSH, 0);
        assert_ne!(features & VIRTIO_F_RING_PACKED, 0);
    }

    #[test]
    fn config_read_reports_capacity() {
        let backend = Arc::new(MemBackend {
            data: StdMutex::new(vec![0u8; 8192]),
        });
        let blk = VirtioBlk::new(backend);
        let mut buf = [0u8; 8];
        blk.config_read(0, &mut buf);
        assert_eq!(u64::from_ne_bytes(buf), 16);
    }
}
