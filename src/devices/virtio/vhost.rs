//! vhost-net kernel offload: hands the RX/TX data path for a virtqueue pair
//! straight to the `vhost_net` kernel module, bypassing the userspace worker
//! threads in [`super::net`] entirely. Modeled on the reference
//! implementation's `virtio_net__vhost_init`/`virtio_vhost_set_vring` (see
//! `virtio/net.c` in the original source): open `/dev/vhost-net`, negotiate
//! features, hand over the guest memory table once, then per-vring hand over
//! the ring addresses, the kick/call eventfds, and finally the TAP fd as the
//! "backend".
//!
//! The vhost kernel ABI has no safe Rust binding in this crate's dependency
//! set, so the ioctl numbers and structure layouts are reproduced here
//! directly from `linux/vhost.h`; `nix`'s ioctl macros generate the `unsafe`
//! syscall wrappers.

use crate::boot::GuestMemory;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use thiserror::Error;

const VHOST_VIRTIO: u8 = 0xaf;

#[repr(C)]
struct VhostVringState {
    index: u32,
    num: u32,
}

#[repr(C)]
struct VhostVringFile {
    index: u32,
    fd: i32,
}

#[repr(C)]
struct VhostVringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    avail_user_addr: u64,
    used_user_addr: u64,
    log_guest_addr: u64,
}

#[repr(C)]
struct VhostMemoryRegion {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

#[repr(C)]
struct VhostMemory {
    nregions: u32,
    padding: u32,
    regions: [VhostMemoryRegion; 1],
}

nix::ioctl_write_ptr!(vhost_set_features, VHOST_VIRTIO, 0x00, u64);
nix::ioctl_read!(vhost_get_features, VHOST_VIRTIO, 0x00, u64);
nix::ioctl_none!(vhost_set_owner, VHOST_VIRTIO, 0x01);
nix::ioctl_none!(vhost_reset_owner, VHOST_VIRTIO, 0x02);
nix::ioctl_write_ptr!(vhost_set_mem_table, VHOST_VIRTIO, 0x03, VhostMemory);
nix::ioctl_write_ptr!(vhost_set_vring_num, VHOST_VIRTIO, 0x10, VhostVringState);
nix::ioctl_write_ptr!(vhost_set_vring_addr, VHOST_VIRTIO, 0x11, VhostVringAddr);
nix::ioctl_write_ptr!(vhost_set_vring_base, VHOST_VIRTIO, 0x12, VhostVringState);
nix::ioctl_write_ptr!(vhost_set_vring_kick, VHOST_VIRTIO, 0x20, VhostVringFile);
nix::ioctl_write_ptr!(vhost_set_vring_call, VHOST_VIRTIO, 0x21, VhostVringFile);
nix::ioctl_write_ptr!(vhost_net_set_backend, VHOST_VIRTIO, 0x30, VhostVringFile);

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("failed to open /dev/vhost-net: {0}")]
    Open(#[source] io::Error),
    #[error("vhost ioctl failed: {0}")]
    Ioctl(#[source] nix::errno::Errno),
}

impl From<nix::errno::Errno> for VhostError {
    fn from(e: nix::errno::Errno) -> Self {
        VhostError::Ioctl(e)
    }
}

/// One open `/dev/vhost-net` instance, handed ownership of a single
/// virtqueue pair once `VIRTIO_NET_F_*` negotiation and ring setup are done.
pub struct VhostNetHandle {
    file: File,
}

impl VhostNetHandle {
    pub fn open() -> Result<Self, VhostError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vhost-net")
            .map_err(VhostError::Open)?;
        Ok(Self { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn set_owner(&self) -> Result<(), VhostError> {
        unsafe { vhost_set_owner(self.fd()) }?;
        Ok(())
    }

    pub fn reset_owner(&self) -> Result<(), VhostError> {
        unsafe { vhost_reset_owner(self.fd()) }?;
        Ok(())
    }

    pub fn get_features(&self) -> Result<u64, VhostError> {
        let mut features: u64 = 0;
        unsafe { vhost_get_features(self.fd(), &mut features) }?;
        Ok(features)
    }

    pub fn set_features(&self, features: u64) -> Result<(), VhostError> {
        unsafe { vhost_set_features(self.fd(), &features) }?;
        Ok(())
    }

    /// Hand the whole single-region guest address space to the kernel in
    /// one shot; this harness never uses more than one `GuestMemoryMmap`
    /// region (see `boot::GuestMemory::new`).
    pub fn set_mem_table(&self, memory: &GuestMemory) -> Result<(), VhostError> {
        let (host_addr, size) = memory.as_raw_parts();
        let table = VhostMemory {
            nregions: 1,
            padding: 0,
            regions: [VhostMemoryRegion {
                guest_phys_addr: 0,
                memory_size: size,
                userspace_addr: host_addr,
                flags_padding: 0,
            }],
        };
        unsafe { vhost_set_mem_table(self.fd(), &table) }?;
        Ok(())
    }

    pub fn set_vring_num(&self, index: u32, num: u32) -> Result<(), VhostError> {
        let state = VhostVringState { index, num };
        unsafe { vhost_set_vring_num(self.fd(), &state) }?;
        Ok(())
    }

    pub fn set_vring_base(&self, index: u32, base: u32) -> Result<(), VhostError> {
        let state = VhostVringState { index, num: base };
        unsafe { vhost_set_vring_base(self.fd(), &state) }?;
        Ok(())
    }

    pub fn set_vring_addr(
        &self,
        index: u32,
        desc: u64,
        avail: u64,
        used: u64,
    ) -> Result<(), VhostError> {
        let addr = VhostVringAddr {
            index,
            flags: 0,
            desc_user_addr: desc,
            avail_user_addr: avail,
            used_user_addr: used,
            log_guest_addr: 0,
        };
        unsafe { vhost_set_vring_addr(self.fd(), &addr) }?;
        Ok(())
    }

    pub fn set_vring_kick(&self, index: u32, kick_fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd: kick_fd };
        unsafe { vhost_set_vring_kick(self.fd(), &file) }?;
        Ok(())
    }

    pub fn set_vring_call(&self, index: u32, call_fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd: call_fd };
        unsafe { vhost_set_vring_call(self.fd(), &file) }?;
        Ok(())
    }

    /// Attach (or, with `fd = -1`, detach) the TAP file descriptor as the
    /// in-kernel data-path backend for virtqueue `index`.
    pub fn set_backend(&self, index: u32, tap_fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd: tap_fd };
        unsafe { vhost_net_set_backend(self.fd(), &file) }?;
        Ok(())
    }

    pub fn detach_backend(&self, index: u32) -> Result<(), VhostError> {
        self.set_backend(index, -1)
    }
}
