//! Descriptor chain translator: walks a chain of `VirtqDesc` starting at a
//! head index and resolves it into an ordered `libc::iovec` array (all
//! device-readable buffers first, then all device-writable buffers), honoring
//! one level of `VIRTQ_DESC_F_INDIRECT` expansion and rejecting malformed
//! chains. Shared by the split and packed engines, which differ only in how
//! they obtain the head index and signal completion.

use super::common::{MAX_CHAIN_LEN, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use super::endian::Endian;
use crate::boot::GuestMemory;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("descriptor index {0} out of bounds")]
    IndexOutOfBounds(u16),
    #[error("failed to read descriptor at guest address {0:#x}")]
    UnreadableDescriptor(u64),
    #[error("chain exceeds maximum length ({0})")]
    TooLong(usize),
    #[error("write-only descriptor follows a read-write transition out of order")]
    OutOfOrder,
    #[error("indirect descriptor table length {0} is not a multiple of descriptor size")]
    BadIndirectLength(u32),
    #[error("nested indirect descriptor (only one level is permitted)")]
    NestedIndirect,
}

/// One descriptor as it appears on the wire (split and packed layouts agree
/// on field order and size for the fields this translator needs).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: u64 = 16;

    pub fn read_from(memory: &GuestMemory, addr: u64, endian: Endian) -> Result<Self, ChainError> {
        let mut buf = [0u8; Self::SIZE as usize];
        memory
            .read(addr, &mut buf)
            .map_err(|_| ChainError::UnreadableDescriptor(addr))?;
        Ok(Self {
            addr: endian.to_host_u64(u64::from_ne_bytes(buf[0..8].try_into().unwrap())),
            len: endian.to_host_u32(u32::from_ne_bytes(buf[8..12].try_into().unwrap())),
            flags: endian.to_host_u16(u16::from_ne_bytes(buf[12..14].try_into().unwrap())),
            next: endian.to_host_u16(u16::from_ne_bytes(buf[14..16].try_into().unwrap())),
        })
    }
}

/// One resolved buffer: host pointer, length, and whether the device may
/// write into it (`true`) or must only read from it (`false`).
#[derive(Debug, Clone, Copy)]
pub struct ResolvedBuf {
    pub ptr: *mut u8,
    pub len: u32,
    pub writable: bool,
}

// Safety: the pointer is only ever dereferenced by the owning device worker
// thread while the backing GuestMemory is alive; ResolvedBuf itself carries
// no lifetime because request contexts are pooled and reused across threads
// the same way the existing GuestMemory raw-pointer sharing pattern works.
unsafe impl Send for ResolvedBuf {}

/// Ordered, resolved view of a descriptor chain: out-buffers (device reads)
/// precede in-buffers (device writes), per invariant 3.
#[derive(Debug, Default)]
pub struct ResolvedChain {
    pub bufs: Vec<ResolvedBuf>,
    pub out_count: usize,
    pub in_count: usize,
}

impl ResolvedChain {
    pub fn out_bufs(&self) -> &[ResolvedBuf] {
        &self.bufs[..self.out_count]
    }

    pub fn in_bufs(&self) -> &[ResolvedBuf] {
        &self.bufs[self.out_count..]
    }

    pub fn total_in_len(&self) -> u32 {
        self.in_bufs().iter().map(|b| b.len).sum()
    }
}

/// Resolve a descriptor chain starting at `head` in `desc_table` (base
/// address, `queue_size` entries) into a `ResolvedChain`.
///
/// Expands at most one level of `VIRTQ_DESC_F_INDIRECT`: an indirect
/// descriptor's buffer is itself a table of descriptors with no further
/// NEXT-chaining outside the table (virtio 1.x spec 2.6.5.3).
pub fn resolve_chain(
    memory: &GuestMemory,
    desc_table: u64,
    queue_size: u16,
    endian: Endian,
    head: u16,
) -> Result<ResolvedChain, ChainError> {
    let mut out = Vec::new();
    let mut in_bufs = Vec::new();
    let mut seen_write = false;
    let mut count = 0usize;
    let mut idx = head;
    let mut table = desc_table;
    let mut size = queue_size;
    let mut in_indirect = false;

    loop {
        count += 1;
        if count > MAX_CHAIN_LEN {
            return Err(ChainError::TooLong(count));
        }
        if idx >= size {
            return Err(ChainError::IndexOutOfBounds(idx));
        }
        let desc_addr = table + idx as u64 * VirtqDesc::SIZE;
        let desc = VirtqDesc::read_from(memory, desc_addr, endian)?;

        if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
            if in_indirect {
                return Err(ChainError::NestedIndirect);
            }
            if desc.len as u64 % VirtqDesc::SIZE != 0 || desc.len == 0 {
                return Err(ChainError::BadIndirectLength(desc.len));
            }
            table = desc.addr;
            size = (desc.len as u64 / VirtqDesc::SIZE) as u16;
            idx = 0;
            in_indirect = true;
            count = 0;
            continue;
        }

        let writable = desc.flags & VIRTQ_DESC_F_WRITE != 0;
        if writable {
            seen_write = true;
        } else if seen_write {
            return Err(ChainError::OutOfOrder);
        }

        if desc.len > 0 {
            let ptr = memory
                .host_ptr(desc.addr, desc.len as usize)
                .map_err(|_| ChainError::UnreadableDescriptor(desc.addr))?;
            let buf = ResolvedBuf {
                ptr,
                len: desc.len,
                writable,
            };
            if writable {
                in_bufs.push(buf);
            } else {
                out.push(buf);
            }
        }

        if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
            break;
        }
        idx = desc.next;
    }

    let out_count = out.len();
    let in_count = in_bufs.len();
    out.extend(in_bufs);
    Ok(ResolvedChain {
        bufs: out,
        out_count,
        in_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::GuestMemory;

    fn write_desc(mem: &GuestMemory, table: u64, idx: u16, d: VirtqDesc) {
        let addr = table + idx as u64 * VirtqDesc::SIZE;
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&d.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&d.len.to_le_bytes());
        buf[12..14].copy_from_slice(&d.flags.to_le_bytes());
        buf[14..16].copy_from_slice(&d.next.to_le_bytes());
        mem.write(addr, &buf).unwrap();
    }

    #[test]
    fn resolves_out_then_in_chain() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let table = 0x1000;
        write_desc(
            &mem,
            table,
            0,
            VirtqDesc {
                addr: 0x2000,
                len: 16,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mem,
            table,
            1,
            VirtqDesc {
                addr: 0x3000,
                len: 8,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
        );

        let chain = resolve_chain(&mem, table, 8, Endian::Little, 0).unwrap();
        assert_eq!(chain.out_count, 1);
        assert_eq!(chain.in_count, 1);
        assert_eq!(chain.out_bufs()[0].len, 16);
        assert_eq!(chain.in_bufs()[0].len, 8);
    }

    #[test]
    fn rejects_out_after_in() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let table = 0x1000;
        write_desc(
            &mem,
            table,
            0,
            VirtqDesc {
                addr: 0x2000,
                len: 8,
                flags: VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mem,
            table,
            1,
            VirtqDesc {
                addr: 0x3000,
                len: 8,
                flags: 0,
                next: 0,
            },
        );
        let err = resolve_chain(&mem, table, 8, Endian::Little, 0).unwrap_err();
        assert_eq!(err, ChainError::OutOfOrder);
    }

    #[test]
    fn rejects_out_of_bounds_head() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let err = resolve_chain(&mem, 0x1000, 8, Endian::Little, 9).unwrap_err();
        assert_eq!(err, ChainError::IndexOutOfBounds(9));
    }

    #[test]
    fn expands_one_level_of_indirect() {
        let mem = GuestMemory::new(1 << 20).unwrap();
        let table = 0x1000;
        let indirect_table = 0x5000;
        write_desc(
            &mem,
            table,
            0,
            VirtqDesc {
                addr: indirect_table,
                len: 32,
                flags: VIRTQ_DESC_F_INDIRECT,
                next: 0,
            },
        );
        write_desc(
            &mem,
            indirect_table,
            0,
            VirtqDesc {
                addr: 0x2000,
                len: 4,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            },
        );
        write_desc(
            &mem,
            indirect_table,
            1,
            VirtqDesc {
                addr: 0x3000,
                len: 4,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
        );

        let chain = resolve_chain(&mem, table, 8, Endian::Little, 0).unwrap();
        assert_eq!(chain.out_count, 1);
        assert_eq!(chain.in_count, 1);
    }
}
