//! Virtio device infrastructure.
//!
//! This module implements the virtio specification for virtual device I/O.
//! Virtio provides a standard interface for virtual devices (block, network,
//! etc.) to communicate efficiently between guest and host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Guest                                   │
//! │   ┌─────────────────────────────────────────────────────────┐  │
//! │   │                  virtio Driver                          │  │
//! │   │   - Writes requests to descriptor ring                  │  │
//! │   │   - Updates available ring                              │  │
//! │   │   - Notifies device via MMIO write                      │  │
//! │   └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ Shared Memory (virtqueue)
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                         VMM                                     │
//! │   ┌─────────────────────────────────────────────────────────┐  │
//! │   │                 virtio Device                           │  │
//! │   │   - Reads requests from descriptor ring                 │  │
//! │   │   - Processes requests (disk I/O, network I/O, etc.)    │  │
//! │   │   - Updates used ring                                   │  │
//! │   └─────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module layout
//!
//! - [`common`]: shared MMIO register offsets, status/feature bits
//! - [`endian`]: host <-> ring endian adapter (legacy big-endian guest support)
//! - [`descriptor`]: descriptor chain walker/translator
//! - [`split`] / [`packed`]: the two ring layouts, each implementing the same
//!   pop/set_used/should_signal surface
//! - [`queue`]: the `Virtqueue` facade device personalities are built against
//! - [`lifecycle`]: status byte state machine, feature negotiation, the
//!   `VirtioDeviceOps` vtable
//! - [`transport`]: virtio-mmio v1 (legacy)/v2 (modern) register dispatch
//! - [`irq`]: interrupt injection handle
//! - [`blk`]: block device personality
//! - [`net`]: network device personality
//! - [`vhost`]: vhost-net kernel offload handshake
//!
//! # MMIO Transport
//!
//! We use the virtio-mmio transport (as opposed to PCI). The device appears
//! at a fixed memory address and is discovered via kernel command line:
//!
//! ```text
//! virtio_mmio.device=4K@0xd0000000:5
//! ```
//!
//! This tells Linux: "There's a 4KB virtio device at address 0xd0000000, IRQ 5"
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod blk;
pub mod common;
pub mod descriptor;
pub mod endian;
pub mod irq;
pub mod lifecycle;
pub mod net;
pub mod packed;
pub mod queue;
pub mod split;
pub mod transport;
pub mod vhost;
