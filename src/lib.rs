//! Host-side receive datapath for a network coprocessor.
//!
//! The firmware fills a fixed-capacity ring of DMA buffers asynchronously and
//! announces completed receive batches through indication messages. This crate
//! owns everything between those two events on the host side:
//!
//! - [`ring::RxRing`] — the circular buffer pool with a device-visible write
//!   index,
//! - [`ring::BufferHashIndex`] — physical-address lookup for out-of-order
//!   completions (reorder-offload mode),
//! - [`ring::refill`] — the debt-based refill coordination protocol that keeps
//!   the ring full without blocking the hot path,
//! - [`rx::FrameAssembler`] — reassembly of ring-popped buffers into delivered
//!   frames,
//! - [`desc`] — format-specific descriptor accessors selected once at attach.
//!
//! [`device::RxDevice`] ties these together behind the attach/detach lifecycle.

pub mod config;
pub mod desc;
pub mod device;
pub mod dma;
pub mod ring;
pub mod rx;
pub mod trace;

pub use config::{DescFormat, Endian, RxConfig};
pub use device::{AttachError, RecoveryReason, RxDevice, RxHooks, RxStatsSnapshot};
pub use dma::{DmaBuf, DmaDevice, DmaDirection, DmaError, HeapDma, PhysAddr};
pub use rx::assembler::{FrameBatch, Msdu, MsduMeta, RxError};
pub use rx::indication::{FwRxDesc, IndicationBuilder};
