//! Buffer and DMA collaborator seam.
//!
//! The datapath never allocates or maps memory itself; it consumes the
//! [`DmaDevice`] trait and owns [`DmaBuf`]s handed out by it. Ownership
//! follows the hardware: between `map` and `unmap` the device owns the
//! buffer contents and the host must not read them.
//!
//! [`HeapDma`] is the in-process reference implementation used by the test
//! suite and by loopback consumers. It hands out heap buffers with synthetic
//! physical addresses and exposes a device-side write window for mapped
//! buffers so a simulated firmware can fill them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

/// Addressable physical-address width of the coprocessor's DMA engine.
pub const PADDR_BITS: u32 = 37;

/// Magic pattern written into the unused high bits of marked addresses.
const PADDR_MARK: u64 = 0xDEAD;

/// A physical address as published to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Mask the address down to the device's addressable width, dropping any
    /// marking bits.
    #[inline]
    #[must_use]
    pub const fn trim(self) -> Self {
        Self(self.0 & ((1u64 << PADDR_BITS) - 1))
    }

    /// Tag the unused high bits with a recognizable pattern.
    ///
    /// Completions echoing an unmarked (or differently marked) address point
    /// at ring/firmware desynchronization; the pattern makes that visible in
    /// logs. [`PhysAddr::trim`] removes it again before hashing.
    #[inline]
    #[must_use]
    pub const fn mark_high_bits(self) -> Self {
        Self(self.trim().0 | (PADDR_MARK << 48))
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Direction of a DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    FromDevice,
    ToDevice,
    Bidirectional,
}

/// Failures reported by the DMA collaborator.
///
/// Both are absorbed locally by the refill path; neither escalates out of
/// this crate.
#[derive(Debug, Error)]
pub enum DmaError {
    #[error("buffer allocation failed")]
    AllocFailed,
    #[error("dma map failed")]
    MapFailed,
}

/// An owned receive buffer with headroom/length manipulation.
///
/// The descriptor region occupies the first bytes of the storage; `pull_head`
/// moves the data window past it once the descriptor has been consumed.
pub struct DmaBuf {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
    paddr: Option<PhysAddr>,
}

impl DmaBuf {
    /// Creates a zeroed buffer of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: capacity,
            paddr: None,
        }
    }

    /// Total storage capacity, independent of the current data window.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Current data window.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    /// Mutable data window.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    /// Current data length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resets the data window to the entire buffer, so an unmap covers all
    /// of it.
    #[inline]
    pub fn set_full_len(&mut self) {
        self.head = 0;
        self.len = self.storage.len();
    }

    /// Advances the data window past `n` header bytes.
    #[inline]
    pub fn pull_head(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head += n;
        self.len -= n;
    }

    /// Removes `n` bytes from the tail of the data window.
    #[inline]
    pub fn trim_tail(&mut self, n: usize) {
        self.len -= n.min(self.len);
    }

    /// The physical address from the most recent `map`, if still mapped.
    #[inline]
    #[must_use]
    pub fn paddr(&self) -> Option<PhysAddr> {
        self.paddr
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("len", &self.len)
            .field("paddr", &self.paddr)
            .finish()
    }
}

/// Buffer/DMA allocation and mapping primitives.
///
/// Implementations must tolerate `map`/`unmap` from the refill and indication
/// contexts concurrently; the datapath never maps the same buffer twice.
pub trait DmaDevice: Send + Sync {
    /// Allocates a DMA-capable buffer of `size` bytes.
    fn alloc(&self, size: usize) -> Result<DmaBuf, DmaError>;

    /// Maps `buf` for device access and returns its physical address.
    fn map(&self, buf: &mut DmaBuf, dir: DmaDirection) -> Result<PhysAddr, DmaError>;

    /// Returns ownership of the contents to the host. Cache coherence is the
    /// implementation's responsibility; after this returns the host may read
    /// what the device wrote.
    fn unmap(&self, buf: &mut DmaBuf, dir: DmaDirection);

    /// Releases the buffer.
    fn free(&self, buf: DmaBuf);
}

/// Pointer into a mapped buffer, valid until the matching unmap.
struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the raw pointer is only dereferenced through `device_write`, which
// holds the registry lock, and only while the buffer is device-owned (mapped).
unsafe impl Send for MappedRegion {}

/// Heap-backed reference [`DmaDevice`].
///
/// Synthetic physical addresses start above the 32-bit boundary so tests
/// exercise the full addressable width. Allocation and mapping failures can
/// be injected for refill-path testing.
pub struct HeapDma {
    next_paddr: AtomicU64,
    mapped: Mutex<HashMap<u64, MappedRegion>>,
    outstanding: AtomicUsize,
    fail_allocs: AtomicUsize,
    fail_maps: AtomicUsize,
}

impl HeapDma {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_paddr: AtomicU64::new(0x1_0000_0000),
            mapped: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            fail_allocs: AtomicUsize::new(0),
            fail_maps: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` calls to `alloc` fail.
    pub fn fail_next_allocs(&self, n: usize) {
        self.fail_allocs.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` calls to `map` fail.
    pub fn fail_next_maps(&self, n: usize) {
        self.fail_maps.store(n, Ordering::SeqCst);
    }

    /// Buffers allocated and not yet freed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Buffers currently mapped for device access.
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.mapped.lock().expect("dma registry lock").len()
    }

    /// Writes `bytes` into the mapped buffer at `paddr`, starting at
    /// `offset` — the device side of the simulation.
    ///
    /// # Panics
    ///
    /// Panics if `paddr` is not currently mapped or the write is out of
    /// bounds; a simulated firmware writing to an unmapped address is a test
    /// bug, not a runtime condition.
    pub fn device_write(&self, paddr: PhysAddr, offset: usize, bytes: &[u8]) {
        let registry = self.mapped.lock().expect("dma registry lock");
        let region = registry
            .get(&paddr.trim().0)
            .expect("device write to unmapped paddr");
        assert!(offset + bytes.len() <= region.len, "device write out of bounds");
        // SAFETY: the region registration guarantees ptr/len describe live,
        // device-owned storage; the host does not touch it while mapped, and
        // the registry lock serializes device writes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                region.ptr.add(offset),
                bytes.len(),
            );
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for HeapDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaDevice for HeapDma {
    fn alloc(&self, size: usize) -> Result<DmaBuf, DmaError> {
        if Self::take_failure(&self.fail_allocs) {
            return Err(DmaError::AllocFailed);
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(DmaBuf::new(size))
    }

    fn map(&self, buf: &mut DmaBuf, _dir: DmaDirection) -> Result<PhysAddr, DmaError> {
        if Self::take_failure(&self.fail_maps) {
            return Err(DmaError::MapFailed);
        }
        let paddr = PhysAddr(self.next_paddr.fetch_add(0x1000, Ordering::SeqCst));
        let region = MappedRegion {
            ptr: buf.storage.as_mut_ptr(),
            len: buf.storage.len(),
        };
        self.mapped
            .lock()
            .expect("dma registry lock")
            .insert(paddr.0, region);
        buf.paddr = Some(paddr);
        Ok(paddr)
    }

    fn unmap(&self, buf: &mut DmaBuf, _dir: DmaDirection) {
        if let Some(paddr) = buf.paddr.take() {
            self.mapped
                .lock()
                .expect("dma registry lock")
                .remove(&paddr.trim().0);
        }
    }

    fn free(&self, buf: DmaBuf) {
        debug_assert!(buf.paddr.is_none(), "freeing a buffer still mapped");
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        drop(buf);
    }
}
