//! The receive buffer ring.
//!
//! The ring proper is a power-of-two array of physical addresses plus a write
//! index, both read by the device: the firmware polls the index and consumes
//! buffers from the addresses behind it. Everything else here (the buffer
//! shadow table, the read cursor, the fill counters) is host-only bookkeeping
//! guarded by the refill lock in [`crate::ring::refill`].
//!
//! Staged slot writes are published in one step: slots are stored relaxed,
//! then a release fence orders them before the index store the device polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use crate::dma::DmaBuf;
use crate::trace;

/// The portion of the ring the device reads: address slots and write index.
///
/// Host writes, device reads. Handed out as an `Arc` so a device model (or a
/// real doorbell shim) can poll it without touching host state.
pub struct DeviceVisible {
    paddrs: Box<[AtomicU64]>,
    alloc_idx: AtomicU32,
}

impl DeviceVisible {
    fn new(size: usize) -> Self {
        Self {
            paddrs: (0..size).map(|_| AtomicU64::new(0)).collect(),
            alloc_idx: AtomicU32::new(0),
        }
    }

    /// Number of address slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.paddrs.len()
    }

    /// The write index the device polls. Slots below it are valid.
    #[must_use]
    pub fn alloc_idx(&self) -> u32 {
        self.alloc_idx.load(Ordering::Acquire)
    }

    /// Physical address published in slot `idx`.
    ///
    /// Only slots between the device's read position and [`Self::alloc_idx`]
    /// hold live buffers; anything else is stale.
    #[must_use]
    pub fn paddr_at(&self, idx: u32) -> u64 {
        self.paddrs[idx as usize & (self.size() - 1)].load(Ordering::Acquire)
    }
}

/// Host-side ring state: the device-visible slots plus the shadow table
/// pairing each slot with the buffer mapped behind it.
///
/// In reorder-offload mode the shadow table stays empty (buffers are owned by
/// the hash index instead) and `pop_next` is never called.
pub struct RxRing {
    dev: Arc<DeviceVisible>,
    bufs: Box<[Option<DmaBuf>]>,
    mask: u32,
    fill_level: usize,
    fill_cnt: usize,
    next_alloc: u32,
    sw_rd_idx: u32,
}

impl RxRing {
    /// # Panics
    ///
    /// Panics if `size` is not a power of two or `fill_level >= size`; both
    /// are established by the sizing policy before construction.
    #[must_use]
    pub fn new(size: usize, fill_level: usize) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        assert!(fill_level < size, "fill level must leave one slot empty");
        Self {
            dev: Arc::new(DeviceVisible::new(size)),
            bufs: (0..size).map(|_| None).collect(),
            mask: (size - 1) as u32,
            fill_level,
            fill_cnt: 0,
            next_alloc: 0,
            sw_rd_idx: 0,
        }
    }

    /// Handle for the device side of the ring.
    #[must_use]
    pub fn device_visible(&self) -> Arc<DeviceVisible> {
        Arc::clone(&self.dev)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.dev.size()
    }

    #[must_use]
    pub fn fill_level(&self) -> usize {
        self.fill_level
    }

    /// Buffers currently posted to the device.
    #[must_use]
    pub fn fill_cnt(&self) -> usize {
        self.fill_cnt
    }

    /// How many buffers are needed to get back to the fill level.
    #[must_use]
    pub fn space(&self) -> usize {
        self.fill_level.saturating_sub(self.fill_cnt)
    }

    /// Stage one buffer into the next slot without publishing it.
    ///
    /// `buf` is `None` in reorder-offload mode, where the hash index owns the
    /// buffer. Not visible to the device until [`Self::publish`].
    pub fn stage(&mut self, paddr: u64, buf: Option<DmaBuf>) {
        let idx = self.next_alloc as usize;
        self.dev.paddrs[idx].store(paddr, Ordering::Relaxed);
        self.bufs[idx] = buf;
        self.next_alloc = (self.next_alloc + 1) & self.mask;
        self.fill_cnt += 1;
    }

    /// Publish all staged slots to the device in one index update.
    pub fn publish(&self) {
        // The staged address stores must be ordered before the index store
        // the device polls.
        fence(Ordering::Release);
        self.dev.alloc_idx.store(self.next_alloc, Ordering::Release);
        trace::trace!(alloc_idx = self.next_alloc, "ring publish");
    }

    /// Published-but-unpopped slots, from relaxed index snapshots.
    ///
    /// Advisory only; the refill lock is what serializes mutation. Valid in
    /// sequential mode, where the read cursor tracks consumption.
    #[must_use]
    pub fn elems(&self) -> usize {
        let w = self.dev.alloc_idx.load(Ordering::Relaxed);
        (w.wrapping_sub(self.sw_rd_idx) & self.mask) as usize
    }

    /// Pop the buffer at the software read cursor (sequential mode).
    pub fn pop_next(&mut self) -> Option<DmaBuf> {
        let idx = self.sw_rd_idx as usize;
        let buf = self.bufs[idx].take()?;
        self.sw_rd_idx = (self.sw_rd_idx + 1) & self.mask;
        self.fill_cnt -= 1;
        Some(buf)
    }

    /// Account for `n` buffers consumed out of ring order (offload mode,
    /// where the hash index hands the buffers out).
    pub fn note_consumed(&mut self, n: usize) {
        self.fill_cnt = self.fill_cnt.saturating_sub(n);
    }

    /// Remove every buffer still shadowed in the ring, for teardown.
    pub fn drain(&mut self) -> Vec<DmaBuf> {
        let drained: Vec<DmaBuf> = self.bufs.iter_mut().filter_map(Option::take).collect();
        self.fill_cnt = self.fill_cnt.saturating_sub(drained.len());
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(n: usize) -> DmaBuf {
        DmaBuf::new(n)
    }

    #[test]
    fn staged_slots_invisible_until_publish() {
        let mut ring = RxRing::new(8, 7);
        let dev = ring.device_visible();
        ring.stage(0x1000, Some(buf(64)));
        ring.stage(0x2000, Some(buf(64)));
        assert_eq!(dev.alloc_idx(), 0);
        ring.publish();
        assert_eq!(dev.alloc_idx(), 2);
        assert_eq!(dev.paddr_at(0), 0x1000);
        assert_eq!(dev.paddr_at(1), 0x2000);
    }

    #[test]
    fn pop_follows_stage_order() {
        let mut ring = RxRing::new(8, 7);
        for p in [0x10u64, 0x20, 0x30] {
            let mut b = buf(32);
            b.data_mut()[0] = p as u8;
            ring.stage(p, Some(b));
        }
        ring.publish();
        assert_eq!(ring.fill_cnt(), 3);
        assert_eq!(ring.pop_next().unwrap().data()[0], 0x10);
        assert_eq!(ring.pop_next().unwrap().data()[0], 0x20);
        assert_eq!(ring.fill_cnt(), 1);
    }

    #[test]
    fn index_wraps_at_ring_size() {
        let mut ring = RxRing::new(4, 3);
        for i in 0..3u64 {
            ring.stage(i, Some(buf(16)));
        }
        ring.publish();
        for _ in 0..3 {
            ring.pop_next().unwrap();
        }
        for i in 3..6u64 {
            ring.stage(i, Some(buf(16)));
        }
        ring.publish();
        let dev = ring.device_visible();
        assert_eq!(dev.alloc_idx(), 2); // 6 mod 4
        assert_eq!(dev.paddr_at(0), 4);
    }

    #[test]
    fn elems_counts_published_unpopped_slots() {
        let mut ring = RxRing::new(8, 7);
        assert_eq!(ring.elems(), 0);
        for p in 0..3u64 {
            ring.stage(p, Some(buf(16)));
        }
        assert_eq!(ring.elems(), 0); // not yet published
        ring.publish();
        assert_eq!(ring.elems(), 3);
        for _ in 0..3 {
            ring.pop_next().unwrap();
        }
        assert_eq!(ring.elems(), 0);
    }

    #[test]
    fn space_tracks_fill_level() {
        let mut ring = RxRing::new(8, 6);
        assert_eq!(ring.space(), 6);
        ring.stage(1, None);
        ring.stage(2, None);
        assert_eq!(ring.space(), 4);
        ring.note_consumed(2);
        assert_eq!(ring.space(), 6);
    }

    #[test]
    fn drain_returns_all_shadowed_buffers() {
        let mut ring = RxRing::new(8, 7);
        for p in 0..5u64 {
            ring.stage(p, Some(buf(16)));
        }
        ring.publish();
        ring.pop_next().unwrap();
        assert_eq!(ring.drain().len(), 4);
        assert_eq!(ring.fill_cnt(), 0);
    }
}
