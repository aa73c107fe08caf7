//! Physical-address lookup for out-of-order completions.
//!
//! In reorder-offload mode the firmware consumes ring buffers in whatever
//! order its reorder logic releases them, and completions identify buffers by
//! physical address alone. This index pairs every posted address with its
//! buffer so completions can be resolved regardless of ring position.
//!
//! Buckets preallocate a fixed entry pool; beyond that, growth draws from a
//! bounded shared budget so a misbehaving firmware cannot balloon host
//! memory. A lookup miss is not a recoverable condition: the address came
//! from the device, so a miss means the ring and the firmware disagree about
//! buffer ownership.

use thiserror::Error;

use crate::dma::DmaBuf;
use crate::trace;

// The shifts fold the parts of a synthetic or IOMMU address that actually
// vary; low bits are alignment, and bits above 37 never reach the device.
const HASH_SHIFT_HI: u64 = 14;
const HASH_SHIFT_LO: u64 = 4;

/// Errors from hash index maintenance.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    /// Both the bucket pool and the dynamic budget are exhausted.
    #[error("hash index full: dynamic entry budget ({budget}) exhausted")]
    CapacityExhausted { budget: usize },
    /// The device completed an address the host never posted (or already
    /// consumed). The ring state can no longer be trusted.
    #[error("no buffer indexed at paddr {paddr:#x}")]
    NotFound { paddr: u64 },
}

struct Slot {
    paddr: u64,
    buf: DmaBuf,
}

/// Bounded paddr-to-buffer map.
pub struct BufferHashIndex {
    buckets: Box<[Vec<Slot>]>,
    mask: u64,
    pooled: usize,
    dynamic_max: usize,
    dynamic_used: usize,
    len: usize,
}

impl BufferHashIndex {
    /// # Panics
    ///
    /// Panics if `buckets` is not a power of two; configuration validation
    /// rejects such values before attach.
    #[must_use]
    pub fn new(buckets: usize, pooled: usize, dynamic_max: usize) -> Self {
        assert!(
            buckets.is_power_of_two(),
            "hash bucket count must be a power of two"
        );
        Self {
            buckets: (0..buckets).map(|_| Vec::with_capacity(pooled)).collect(),
            mask: (buckets - 1) as u64,
            pooled,
            dynamic_max,
            dynamic_used: 0,
            len: 0,
        }
    }

    fn bucket_of(&self, paddr: u64) -> usize {
        (((paddr >> HASH_SHIFT_HI) ^ (paddr >> HASH_SHIFT_LO)) & self.mask) as usize
    }

    /// Number of indexed buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Dynamic (beyond-pool) entries currently in use.
    #[must_use]
    pub fn dynamic_used(&self) -> usize {
        self.dynamic_used
    }

    /// Indexes `buf` under `paddr`.
    ///
    /// On capacity exhaustion the buffer is handed back so the caller can
    /// unmap and free it.
    pub fn insert(&mut self, paddr: u64, buf: DmaBuf) -> Result<(), (HashError, DmaBuf)> {
        let idx = self.bucket_of(paddr);
        if self.buckets[idx].len() >= self.pooled {
            if self.dynamic_used >= self.dynamic_max {
                return Err((
                    HashError::CapacityExhausted {
                        budget: self.dynamic_max,
                    },
                    buf,
                ));
            }
            self.dynamic_used += 1;
        }
        self.buckets[idx].push(Slot { paddr, buf });
        self.len += 1;
        trace::trace!(paddr, bucket = idx, "hash insert");
        Ok(())
    }

    /// Removes and returns the buffer indexed under `paddr`.
    ///
    /// With duplicate addresses (a remapped buffer), the most recently
    /// inserted entry wins.
    pub fn remove(&mut self, paddr: u64) -> Result<DmaBuf, HashError> {
        let idx = self.bucket_of(paddr);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.iter().rposition(|slot| slot.paddr == paddr) else {
            return Err(HashError::NotFound { paddr });
        };
        if bucket.len() > self.pooled {
            self.dynamic_used -= 1;
        }
        let slot = bucket.swap_remove(pos);
        self.len -= 1;
        Ok(slot.buf)
    }

    /// Removes every indexed buffer, for teardown.
    pub fn drain(&mut self) -> Vec<DmaBuf> {
        let mut out = Vec::with_capacity(self.len);
        for bucket in self.buckets.iter_mut() {
            out.extend(bucket.drain(..).map(|slot| slot.buf));
        }
        self.dynamic_used = 0;
        self.len = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(tag: u8) -> DmaBuf {
        let mut b = DmaBuf::new(16);
        b.data_mut()[0] = tag;
        b
    }

    // Addresses that land in the same bucket: stride by a multiple that
    // cancels in both hash shifts.
    fn colliding(base: u64, i: u64) -> u64 {
        base + i * (1 << 24)
    }

    #[test]
    fn insert_then_remove_returns_same_buffer() {
        let mut hash = BufferHashIndex::new(1024, 10, 64);
        hash.insert(0x1_2345_0000, buf(7)).unwrap();
        assert_eq!(hash.len(), 1);
        let b = hash.remove(0x1_2345_0000).unwrap();
        assert_eq!(b.data()[0], 7);
        assert!(hash.is_empty());
    }

    #[test]
    fn missing_paddr_is_an_error() {
        let mut hash = BufferHashIndex::new(16, 4, 4);
        match hash.remove(0xdead_0000) {
            Err(HashError::NotFound { paddr }) => assert_eq!(paddr, 0xdead_0000),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn collisions_resolve_by_exact_paddr() {
        let mut hash = BufferHashIndex::new(16, 10, 16);
        let base = 0x1_0000_0000;
        for i in 0..10 {
            hash.insert(colliding(base, i), buf(i as u8)).unwrap();
        }
        // Reverse order: every lookup must chase the chain, not the head.
        for i in (0..10).rev() {
            let b = hash.remove(colliding(base, i)).unwrap();
            assert_eq!(b.data()[0], i as u8);
        }
        assert!(hash.is_empty());
    }

    #[test]
    fn dynamic_budget_bounds_overflow() {
        let mut hash = BufferHashIndex::new(16, 2, 3);
        let base = 0x1_0000_0000;
        // 2 pooled + 3 dynamic fit.
        for i in 0..5 {
            hash.insert(colliding(base, i), buf(i as u8)).unwrap();
        }
        assert_eq!(hash.dynamic_used(), 3);
        let (err, rejected) = hash.insert(colliding(base, 5), buf(5)).unwrap_err();
        assert_eq!(err, HashError::CapacityExhausted { budget: 3 });
        assert_eq!(rejected.data()[0], 5);

        // Removing releases budget for new dynamic entries.
        hash.remove(colliding(base, 4)).unwrap();
        assert_eq!(hash.dynamic_used(), 2);
        hash.insert(colliding(base, 5), buf(5)).unwrap();
    }

    #[test]
    fn duplicate_paddr_returns_most_recent() {
        let mut hash = BufferHashIndex::new(16, 4, 4);
        hash.insert(0x4000, buf(1)).unwrap();
        hash.insert(0x4000, buf(2)).unwrap();
        assert_eq!(hash.remove(0x4000).unwrap().data()[0], 2);
        assert_eq!(hash.remove(0x4000).unwrap().data()[0], 1);
    }

    #[test]
    fn drain_empties_every_bucket() {
        let mut hash = BufferHashIndex::new(16, 2, 16);
        for i in 0..8u64 {
            hash.insert(0x1000 + i * 0x10, buf(i as u8)).unwrap();
        }
        assert_eq!(hash.drain().len(), 8);
        assert!(hash.is_empty());
        assert_eq!(hash.dynamic_used(), 0);
    }
}
