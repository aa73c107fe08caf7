//! Attach-time configuration and ring sizing policy.
//!
//! All operating-mode selection lives here: instead of process-wide mutable
//! function tables, an [`RxConfig`] is constructed once at attach and threaded
//! through every component that needs it. The sizing constants default to the
//! values the firmware interface was tuned for, but remain configuration
//! inputs so integrators can override them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest ring the firmware accepts (slightly more than one large A-MPDU).
pub const RING_SIZE_MIN: usize = 128;

/// Largest useful ring (~20 ms at 1 Gbps of 1500 B MSDUs).
pub const RING_SIZE_MAX: usize = 2048;

/// Conservative average frame size used for ring sizing.
pub const AVG_MSDU_BYTES: u32 = 1000;

/// Worst reasonable delay before the host services a receive indication.
pub const HOST_LATENCY_WORST_MS: u32 = 20;

/// Worst *likely* delay; sizes the fill level rather than the ring itself.
pub const HOST_LATENCY_LIKELY_MS: u32 = 10;

/// Interval between refill retries after an allocation failure.
pub const REFILL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Cap on outstanding refill debt before callers block for the lock.
pub const REFILL_DEBT_MAX: u32 = 128;

/// Number of hash buckets for out-of-order completion lookup (power of two).
pub const NUM_HASH_BUCKETS: usize = 1024;

/// Preallocated entries per hash bucket.
pub const HASH_BUCKET_POOL: usize = 10;

/// Which wire layout the descriptor accessors should expect.
///
/// Selected once at attach; nothing branches on this per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescFormat {
    /// Hardware-written descriptor at the head of each receive buffer.
    LowLatency,
    /// Firmware-written descriptor carried with the indication payload.
    HighLatency,
}

/// Byte order of the wire formats as seen by this host.
///
/// The firmware byteswaps uploads for big-endian hosts, so the choice is a
/// property of the configured transport, not of each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Read one 32-bit word at byte offset `off`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `off + 4`; descriptor regions are
    /// length-checked before any accessor runs.
    #[inline]
    pub fn word(self, buf: &[u8], off: usize) -> u32 {
        let bytes: [u8; 4] = buf[off..off + 4].try_into().expect("word read in bounds");
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    /// Write one 32-bit word at byte offset `off`.
    #[inline]
    pub fn put_word(self, buf: &mut [u8], off: usize, val: u32) {
        let bytes = match self {
            Self::Little => val.to_le_bytes(),
            Self::Big => val.to_be_bytes(),
        };
        buf[off..off + 4].copy_from_slice(&bytes);
    }
}

/// Attach-time configuration for the receive datapath.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxConfig {
    /// Target throughput used for ring sizing.
    pub max_throughput_mbps: u32,
    /// Average frame size assumed by the sizing formula.
    pub avg_msdu_bytes: u32,
    /// Worst-case host service latency bound (sizes the ring).
    pub host_latency_worst_ms: u32,
    /// Likely host service latency bound (sizes the fill level).
    pub host_latency_likely_ms: u32,
    /// Lower clamp for the computed ring size.
    pub ring_size_min: usize,
    /// Upper clamp for the computed ring size.
    pub ring_size_max: usize,
    /// Whether the firmware delivers completions out of ring order,
    /// identified by physical address.
    pub reorder_offload: bool,
    /// Size of each receive buffer, descriptor reservation included.
    pub buf_size: usize,
    /// Descriptor wire layout.
    pub format: DescFormat,
    /// Byte order of descriptors and indication messages.
    pub endian: Endian,
    /// Tag ring-published physical addresses with a magic pattern in the
    /// unused high bits (debug aid for spotting stale completions).
    pub mark_paddr_high_bits: bool,
    /// Backoff interval for the refill retry timer.
    pub refill_retry_interval: Duration,
    /// Cap on the atomic refill debt counter.
    pub refill_debt_max: u32,
    /// Number of hash buckets (must be a power of two).
    pub hash_buckets: usize,
    /// Preallocated hash entries per bucket.
    pub hash_bucket_pool: usize,
    /// Bound on dynamically allocated hash entries across all buckets.
    pub hash_dynamic_max: usize,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            max_throughput_mbps: 800,
            avg_msdu_bytes: AVG_MSDU_BYTES,
            host_latency_worst_ms: HOST_LATENCY_WORST_MS,
            host_latency_likely_ms: HOST_LATENCY_LIKELY_MS,
            ring_size_min: RING_SIZE_MIN,
            ring_size_max: RING_SIZE_MAX,
            reorder_offload: true,
            buf_size: 1520,
            format: DescFormat::LowLatency,
            endian: Endian::Little,
            mark_paddr_high_bits: false,
            refill_retry_interval: REFILL_RETRY_INTERVAL,
            refill_debt_max: REFILL_DEBT_MAX,
            hash_buckets: NUM_HASH_BUCKETS,
            hash_bucket_pool: HASH_BUCKET_POOL,
            hash_dynamic_max: RING_SIZE_MAX,
        }
    }
}

impl RxConfig {
    /// Ring size derived from throughput and the worst-case latency bound.
    ///
    /// The ring is sized very conservatively: it is difficult to resize once
    /// in use, while the fill level can be tuned at runtime. Integer division
    /// order matches the tuning the defaults were derived with. Rounds up to
    /// a power of two before clamping, so a configured bound is never
    /// exceeded; the bounds themselves must be powers of two (attach
    /// validates this).
    #[must_use]
    pub fn ring_size(&self) -> usize {
        // 1e6 bps/mbps / 1e3 ms per sec = 1000
        let per_ms = self.max_throughput_mbps as usize * 1000 / (8 * self.avg_msdu_bytes as usize);
        let size = per_ms * self.host_latency_worst_ms as usize;
        size.next_power_of_two()
            .clamp(self.ring_size_min, self.ring_size_max)
    }

    /// Level to which the ring is kept filled with empty buffers.
    ///
    /// Uses the *likely* latency bound through the same formula, and always
    /// leaves at least one slot empty so a full ring is distinguishable from
    /// an empty one.
    #[must_use]
    pub fn fill_level(&self, ring_size: usize) -> usize {
        let per_ms = self.max_throughput_mbps as usize * 1000 / (8 * self.avg_msdu_bytes as usize);
        let level = (per_ms * self.host_latency_likely_ms as usize)
            .max(1)
            .next_power_of_two();
        level.min(ring_size - 1)
    }
}
