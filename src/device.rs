//! Attach/detach lifecycle and the external surface of the datapath.
//!
//! [`RxDevice::attach`] freezes the configuration, builds the ring, indexes,
//! and descriptor view, performs the initial fill, and starts the refill
//! retry thread. From then on the transport feeds indication messages to
//! [`RxDevice::pop_frames`]; detach (or drop) tears the whole thing down in
//! reverse order, joining the timer thread before releasing buffers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use serde::Serialize;
use thiserror::Error;

use crate::config::RxConfig;
use crate::desc;
use crate::dma::DmaDevice;
use crate::ring::hash::BufferHashIndex;
use crate::ring::refill::{self, RefillScheduler, RingCore};
use crate::ring::rx_ring::{DeviceVisible, RxRing};
use crate::rx::assembler::{FrameAssembler, FrameBatch, Msdu, RxError};
use crate::trace;

/// Receive-path counters. All relaxed; consistency across fields is not
/// promised, only eventual accuracy of each.
#[derive(Debug, Default)]
pub struct RxStats {
    pub(crate) buffers_posted: AtomicU64,
    pub(crate) alloc_failures: AtomicU64,
    pub(crate) map_failures: AtomicU64,
    pub(crate) hash_insert_failures: AtomicU64,
    pub(crate) debt_deferred: AtomicU64,
    pub(crate) refill_retry_starts: AtomicU64,
    pub(crate) refill_retry_fires: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) msdus_delivered: AtomicU64,
    pub(crate) bytes_delivered: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) integrity_diverted: AtomicU64,
    pub(crate) done_bit_retries: AtomicU64,
    pub(crate) len_invalid: AtomicU64,
    pub(crate) pop_failures: AtomicU64,
}

/// Point-in-time copy of [`RxStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RxStatsSnapshot {
    pub buffers_posted: u64,
    pub alloc_failures: u64,
    pub map_failures: u64,
    pub hash_insert_failures: u64,
    pub debt_deferred: u64,
    pub refill_retry_starts: u64,
    pub refill_retry_fires: u64,
    pub batches: u64,
    pub msdus_delivered: u64,
    pub bytes_delivered: u64,
    pub discarded: u64,
    pub integrity_diverted: u64,
    pub done_bit_retries: u64,
    pub len_invalid: u64,
    pub pop_failures: u64,
}

impl RxStats {
    #[must_use]
    pub fn snapshot(&self) -> RxStatsSnapshot {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        RxStatsSnapshot {
            buffers_posted: get(&self.buffers_posted),
            alloc_failures: get(&self.alloc_failures),
            map_failures: get(&self.map_failures),
            hash_insert_failures: get(&self.hash_insert_failures),
            debt_deferred: get(&self.debt_deferred),
            refill_retry_starts: get(&self.refill_retry_starts),
            refill_retry_fires: get(&self.refill_retry_fires),
            batches: get(&self.batches),
            msdus_delivered: get(&self.msdus_delivered),
            bytes_delivered: get(&self.bytes_delivered),
            discarded: get(&self.discarded),
            integrity_diverted: get(&self.integrity_diverted),
            done_bit_retries: get(&self.done_bit_retries),
            len_invalid: get(&self.len_invalid),
            pop_failures: get(&self.pop_failures),
        }
    }
}

/// Why the datapath is asking its owner to recover.
///
/// All of these mean host and firmware disagree about ring contents; the
/// expected response is detach, device reset, reattach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// A completion named an address the host never posted.
    StaleCompletion { paddr: u64 },
    /// A completed buffer's done flag never came up.
    DescriptorNotReady { paddr: u64 },
    /// An indication named more buffers than the ring held.
    RingUnderrun,
}

/// Upcalls out of the datapath.
pub trait RxHooks: Send + Sync {
    /// An MSDU arrived with a firmware-flagged receive error and no discard
    /// flag. Counter-measure logic (and the buffer) belong to the owner now.
    fn integrity_failure(&self, msdu: Msdu);

    /// Ring state is beyond repair. The owner must stop feeding indications
    /// and detach.
    fn recover(&self, reason: RecoveryReason);
}

/// Failures surfaced by [`RxDevice::attach`].
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("initial ring fill posted no buffers")]
    InitialFillFailed,
    #[error("failed to spawn refill retry thread")]
    Spawn(#[from] std::io::Error),
}

/// The assembled receive datapath.
pub struct RxDevice {
    cfg: RxConfig,
    sched: Arc<RefillScheduler>,
    assembler: FrameAssembler,
    dma: Arc<dyn DmaDevice>,
    hooks: Arc<dyn RxHooks>,
    stats: Arc<RxStats>,
    dev_ring: Arc<DeviceVisible>,
    retry_thread: Option<JoinHandle<()>>,
}

impl RxDevice {
    /// Builds the datapath and fills the ring to its computed level.
    pub fn attach(
        cfg: RxConfig,
        dma: Arc<dyn DmaDevice>,
        hooks: Arc<dyn RxHooks>,
    ) -> Result<Self, AttachError> {
        let view = desc::make_view(cfg.format, cfg.endian);
        if cfg.buf_size <= view.reservation() {
            return Err(AttachError::InvalidConfig(
                "buf_size must exceed the descriptor reservation",
            ));
        }
        if !cfg.hash_buckets.is_power_of_two() {
            return Err(AttachError::InvalidConfig(
                "hash_buckets must be a power of two",
            ));
        }
        if cfg.max_throughput_mbps == 0 || cfg.avg_msdu_bytes == 0 {
            return Err(AttachError::InvalidConfig(
                "throughput and msdu size must be nonzero",
            ));
        }
        if !cfg.ring_size_min.is_power_of_two()
            || !cfg.ring_size_max.is_power_of_two()
            || cfg.ring_size_min > cfg.ring_size_max
        {
            return Err(AttachError::InvalidConfig(
                "ring size bounds must be ordered powers of two",
            ));
        }

        let ring_size = cfg.ring_size();
        let fill_level = cfg.fill_level(ring_size);
        let ring = RxRing::new(ring_size, fill_level);
        let dev_ring = ring.device_visible();
        let hash = cfg.reorder_offload.then(|| {
            BufferHashIndex::new(cfg.hash_buckets, cfg.hash_bucket_pool, cfg.hash_dynamic_max)
        });
        let stats = Arc::new(RxStats::default());
        let core = RingCore::new(
            ring,
            hash,
            Arc::clone(&view),
            cfg.buf_size,
            cfg.mark_paddr_high_bits,
        );
        let sched = Arc::new(RefillScheduler::new(
            core,
            cfg.refill_debt_max,
            cfg.refill_retry_interval,
            Arc::clone(&dma),
            Arc::clone(&stats),
        ));

        // The prime runs through the scheduler so a partial fill leaves
        // debt behind and the retry timer recovers the shortfall.
        let filled = sched.prime(fill_level as u32);
        if filled == 0 {
            return Err(AttachError::InitialFillFailed);
        }

        let retry_thread = refill::spawn_retry_thread(Arc::clone(&sched))?;
        trace::info!(ring_size, fill_level, filled, "rx attached");

        Ok(Self {
            assembler: FrameAssembler::new(view, cfg.endian),
            cfg,
            sched,
            dma,
            hooks,
            stats,
            dev_ring,
            retry_thread: Some(retry_thread),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RxConfig {
        &self.cfg
    }

    /// Handle for the device side of the ring (a device model polls this).
    #[must_use]
    pub fn device_ring(&self) -> Arc<DeviceVisible> {
        Arc::clone(&self.dev_ring)
    }

    #[must_use]
    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Buffers currently posted to the device.
    #[must_use]
    pub fn fill_cnt(&self) -> usize {
        self.sched.lock_core().ring().fill_cnt()
    }

    /// Outstanding refill debt.
    #[must_use]
    pub fn refill_debt(&self) -> u32 {
        self.sched.debt()
    }

    /// Processes one receive indication into a batch of deliverable frames.
    ///
    /// Integrity failures are routed to the hooks before this returns, so
    /// their relative order with the returned batch is preserved per call.
    /// Consumed buffers are replenished before returning.
    pub fn pop_frames(&self, msg: &[u8]) -> Result<FrameBatch, RxError> {
        let sequential = !self.cfg.reorder_offload;
        if sequential {
            self.sched.hold();
        }
        let result = {
            let mut core = self.sched.lock_core();
            self.assembler
                .assemble(msg, &mut core, self.dma.as_ref(), &self.stats)
        };
        match result {
            Ok(out) => {
                for msdu in out.diverted {
                    self.hooks.integrity_failure(msdu);
                }
                if sequential {
                    self.sched.release_and_replenish();
                } else {
                    self.sched.replenish(out.consumed);
                }
                Ok(out.batch)
            }
            Err(err) => {
                if sequential {
                    self.sched.release_and_replenish();
                }
                self.escalate(&err);
                Err(err)
            }
        }
    }

    /// Puts `n` buffers back on the ring on behalf of an external consumer
    /// (e.g. after an out-of-band completion path).
    pub fn replenish(&self, n: u32) {
        self.sched.replenish(n);
    }

    fn escalate(&self, err: &RxError) {
        let reason = match err {
            RxError::StaleCompletion { paddr } => RecoveryReason::StaleCompletion { paddr: *paddr },
            RxError::DescriptorNotReady { paddr } => {
                RecoveryReason::DescriptorNotReady { paddr: *paddr }
            }
            RxError::RingUnderrun { .. } => RecoveryReason::RingUnderrun,
            // A malformed message is dropped without touching the ring; no
            // recovery needed.
            RxError::Indication(_) => return,
        };
        self.stats.pop_failures.fetch_add(1, Ordering::Relaxed);
        trace::error!(?reason, "rx datapath desynchronized");
        self.hooks.recover(reason);
    }

    /// Stops the retry timer and releases every buffer. Equivalent to drop,
    /// but explicit at call sites that care about ordering.
    pub fn detach(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(handle) = self.retry_thread.take() else {
            return;
        };
        self.sched.shutdown_timer();
        let _ = handle.join();
        let _released = self.sched.lock_core().release_all(self.dma.as_ref());
        trace::info!(released = _released, "rx detached");
    }
}

impl Drop for RxDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}
