//! Refill coordination.
//!
//! Two contexts want to put buffers back on the ring: the indication path
//! (replenishing what it just consumed) and the retry timer (working off
//! earlier shortfalls). A single mutex serializes ring mutation; the
//! indication path never blocks on it. When the lock is contended, the
//! consumed count is deferred into an atomic debt counter instead, up to a
//! cap past which the caller blocks rather than let debt grow without bound.
//! Whoever holds the lock settles the accumulated debt along with its own
//! contribution.
//!
//! Allocation failures become debt too, and arm a one-shot retry timer so
//! the ring recovers once memory pressure clears.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::desc::DescriptorView;
use crate::device::RxStats;
use crate::dma::{DmaDevice, DmaDirection};
use crate::ring::hash::BufferHashIndex;
use crate::ring::rx_ring::RxRing;
use crate::trace;

/// Ring state guarded by the refill lock.
pub struct RingCore {
    pub(crate) ring: RxRing,
    pub(crate) hash: Option<BufferHashIndex>,
    pub(crate) view: Arc<dyn DescriptorView>,
    buf_size: usize,
    mark_paddr: bool,
}

impl RingCore {
    #[must_use]
    pub fn new(
        ring: RxRing,
        hash: Option<BufferHashIndex>,
        view: Arc<dyn DescriptorView>,
        buf_size: usize,
        mark_paddr: bool,
    ) -> Self {
        Self {
            ring,
            hash,
            view,
            buf_size,
            mark_paddr,
        }
    }

    #[must_use]
    pub fn ring(&self) -> &RxRing {
        &self.ring
    }

    /// Allocates, maps and posts up to `n` buffers; returns how many were
    /// actually posted.
    ///
    /// Allocation failure stops the burst (memory pressure affects every
    /// subsequent attempt equally); a map failure only costs its own
    /// attempt. The device sees nothing until the final single index
    /// publish.
    pub fn fill_n(&mut self, dma: &dyn DmaDevice, n: usize, stats: &RxStats) -> usize {
        let n = n.min(self.ring.space());
        let mut filled = 0;
        for _ in 0..n {
            let mut buf = match dma.alloc(self.buf_size) {
                Ok(buf) => buf,
                Err(_err) => {
                    trace::debug!(err = %_err, filled, "refill alloc failed");
                    stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            buf.set_full_len();
            let reservation = self.view.reservation();
            self.view
                .clear_attention(&mut buf.data_mut()[..reservation]);

            let paddr = match dma.map(&mut buf, DmaDirection::FromDevice) {
                Ok(paddr) => paddr.trim(),
                Err(_err) => {
                    trace::debug!(err = %_err, "refill map failed");
                    stats.map_failures.fetch_add(1, Ordering::Relaxed);
                    dma.free(buf);
                    continue;
                }
            };
            let published = if self.mark_paddr {
                paddr.mark_high_bits()
            } else {
                paddr
            };

            match &mut self.hash {
                Some(hash) => {
                    if let Err((_err, mut buf)) = hash.insert(paddr.0, buf) {
                        trace::warn!(err = %_err, %paddr, "hash insert failed, dropping buffer");
                        stats.hash_insert_failures.fetch_add(1, Ordering::Relaxed);
                        dma.unmap(&mut buf, DmaDirection::FromDevice);
                        dma.free(buf);
                        continue;
                    }
                    self.ring.stage(published.0, None);
                }
                None => self.ring.stage(published.0, Some(buf)),
            }
            filled += 1;
        }
        if filled > 0 {
            self.ring.publish();
            stats.buffers_posted.fetch_add(filled as u64, Ordering::Relaxed);
        }
        filled
    }

    /// Unmaps and frees every buffer the core still owns. Teardown only.
    pub fn release_all(&mut self, dma: &dyn DmaDevice) -> usize {
        let mut bufs = self.ring.drain();
        if let Some(hash) = &mut self.hash {
            let n = hash.len();
            bufs.extend(hash.drain());
            self.ring.note_consumed(n);
        }
        let released = bufs.len();
        for mut buf in bufs {
            dma.unmap(&mut buf, DmaDirection::FromDevice);
            dma.free(buf);
        }
        released
    }
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

/// One-shot retry timer. Armed by refill shortfalls, fired by a dedicated
/// thread, disarmed when it fires.
struct RetryTimer {
    state: Mutex<TimerState>,
    cv: Condvar,
}

impl RetryTimer {
    fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms the timer unless it is already pending. Returns whether this
    /// call armed it.
    fn arm(&self, interval: Duration) -> bool {
        let mut st = self.lock();
        if st.shutdown || st.deadline.is_some() {
            return false;
        }
        st.deadline = Some(Instant::now() + interval);
        self.cv.notify_one();
        true
    }

    fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cv.notify_one();
    }
}

/// Serializes ring refills and carries the debt counter.
pub struct RefillScheduler {
    core: Mutex<RingCore>,
    debt: AtomicU32,
    debt_max: u32,
    refill_ref_cnt: AtomicI32,
    retry_interval: Duration,
    timer: RetryTimer,
    dma: Arc<dyn DmaDevice>,
    stats: Arc<RxStats>,
}

impl RefillScheduler {
    #[must_use]
    pub fn new(
        core: RingCore,
        debt_max: u32,
        retry_interval: Duration,
        dma: Arc<dyn DmaDevice>,
        stats: Arc<RxStats>,
    ) -> Self {
        Self {
            core: Mutex::new(core),
            debt: AtomicU32::new(0),
            debt_max,
            refill_ref_cnt: AtomicI32::new(0),
            retry_interval,
            timer: RetryTimer::new(),
            dma,
            stats,
        }
    }

    /// Exclusive access to the ring state, for the indication path.
    pub fn lock_core(&self) -> MutexGuard<'_, RingCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outstanding refill debt.
    #[must_use]
    pub fn debt(&self) -> u32 {
        self.debt.load(Ordering::Acquire)
    }

    /// Puts `n` consumed buffers back on the ring, or defers them as debt
    /// when another context holds the refill lock.
    ///
    /// Only blocks when the debt counter has hit its cap; at that point
    /// deferring further would let a stalled lock holder starve the ring.
    pub fn replenish(&self, n: u32) {
        match self.core.try_lock() {
            Ok(mut core) => {
                self.fill_locked(&mut core, n);
            }
            Err(TryLockError::WouldBlock) => {
                if self.debt.load(Ordering::Acquire) < self.debt_max {
                    self.debt.fetch_add(n, Ordering::AcqRel);
                    self.stats.debt_deferred.fetch_add(1, Ordering::Relaxed);
                } else {
                    let mut core = self.lock_core();
                    self.fill_locked(&mut core, n);
                }
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                self.fill_locked(&mut poisoned.into_inner(), n);
            }
        }
    }

    /// Settles `n` plus any deferred debt while holding the lock. Returns
    /// how many buffers were actually posted.
    fn fill_locked(&self, core: &mut RingCore, n: u32) -> usize {
        let want = (n + self.debt.swap(0, Ordering::AcqRel)) as usize;
        let want = want.min(core.ring.space());
        if want == 0 {
            return 0;
        }
        let filled = core.fill_n(self.dma.as_ref(), want, &self.stats);
        if filled < want {
            let shortfall = (want - filled) as u32;
            self.debt.fetch_add(shortfall, Ordering::AcqRel);
            if self.timer.arm(self.retry_interval) {
                self.stats.refill_retry_starts.fetch_add(1, Ordering::Relaxed);
                trace::debug!(shortfall, "refill shortfall, retry timer armed");
            }
        }
        filled
    }

    /// Initial ring prime, run once at attach before indications flow.
    ///
    /// Goes through the same reconciling path as every later refill, so a
    /// shortfall during the prime becomes debt and arms the retry timer
    /// instead of leaving the ring under its fill level for good. Arming
    /// before the retry thread starts is fine; the thread picks up a
    /// pending deadline on entry.
    pub fn prime(&self, n: u32) -> usize {
        let mut core = self.lock_core();
        self.fill_locked(&mut core, n)
    }

    /// Marks the start of a nested pop sequence (sequential mode). Refill is
    /// deferred until the matching [`Self::release_and_replenish`].
    pub fn hold(&self) {
        self.refill_ref_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Ends a nested pop sequence; the last one out tops the ring back up
    /// to its fill level.
    pub fn release_and_replenish(&self) {
        if self.refill_ref_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut core = self.lock_core();
            let space = core.ring.space() as u32;
            self.fill_locked(&mut core, space);
        }
    }

    /// Retry-timer entry point: settle whatever debt is outstanding,
    /// blocking on the lock (there is no hot path to protect here).
    fn retry_fire(&self) {
        self.stats.refill_retry_fires.fetch_add(1, Ordering::Relaxed);
        let mut core = self.lock_core();
        self.fill_locked(&mut core, 0);
    }

    /// Stops the retry timer thread. Must be called before teardown.
    pub fn shutdown_timer(&self) {
        self.timer.shutdown();
    }
}

/// Spawns the thread that services the refill retry timer.
pub fn spawn_retry_thread(sched: Arc<RefillScheduler>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rx-refill-retry".into())
        .spawn(move || {
            let mut st = sched.timer.lock();
            loop {
                if st.shutdown {
                    return;
                }
                match st.deadline {
                    None => {
                        st = sched
                            .timer
                            .cv
                            .wait(st)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            st.deadline = None;
                            drop(st);
                            sched.retry_fire();
                            st = sched.timer.lock();
                        } else {
                            let (guard, _) = sched
                                .timer
                                .cv
                                .wait_timeout(st, deadline - now)
                                .unwrap_or_else(PoisonError::into_inner);
                            st = guard;
                        }
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DescFormat, Endian};
    use crate::desc::{self, PnWidth};
    use crate::dma::HeapDma;

    fn core(size: usize, fill_level: usize, hashed: bool) -> RingCore {
        let view = desc::make_view(DescFormat::LowLatency, Endian::Little);
        let hash = hashed.then(|| BufferHashIndex::new(64, 4, 256));
        RingCore::new(RxRing::new(size, fill_level), hash, view, 256, false)
    }

    fn sched(core: RingCore, dma: Arc<HeapDma>) -> Arc<RefillScheduler> {
        Arc::new(RefillScheduler::new(
            core,
            8,
            Duration::from_millis(5),
            dma,
            Arc::new(RxStats::default()),
        ))
    }

    #[test]
    fn fill_n_posts_and_publishes() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 12, false);
        assert_eq!(core.fill_n(&dma, 12, &stats), 12);
        assert_eq!(core.ring.fill_cnt(), 12);
        assert_eq!(core.ring.device_visible().alloc_idx(), 12);
        assert_eq!(dma.mapped_count(), 12);
    }

    #[test]
    fn fill_n_never_exceeds_fill_level() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 6, false);
        assert_eq!(core.fill_n(&dma, 100, &stats), 6);
        assert_eq!(core.ring.space(), 0);
    }

    #[test]
    fn alloc_failure_stops_the_burst() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 12, false);
        dma.fail_next_allocs(1);
        assert_eq!(core.fill_n(&dma, 4, &stats), 0);
        assert_eq!(stats.alloc_failures.load(Ordering::Relaxed), 1);
        assert_eq!(core.ring.device_visible().alloc_idx(), 0);
    }

    #[test]
    fn map_failure_costs_one_attempt() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 12, false);
        dma.fail_next_maps(1);
        assert_eq!(core.fill_n(&dma, 4, &stats), 3);
        assert_eq!(stats.map_failures.load(Ordering::Relaxed), 1);
        assert_eq!(dma.outstanding(), 3);
    }

    #[test]
    fn posted_descriptors_have_attention_cleared() {
        // Stale done bits must not survive buffer recycling.
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let view = desc::make_view(DescFormat::LowLatency, Endian::Little);
        let mut core = core(8, 4, false);
        core.fill_n(&dma, 1, &stats);
        let mut buf = core.ring.pop_next().unwrap();
        dma.unmap(&mut buf, DmaDirection::FromDevice);
        let reservation = view.reservation();
        assert!(!view.msdu_done(&buf.data()[..reservation]));
        assert!(view.pn(&buf.data()[..reservation], PnWidth::Pn24).is_ok());
        dma.free(buf);
    }

    #[test]
    fn hashed_fill_indexes_instead_of_shadowing() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 8, true);
        core.fill_n(&dma, 8, &stats);
        assert_eq!(core.hash.as_ref().map(BufferHashIndex::len), Some(8));
        assert!(core.ring.pop_next().is_none());
    }

    #[test]
    fn replenish_settles_deferred_debt() {
        let dma = Arc::new(HeapDma::new());
        let sched = sched(core(32, 24, false), Arc::clone(&dma));
        {
            let _guard = sched.lock_core();
            sched.replenish(5);
            sched.replenish(3);
            assert_eq!(sched.debt(), 8);
        }
        sched.replenish(0);
        assert_eq!(sched.debt(), 0);
        assert_eq!(sched.lock_core().ring().fill_cnt(), 8);
    }

    #[test]
    fn prime_shortfall_becomes_debt() {
        let dma = Arc::new(HeapDma::new());
        let sched = sched(core(32, 24, false), Arc::clone(&dma));
        dma.fail_next_allocs(100);
        assert_eq!(sched.prime(24), 0);
        assert_eq!(sched.debt(), 24);

        dma.fail_next_allocs(0);
        sched.replenish(0);
        assert_eq!(sched.debt(), 0);
        assert_eq!(sched.lock_core().ring().fill_cnt(), 24);
        sched.shutdown_timer();
    }

    #[test]
    fn shortfall_re_arms_debt() {
        let dma = Arc::new(HeapDma::new());
        let sched = sched(core(32, 24, false), Arc::clone(&dma));
        dma.fail_next_allocs(100);
        sched.replenish(10);
        assert_eq!(sched.debt(), 10);
        sched.shutdown_timer();
    }

    #[test]
    fn retry_thread_recovers_after_alloc_pressure() {
        let dma = Arc::new(HeapDma::new());
        let sched = sched(core(32, 24, false), Arc::clone(&dma));
        let handle = spawn_retry_thread(Arc::clone(&sched)).unwrap();

        dma.fail_next_allocs(100);
        sched.replenish(10);
        assert_eq!(sched.debt(), 10);
        dma.fail_next_allocs(0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sched.debt() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(sched.debt(), 0);
        assert_eq!(sched.lock_core().ring().fill_cnt(), 10);

        sched.shutdown_timer();
        handle.join().unwrap();
    }

    #[test]
    fn ref_counted_replenish_waits_for_last_holder() {
        let dma = Arc::new(HeapDma::new());
        let sched = sched(core(32, 16, false), Arc::clone(&dma));
        sched.hold();
        sched.hold();
        sched.release_and_replenish();
        assert_eq!(sched.lock_core().ring().fill_cnt(), 0);
        sched.release_and_replenish();
        assert_eq!(sched.lock_core().ring().fill_cnt(), 16);
    }

    #[test]
    fn release_all_returns_every_buffer() {
        let dma = HeapDma::new();
        let stats = RxStats::default();
        let mut core = core(16, 8, true);
        core.fill_n(&dma, 8, &stats);
        assert_eq!(core.release_all(&dma), 8);
        assert_eq!(dma.outstanding(), 0);
        assert_eq!(dma.mapped_count(), 0);
    }
}
