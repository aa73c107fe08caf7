//! Frame assembly from completed ring buffers.
//!
//! An indication message drives each assembly pass: every record resolves to
//! one ring buffer (by published address in reorder-offload mode, by ring
//! order otherwise), its descriptor is distilled into [`MsduMeta`], and the
//! payload windows are handed to the consumer as [`Msdu`]s grouped in a
//! [`FrameBatch`]. MSDUs spanning multiple ring buffers are reassembled from
//! consecutive ring slots.
//!
//! Delivery order follows record order. MSDUs the firmware marked for
//! discard are freed here; error-flagged ones (without a discard flag) are
//! split out for the error sink without disturbing the order of the rest.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::Endian;
use crate::desc::{ChannelInfo, DescriptorView};
use crate::device::RxStats;
use crate::dma::{DmaBuf, DmaDevice, DmaDirection};
use crate::ring::refill::RingCore;
use crate::rx::checksum::{self, CksumResult};
use crate::rx::indication::{self, FwRxDesc, IndError, IndicationHeader, MsduRecord};
use crate::trace;

// A completion can outrun the DMA write it announces by a little; a done bit
// that stays clear past these retries means the ring is desynchronized.
const DONE_BIT_RETRIES: u32 = 5;
const DONE_BIT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Receive-path failures.
///
/// Everything except `Indication` means host and firmware disagree about
/// ring contents; the caller escalates those to recovery instead of limping
/// on with a corrupt ring.
#[derive(Debug, Error)]
pub enum RxError {
    #[error(transparent)]
    Indication(#[from] IndError),
    #[error("completion for unindexed paddr {paddr:#x}")]
    StaleCompletion { paddr: u64 },
    #[error("ring underrun: indication names {wanted} msdus, ring held {available}")]
    RingUnderrun { wanted: u16, available: usize },
    #[error("descriptor done bit never set for paddr {paddr:#x}")]
    DescriptorNotReady { paddr: u64 },
}

/// Per-MSDU facts distilled from the descriptor and the indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsduMeta {
    pub peer_id: u16,
    pub ext_tid: u8,
    pub tid: u8,
    pub seq_num: u16,
    pub first_msdu: bool,
    pub last_msdu: bool,
    pub retry: bool,
    pub encrypted: bool,
    pub key_id: Option<u8>,
    /// `None` when this descriptor's multicast flag is not valid.
    pub mcast: Option<bool>,
    pub is_frag: bool,
    pub fw_desc: FwRxDesc,
    pub cksum: CksumResult,
    pub len_invalid: bool,
    pub chan_info: Option<ChannelInfo>,
}

/// One delivered MSDU: payload segments plus metadata.
///
/// Multi-buffer MSDUs keep their ring buffers as separate segments; the
/// consumer decides whether to linearize.
#[derive(Debug)]
pub struct Msdu {
    pub meta: MsduMeta,
    segments: Vec<DmaBuf>,
}

impl Msdu {
    /// Total payload length across all segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(DmaBuf::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn segments(&self) -> &[DmaBuf] {
        &self.segments
    }

    /// Copies the payload into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg.data());
        }
        out
    }

    /// Takes ownership of the underlying buffers, e.g. to return them to the
    /// allocator.
    #[must_use]
    pub fn into_segments(self) -> Vec<DmaBuf> {
        self.segments
    }
}

/// One indication's worth of deliverable MSDUs.
#[derive(Debug)]
pub struct FrameBatch {
    pub peer_id: u16,
    pub ext_tid: u8,
    pub frag: bool,
    /// The firmware tagged this batch for its offload delivery path.
    pub offload: bool,
    pub msdus: Vec<Msdu>,
}

/// Result of one assembly pass.
#[derive(Debug)]
pub struct AssembleOutput {
    pub batch: FrameBatch,
    /// MSDUs the firmware flagged with a receive error but not a discard,
    /// in pop order. Routed to the integrity-failure sink, not the data
    /// path.
    pub diverted: Vec<Msdu>,
    /// Ring buffers consumed, for the replenish that follows.
    pub consumed: u32,
}

/// Turns indication messages plus ring state into frame batches.
pub struct FrameAssembler {
    view: Arc<dyn DescriptorView>,
    endian: Endian,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(view: Arc<dyn DescriptorView>, endian: Endian) -> Self {
        Self { view, endian }
    }

    /// Processes one indication message against the ring.
    ///
    /// The caller holds the refill lock (it owns the `RingCore` borrow) and
    /// replenishes `consumed` buffers afterwards.
    pub fn assemble(
        &self,
        msg: &[u8],
        core: &mut RingCore,
        dma: &dyn DmaDevice,
        stats: &RxStats,
    ) -> Result<AssembleOutput, RxError> {
        let ind = indication::parse(self.endian, msg)?;
        let mut batch = FrameBatch {
            peer_id: ind.header.peer_id,
            ext_tid: ind.header.ext_tid,
            frag: ind.header.frag,
            offload: ind.header.offload,
            msdus: Vec::with_capacity(ind.records.len()),
        };
        let mut diverted = Vec::new();
        let mut consumed = 0u32;

        for rec in &ind.records {
            let msdu = self.pop_one(rec, &ind.header, core, dma, stats, &mut consumed)?;

            if msdu.meta.fw_desc.contains(FwRxDesc::DISCARD) {
                stats.discarded.fetch_add(1, Ordering::Relaxed);
                free_msdu(msdu, dma);
                continue;
            }
            if msdu.meta.fw_desc.contains(FwRxDesc::ANY_ERR) {
                stats.integrity_diverted.fetch_add(1, Ordering::Relaxed);
                diverted.push(msdu);
                continue;
            }

            stats.msdus_delivered.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_delivered
                .fetch_add(msdu.len() as u64, Ordering::Relaxed);
            batch.msdus.push(msdu);
        }
        stats.batches.fetch_add(1, Ordering::Relaxed);
        trace::trace!(
            peer_id = batch.peer_id,
            delivered = batch.msdus.len(),
            diverted = diverted.len(),
            consumed,
            "assembled batch"
        );
        Ok(AssembleOutput {
            batch,
            diverted,
            consumed,
        })
    }

    /// Resolves one record to its buffer(s) and distills the descriptor.
    fn pop_one(
        &self,
        rec: &MsduRecord,
        header: &IndicationHeader,
        core: &mut RingCore,
        dma: &dyn DmaDevice,
        stats: &RxStats,
        consumed: &mut u32,
    ) -> Result<Msdu, RxError> {
        let indexed = core.hash.is_some();
        let mut buf = match core.hash.as_mut() {
            Some(hash) => {
                let paddr = rec.paddr.trim();
                let buf = hash
                    .remove(paddr.0)
                    .map_err(|_| RxError::StaleCompletion { paddr: paddr.0 })?;
                core.ring.note_consumed(1);
                buf
            }
            None => core.ring.pop_next().ok_or(RxError::RingUnderrun {
                wanted: header.msdu_cnt,
                available: 0,
            })?,
        };
        *consumed += 1;
        let src_paddr = buf.paddr().map_or(rec.paddr.trim().0, |p| p.trim().0);

        if let Err(err) = self.wait_done(&buf, src_paddr, stats) {
            dma.unmap(&mut buf, DmaDirection::FromDevice);
            dma.free(buf);
            return Err(err);
        }
        dma.unmap(&mut buf, DmaDirection::FromDevice);

        let view = self.view.as_ref();
        let reservation = view.reservation();
        let desc = &buf.data()[..reservation];
        let mut meta = MsduMeta {
            peer_id: header.peer_id,
            ext_tid: header.ext_tid,
            tid: view.tid(desc),
            seq_num: view.seq_num(desc),
            first_msdu: view.first_msdu(desc),
            last_msdu: view.last_msdu(desc),
            retry: view.retry(desc),
            encrypted: view.is_encrypted(desc),
            key_id: view.key_id(desc),
            mcast: view.has_mcast_flag(desc).then(|| view.is_mcast(desc)),
            is_frag: header.frag || view.is_frag(desc),
            fw_desc: rec.fw_desc,
            cksum: checksum::map_cksum(view.checksum_flags(desc)),
            len_invalid: view.len_invalid(desc),
            chan_info: view.chan_info(desc),
        };
        // Indexed completions carry the authoritative length in the record;
        // sequential ones report it through the descriptor, and may span
        // additional ring buffers.
        let (msdu_len, more) = if indexed {
            (usize::from(rec.len), 0)
        } else {
            (view.msdu_len(desc), view.more_buffers(desc))
        };

        buf.pull_head(reservation);
        let payload_cap = buf.len();
        let span_cap = payload_cap * (1 + more as usize);
        let mut remaining = msdu_len;
        if remaining > span_cap {
            trace::warn!(
                src_paddr,
                msdu_len,
                span_cap,
                "descriptor length exceeds buffer span"
            );
            stats.len_invalid.fetch_add(1, Ordering::Relaxed);
            meta.len_invalid = true;
            remaining = span_cap;
        }

        let take = remaining.min(payload_cap);
        buf.trim_tail(buf.len() - take);
        remaining -= take;
        let mut segments = Vec::with_capacity(1 + more as usize);
        segments.push(buf);

        for _ in 0..more {
            let Some(mut cont) = core.ring.pop_next() else {
                let available = core.ring.fill_cnt();
                for seg in segments {
                    dma.free(seg);
                }
                return Err(RxError::RingUnderrun {
                    wanted: header.msdu_cnt,
                    available,
                });
            };
            *consumed += 1;
            dma.unmap(&mut cont, DmaDirection::FromDevice);
            cont.pull_head(reservation);
            let take = remaining.min(cont.len());
            cont.trim_tail(cont.len() - take);
            remaining -= take;
            segments.push(cont);
        }

        Ok(Msdu { meta, segments })
    }

    /// Waits for the DMA-done flag while the buffer is still device-owned.
    ///
    /// Peeking at the descriptor of a mapped buffer is the one sanctioned
    /// exception to the ownership rule; the mapping stays intact so a
    /// straggling device write can still land between retries.
    fn wait_done(&self, buf: &DmaBuf, paddr: u64, stats: &RxStats) -> Result<(), RxError> {
        let mut attempts = 0;
        while !self.view.msdu_done(&buf.data()[..self.view.reservation()]) {
            if attempts == DONE_BIT_RETRIES {
                return Err(RxError::DescriptorNotReady { paddr });
            }
            attempts += 1;
            stats.done_bit_retries.fetch_add(1, Ordering::Relaxed);
            thread::sleep(DONE_BIT_RETRY_DELAY);
        }
        Ok(())
    }
}

fn free_msdu(msdu: Msdu, dma: &dyn DmaDevice) {
    for seg in msdu.into_segments() {
        dma.free(seg);
    }
}
