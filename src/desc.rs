//! Format-specific descriptor accessors.
//!
//! Two incompatible wire layouts describe a received MSDU: the low-latency
//! layout written by hardware into the head of each receive buffer, and the
//! high-latency layout written by firmware. [`DescriptorView`] is the uniform
//! access contract over both; one implementation is constructed at attach
//! (with the host's byte order baked in) and held for the device's lifetime.
//! Nothing branches on the format per packet.
//!
//! All accessors are masked shifts over the raw byte region. The layouts are
//! never overlaid with `repr(C)` structs, so host byte order and alignment
//! cannot corrupt a parse.

pub mod hl;
pub mod ll;

use std::sync::Arc;

use thiserror::Error;

use crate::config::{DescFormat, Endian};

/// TID value reported when the descriptor format carries none.
pub const INVALID_TID: u8 = 0xff;

/// Width of the replay-protection packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnWidth {
    Pn24,
    Pn48,
    Pn128,
}

/// Packet number assembled from the descriptor's PN sub-fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNumber {
    pub width: PnWidth,
    pub value: u128,
}

/// Channel information carried by first-MSDU high-latency descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub primary_mhz: u16,
    pub contig1_mhz: u16,
    pub contig2_mhz: u16,
    pub phy_mode: u8,
}

/// Protocol/fragmentation facts feeding the checksum-result mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CksumFlags {
    pub tcp: bool,
    pub udp: bool,
    pub ipv6: bool,
    pub ip_frag: bool,
    pub l4_fail: bool,
}

/// Errors from descriptor field extraction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescError {
    #[error("descriptor region truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("pn width {0:?} not carried by this descriptor format")]
    UnsupportedPnWidth(PnWidth),
    #[error("field only valid on a first-MSDU descriptor")]
    NotFirstMsdu,
}

/// Uniform accessor contract over one descriptor wire layout.
///
/// `desc` is always the buffer's reserved descriptor region, exactly
/// [`DescriptorView::reservation`] bytes long. Callers length-check once per
/// buffer; accessors may assume the region is in bounds.
pub trait DescriptorView: Send + Sync {
    /// Bytes reserved at the head of every receive buffer for this layout.
    fn reservation(&self) -> usize;

    /// Clears the hardware attention/done field before the buffer is posted
    /// to the ring, so a stale done bit can never be mistaken for a fresh
    /// completion.
    fn clear_attention(&self, desc: &mut [u8]);

    /// Hardware "done" flag: the DMA engine finished writing this buffer.
    fn msdu_done(&self, desc: &[u8]) -> bool;

    /// Payload length in bytes as reported by the descriptor.
    fn msdu_len(&self, desc: &[u8]) -> usize;

    /// Number of additional ring buffers this MSDU spans.
    fn more_buffers(&self, desc: &[u8]) -> u32;

    /// Hardware flagged the reported length as inconsistent.
    fn len_invalid(&self, desc: &[u8]) -> bool;

    /// This descriptor starts an MPDU.
    fn first_msdu(&self, desc: &[u8]) -> bool;

    /// This MSDU completes its MPDU.
    fn last_msdu(&self, desc: &[u8]) -> bool;

    /// 802.11 retry bit.
    fn retry(&self, desc: &[u8]) -> bool;

    /// 802.11 sequence number.
    fn seq_num(&self, desc: &[u8]) -> u16;

    /// Replay-protection packet number at the requested width.
    fn pn(&self, desc: &[u8], width: PnWidth) -> Result<PacketNumber, DescError>;

    /// Traffic identifier from the QoS control field, or [`INVALID_TID`].
    fn tid(&self, desc: &[u8]) -> u8;

    /// Whether the multicast flag below is valid for this descriptor.
    fn has_mcast_flag(&self, desc: &[u8]) -> bool;

    /// Multicast/broadcast destination.
    fn is_mcast(&self, desc: &[u8]) -> bool;

    /// 802.11 fragment (not to be confused with IP fragmentation).
    fn is_frag(&self, desc: &[u8]) -> bool;

    /// MPDU was received encrypted.
    fn is_encrypted(&self, desc: &[u8]) -> bool;

    /// Key id octet, when the descriptor carries one.
    fn key_id(&self, desc: &[u8]) -> Option<u8>;

    /// Channel information, when present.
    fn chan_info(&self, desc: &[u8]) -> Option<ChannelInfo>;

    /// Protocol facts for the checksum-offload result mapping.
    fn checksum_flags(&self, desc: &[u8]) -> CksumFlags;
}

/// Constructs the view for the configured format, once, at attach.
#[must_use]
pub fn make_view(format: DescFormat, endian: Endian) -> Arc<dyn DescriptorView> {
    match format {
        DescFormat::LowLatency => Arc::new(ll::LlView::new(endian)),
        DescFormat::HighLatency => Arc::new(hl::HlView::new(endian)),
    }
}
