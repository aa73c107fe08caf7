//! Receive indication wire format.
//!
//! One indication message announces a batch of completed MSDUs: an 8-byte
//! header followed by one 16-byte record per MSDU. Records identify buffers
//! by the physical address the host published on the ring, and carry the
//! firmware's routing verdict for the payload.

use bitflags::bitflags;
use thiserror::Error;

use crate::config::Endian;
use crate::dma::PhysAddr;

/// Message type for an in-order/reorder-offload receive indication.
pub const MSG_TYPE_RX_IND: u8 = 0x12;

/// Indication header size.
pub const HEADER_BYTES: usize = 8;

/// Size of one per-MSDU record.
pub const RECORD_BYTES: usize = 16;

// Header word 0.
const MSG_TYPE_MASK: u32 = 0xff;
const EXT_TID_SHIFT: u32 = 8;
const EXT_TID_MASK: u32 = 0x1f;
const OFFLOAD_BIT: u32 = 1 << 13;
const FRAG_BIT: u32 = 1 << 14;
const PEER_ID_SHIFT: u32 = 16;

// Header word 1.
const MSDU_CNT_MASK: u32 = 0xffff;

// Record word 2.
const LEN_MASK: u32 = 0xffff;
const FW_DESC_SHIFT: u32 = 16;
const FW_DESC_MASK: u32 = 0xff;

bitflags! {
    /// Firmware routing verdict for one MSDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FwRxDesc: u8 {
        /// Drop without delivering.
        const DISCARD = 0x01;
        /// Forwardable within the BSS.
        const FORWARD = 0x02;
        /// Deliver to the host for inspection regardless of forwarding.
        const INSPECT = 0x04;
        /// Some receive error (decrypt/MIC/length) was detected.
        const ANY_ERR = 0x80;
    }
}

/// Parsed indication header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicationHeader {
    pub ext_tid: u8,
    pub offload: bool,
    pub frag: bool,
    pub peer_id: u16,
    pub msdu_cnt: u16,
}

/// One per-MSDU completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsduRecord {
    pub paddr: PhysAddr,
    pub len: u16,
    pub fw_desc: FwRxDesc,
}

/// Malformed indication messages.
///
/// These mean the transport handed us garbage; the caller drops the message
/// without touching ring state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndError {
    #[error("indication truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unexpected message type {0:#x}")]
    BadMsgType(u8),
}

/// A fully parsed indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    pub header: IndicationHeader,
    pub records: Vec<MsduRecord>,
}

/// Parses an indication message.
///
/// The record count is taken from the header; trailing bytes beyond the last
/// record are ignored (firmware pads uploads to its DMA granularity).
pub fn parse(endian: Endian, msg: &[u8]) -> Result<Indication, IndError> {
    if msg.len() < HEADER_BYTES {
        return Err(IndError::Truncated {
            need: HEADER_BYTES,
            have: msg.len(),
        });
    }
    let w0 = endian.word(msg, 0);
    let msg_type = (w0 & MSG_TYPE_MASK) as u8;
    if msg_type != MSG_TYPE_RX_IND {
        return Err(IndError::BadMsgType(msg_type));
    }
    let header = IndicationHeader {
        ext_tid: ((w0 >> EXT_TID_SHIFT) & EXT_TID_MASK) as u8,
        offload: w0 & OFFLOAD_BIT != 0,
        frag: w0 & FRAG_BIT != 0,
        peer_id: (w0 >> PEER_ID_SHIFT) as u16,
        msdu_cnt: (endian.word(msg, 4) & MSDU_CNT_MASK) as u16,
    };

    let need = HEADER_BYTES + usize::from(header.msdu_cnt) * RECORD_BYTES;
    if msg.len() < need {
        return Err(IndError::Truncated {
            need,
            have: msg.len(),
        });
    }

    let mut records = Vec::with_capacity(usize::from(header.msdu_cnt));
    for i in 0..usize::from(header.msdu_cnt) {
        let off = HEADER_BYTES + i * RECORD_BYTES;
        let paddr_lo = u64::from(endian.word(msg, off));
        let paddr_hi = u64::from(endian.word(msg, off + 4));
        let w2 = endian.word(msg, off + 8);
        records.push(MsduRecord {
            paddr: PhysAddr(paddr_lo | (paddr_hi << 32)),
            len: (w2 & LEN_MASK) as u16,
            fw_desc: FwRxDesc::from_bits_retain(((w2 >> FW_DESC_SHIFT) & FW_DESC_MASK) as u8),
        });
    }
    Ok(Indication { header, records })
}

/// Builds indication messages; the device side of the simulation.
#[derive(Debug, Clone, Default)]
pub struct IndicationBuilder {
    pub ext_tid: u8,
    pub offload: bool,
    pub frag: bool,
    pub peer_id: u16,
    records: Vec<MsduRecord>,
}

impl IndicationBuilder {
    #[must_use]
    pub fn new(peer_id: u16) -> Self {
        Self {
            peer_id,
            ..Self::default()
        }
    }

    pub fn push(&mut self, paddr: PhysAddr, len: u16, fw_desc: FwRxDesc) -> &mut Self {
        self.records.push(MsduRecord {
            paddr,
            len,
            fw_desc,
        });
        self
    }

    #[must_use]
    pub fn build(&self, endian: Endian) -> Vec<u8> {
        let mut msg = vec![0u8; HEADER_BYTES + self.records.len() * RECORD_BYTES];
        let mut w0 = u32::from(MSG_TYPE_RX_IND);
        w0 |= (u32::from(self.ext_tid) & EXT_TID_MASK) << EXT_TID_SHIFT;
        if self.offload {
            w0 |= OFFLOAD_BIT;
        }
        if self.frag {
            w0 |= FRAG_BIT;
        }
        w0 |= u32::from(self.peer_id) << PEER_ID_SHIFT;
        endian.put_word(&mut msg, 0, w0);
        endian.put_word(&mut msg, 4, self.records.len() as u32 & MSDU_CNT_MASK);
        for (i, rec) in self.records.iter().enumerate() {
            let off = HEADER_BYTES + i * RECORD_BYTES;
            endian.put_word(&mut msg, off, (rec.paddr.0 & 0xffff_ffff) as u32);
            endian.put_word(&mut msg, off + 4, (rec.paddr.0 >> 32) as u32);
            let w2 = u32::from(rec.len) | (u32::from(rec.fw_desc.bits()) << FW_DESC_SHIFT);
            endian.put_word(&mut msg, off + 8, w2);
        }
        msg
    }
}
