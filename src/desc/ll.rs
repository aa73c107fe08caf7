//! Low-latency descriptor layout.
//!
//! The DMA engine writes this descriptor into the first 20 bytes of each
//! receive buffer, ahead of the payload. Word 0 is the attention field; it is
//! the only word the host ever writes (to zero, before posting the buffer).

use crate::config::Endian;

use super::{ChannelInfo, CksumFlags, DescError, DescriptorView, PacketNumber, PnWidth};

/// Bytes reserved at the head of each receive buffer.
pub const RESERVATION: usize = 20;

// Word 0: attention.
const W0_OFF: usize = 0;
const ATTN_MSDU_DONE: u32 = 1 << 0;
const ATTN_CKSUM_FAIL: u32 = 1 << 1;
const ATTN_LEN_ERR: u32 = 1 << 2;
const ATTN_MCAST_BCAST: u32 = 1 << 3;
const ATTN_FRAGMENT: u32 = 1 << 4;

// Word 1: MPDU start.
const W1_OFF: usize = 4;
const MPDU_SEQ_MASK: u32 = 0xfff;
const MPDU_RETRY: u32 = 1 << 12;
const MPDU_ENCRYPTED: u32 = 1 << 13;
const MPDU_TID_SHIFT: u32 = 14;
const MPDU_TID_MASK: u32 = 0xf;
const MPDU_KEY_ID_SHIFT: u32 = 18;
const MPDU_KEY_ID_MASK: u32 = 0xff;
const MPDU_MORE_BUFS_SHIFT: u32 = 26;
const MPDU_MORE_BUFS_MASK: u32 = 0x3f;

// Word 2: MSDU start/end.
const W2_OFF: usize = 8;
const MSDU_LEN_MASK: u32 = 0xffff;
const MSDU_TCP: u32 = 1 << 16;
const MSDU_UDP: u32 = 1 << 17;
const MSDU_IPV6: u32 = 1 << 18;
const MSDU_IP_FRAG: u32 = 1 << 19;
const MSDU_FIRST: u32 = 1 << 20;
const MSDU_LAST: u32 = 1 << 21;

// Words 3-4: packet number.
const W3_OFF: usize = 12;
const W4_OFF: usize = 16;

/// Accessors for the hardware-written receive descriptor.
pub struct LlView {
    endian: Endian,
}

impl LlView {
    #[must_use]
    pub fn new(endian: Endian) -> Self {
        Self { endian }
    }

    #[inline]
    fn w(&self, desc: &[u8], off: usize) -> u32 {
        self.endian.word(desc, off)
    }
}

impl DescriptorView for LlView {
    fn reservation(&self) -> usize {
        RESERVATION
    }

    fn clear_attention(&self, desc: &mut [u8]) {
        self.endian.put_word(desc, W0_OFF, 0);
    }

    fn msdu_done(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & ATTN_MSDU_DONE != 0
    }

    fn msdu_len(&self, desc: &[u8]) -> usize {
        (self.w(desc, W2_OFF) & MSDU_LEN_MASK) as usize
    }

    fn more_buffers(&self, desc: &[u8]) -> u32 {
        (self.w(desc, W1_OFF) >> MPDU_MORE_BUFS_SHIFT) & MPDU_MORE_BUFS_MASK
    }

    fn len_invalid(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & ATTN_LEN_ERR != 0
    }

    fn first_msdu(&self, desc: &[u8]) -> bool {
        self.w(desc, W2_OFF) & MSDU_FIRST != 0
    }

    fn last_msdu(&self, desc: &[u8]) -> bool {
        self.w(desc, W2_OFF) & MSDU_LAST != 0
    }

    fn retry(&self, desc: &[u8]) -> bool {
        self.w(desc, W1_OFF) & MPDU_RETRY != 0
    }

    fn seq_num(&self, desc: &[u8]) -> u16 {
        (self.w(desc, W1_OFF) & MPDU_SEQ_MASK) as u16
    }

    fn pn(&self, desc: &[u8], width: PnWidth) -> Result<PacketNumber, DescError> {
        let lo = u64::from(self.w(desc, W3_OFF));
        let value = match width {
            PnWidth::Pn24 => u128::from(lo & 0xff_ffff),
            PnWidth::Pn48 => {
                let hi = u64::from(self.w(desc, W4_OFF) & 0xffff);
                u128::from(lo | (hi << 32))
            }
            // The hardware descriptor only stores 48 PN bits; WAPI-width
            // numbers arrive via the firmware-written layout.
            PnWidth::Pn128 => return Err(DescError::UnsupportedPnWidth(width)),
        };
        Ok(PacketNumber { width, value })
    }

    fn tid(&self, desc: &[u8]) -> u8 {
        ((self.w(desc, W1_OFF) >> MPDU_TID_SHIFT) & MPDU_TID_MASK) as u8
    }

    fn has_mcast_flag(&self, desc: &[u8]) -> bool {
        // The attention mcast bit is only evaluated for the MPDU's first
        // MSDU; on continuations it reflects stale state.
        self.first_msdu(desc)
    }

    fn is_mcast(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & ATTN_MCAST_BCAST != 0
    }

    fn is_frag(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & ATTN_FRAGMENT != 0
    }

    fn is_encrypted(&self, desc: &[u8]) -> bool {
        self.w(desc, W1_OFF) & MPDU_ENCRYPTED != 0
    }

    fn key_id(&self, desc: &[u8]) -> Option<u8> {
        if !self.first_msdu(desc) {
            return None;
        }
        Some(((self.w(desc, W1_OFF) >> MPDU_KEY_ID_SHIFT) & MPDU_KEY_ID_MASK) as u8)
    }

    fn chan_info(&self, _desc: &[u8]) -> Option<ChannelInfo> {
        None
    }

    fn checksum_flags(&self, desc: &[u8]) -> CksumFlags {
        let w2 = self.w(desc, W2_OFF);
        CksumFlags {
            tcp: w2 & MSDU_TCP != 0,
            udp: w2 & MSDU_UDP != 0,
            ipv6: w2 & MSDU_IPV6 != 0,
            ip_frag: w2 & MSDU_IP_FRAG != 0,
            l4_fail: self.w(desc, W0_OFF) & ATTN_CKSUM_FAIL != 0,
        }
    }
}

/// Descriptor writer mirroring what the DMA engine produces; used by the
/// simulation harness to craft receive buffers.
#[derive(Debug, Clone, Default)]
pub struct LlDescWriter {
    pub msdu_done: bool,
    pub cksum_fail: bool,
    pub len_err: bool,
    pub mcast: bool,
    pub frag: bool,
    pub seq: u16,
    pub retry: bool,
    pub encrypted: bool,
    pub tid: u8,
    pub key_id: u8,
    pub more_buffers: u32,
    pub msdu_len: u16,
    pub tcp: bool,
    pub udp: bool,
    pub ipv6: bool,
    pub ip_frag: bool,
    pub first: bool,
    pub last: bool,
    pub pn: u64,
}

impl LlDescWriter {
    pub fn write(&self, endian: Endian, desc: &mut [u8]) {
        let mut w0 = 0;
        if self.msdu_done {
            w0 |= ATTN_MSDU_DONE;
        }
        if self.cksum_fail {
            w0 |= ATTN_CKSUM_FAIL;
        }
        if self.len_err {
            w0 |= ATTN_LEN_ERR;
        }
        if self.mcast {
            w0 |= ATTN_MCAST_BCAST;
        }
        if self.frag {
            w0 |= ATTN_FRAGMENT;
        }
        let mut w1 = u32::from(self.seq) & MPDU_SEQ_MASK;
        if self.retry {
            w1 |= MPDU_RETRY;
        }
        if self.encrypted {
            w1 |= MPDU_ENCRYPTED;
        }
        w1 |= (u32::from(self.tid) & MPDU_TID_MASK) << MPDU_TID_SHIFT;
        w1 |= (u32::from(self.key_id) & MPDU_KEY_ID_MASK) << MPDU_KEY_ID_SHIFT;
        w1 |= (self.more_buffers & MPDU_MORE_BUFS_MASK) << MPDU_MORE_BUFS_SHIFT;
        let mut w2 = u32::from(self.msdu_len);
        if self.tcp {
            w2 |= MSDU_TCP;
        }
        if self.udp {
            w2 |= MSDU_UDP;
        }
        if self.ipv6 {
            w2 |= MSDU_IPV6;
        }
        if self.ip_frag {
            w2 |= MSDU_IP_FRAG;
        }
        if self.first {
            w2 |= MSDU_FIRST;
        }
        if self.last {
            w2 |= MSDU_LAST;
        }
        endian.put_word(desc, W0_OFF, w0);
        endian.put_word(desc, W1_OFF, w1);
        endian.put_word(desc, W2_OFF, w2);
        endian.put_word(desc, W3_OFF, (self.pn & 0xffff_ffff) as u32);
        endian.put_word(desc, W4_OFF, ((self.pn >> 32) & 0xffff) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> LlView {
        LlView::new(Endian::Little)
    }

    #[test]
    fn field_round_trip() {
        let mut desc = [0u8; RESERVATION];
        LlDescWriter {
            msdu_done: true,
            seq: 0xabc,
            retry: true,
            encrypted: true,
            tid: 5,
            key_id: 0x42,
            more_buffers: 2,
            msdu_len: 1500,
            tcp: true,
            first: true,
            last: false,
            pn: 0x1234_5678_9abc,
            ..LlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);

        let v = view();
        assert!(v.msdu_done(&desc));
        assert_eq!(v.seq_num(&desc), 0xabc);
        assert!(v.retry(&desc));
        assert!(v.is_encrypted(&desc));
        assert_eq!(v.tid(&desc), 5);
        assert_eq!(v.key_id(&desc), Some(0x42));
        assert_eq!(v.more_buffers(&desc), 2);
        assert_eq!(v.msdu_len(&desc), 1500);
        assert!(v.first_msdu(&desc));
        assert!(!v.last_msdu(&desc));
        assert!(v.checksum_flags(&desc).tcp);
    }

    #[test]
    fn pn_widths() {
        let mut desc = [0u8; RESERVATION];
        LlDescWriter {
            first: true,
            pn: 0x9999_1234_5678,
            ..LlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        let v = view();
        assert_eq!(v.pn(&desc, PnWidth::Pn24).unwrap().value, 0x34_5678);
        assert_eq!(v.pn(&desc, PnWidth::Pn48).unwrap().value, 0x9999_1234_5678);
        assert_eq!(
            v.pn(&desc, PnWidth::Pn128),
            Err(DescError::UnsupportedPnWidth(PnWidth::Pn128))
        );
    }

    #[test]
    fn clear_attention_drops_stale_done_bit() {
        let mut desc = [0u8; RESERVATION];
        LlDescWriter {
            msdu_done: true,
            len_err: true,
            ..LlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        let v = view();
        assert!(v.msdu_done(&desc));
        v.clear_attention(&mut desc);
        assert!(!v.msdu_done(&desc));
        assert!(!v.len_invalid(&desc));
    }

    #[test]
    fn key_id_only_on_first_msdu() {
        let mut desc = [0u8; RESERVATION];
        LlDescWriter {
            key_id: 7,
            first: false,
            ..LlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        assert_eq!(view().key_id(&desc), None);
    }

    #[test]
    fn big_endian_parses_identically() {
        let mut desc = [0u8; RESERVATION];
        LlDescWriter {
            msdu_len: 777,
            udp: true,
            ipv6: true,
            ..LlDescWriter::default()
        }
        .write(Endian::Big, &mut desc);
        let v = LlView::new(Endian::Big);
        assert_eq!(v.msdu_len(&desc), 777);
        let ck = v.checksum_flags(&desc);
        assert!(ck.udp && ck.ipv6);
    }
}
