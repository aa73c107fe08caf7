//! High-latency descriptor layout.
//!
//! In high-latency operation the firmware parses the hardware descriptor
//! itself and uploads a condensed 40-byte form with the indication payload.
//! Several hardware fields never make the trip; their accessors return fixed
//! fallbacks (no retry bit, no TID, and the done flag is implicitly set since
//! the firmware only uploads completed buffers).

use crate::config::Endian;

use super::{
    ChannelInfo, CksumFlags, DescError, DescriptorView, INVALID_TID, PacketNumber, PnWidth,
};

/// Bytes reserved at the head of each receive buffer.
pub const RESERVATION: usize = 40;

// Word 0: MPDU fields.
const W0_OFF: usize = 0;
const W0_SEQ_MASK: u32 = 0xfff;
const W0_ENCRYPTED: u32 = 1 << 12;
const W0_CHAN_INFO: u32 = 1 << 13;
const W0_MCAST_BCAST: u32 = 1 << 14;
const W0_FRAGMENT: u32 = 1 << 15;
const W0_KEY_ID_SHIFT: u32 = 16;
const W0_KEY_ID_MASK: u32 = 0xff;

// Word 1: per-MSDU flags in the low byte, length in the high half.
const W1_OFF: usize = 4;
const FLAGS_FIRST: u32 = 0x01;
const FLAGS_LAST: u32 = 0x02;
const FLAGS_IPV6: u32 = 0x04;
const FLAGS_TCP: u32 = 0x08;
const FLAGS_UDP: u32 = 0x10;
const FLAGS_CKSUM_FAIL: u32 = 0x20;
const W1_LEN_SHIFT: u32 = 16;

// Words 2-5: packet number, up to 128 bits.
const PN_OFF: [usize; 4] = [8, 12, 16, 20];

// Words 6-7: channel information.
const W6_OFF: usize = 24;
const W7_OFF: usize = 28;

/// Accessors for the firmware-written receive descriptor.
pub struct HlView {
    endian: Endian,
}

impl HlView {
    #[must_use]
    pub fn new(endian: Endian) -> Self {
        Self { endian }
    }

    #[inline]
    fn w(&self, desc: &[u8], off: usize) -> u32 {
        self.endian.word(desc, off)
    }

    #[inline]
    fn flags(&self, desc: &[u8]) -> u32 {
        self.w(desc, W1_OFF) & 0xff
    }
}

impl DescriptorView for HlView {
    fn reservation(&self) -> usize {
        RESERVATION
    }

    fn clear_attention(&self, desc: &mut [u8]) {
        // No hardware attention word; zero the MSDU flags so a recycled
        // buffer never reports stale first/last bits.
        let w1 = self.w(desc, W1_OFF) & !0xff;
        self.endian.put_word(desc, W1_OFF, w1);
    }

    fn msdu_done(&self, _desc: &[u8]) -> bool {
        // Firmware only uploads buffers the hardware finished with.
        true
    }

    fn msdu_len(&self, desc: &[u8]) -> usize {
        (self.w(desc, W1_OFF) >> W1_LEN_SHIFT) as usize
    }

    fn more_buffers(&self, _desc: &[u8]) -> u32 {
        0
    }

    fn len_invalid(&self, _desc: &[u8]) -> bool {
        false
    }

    fn first_msdu(&self, desc: &[u8]) -> bool {
        self.flags(desc) & FLAGS_FIRST != 0
    }

    fn last_msdu(&self, desc: &[u8]) -> bool {
        self.flags(desc) & FLAGS_LAST != 0
    }

    fn retry(&self, _desc: &[u8]) -> bool {
        false
    }

    fn seq_num(&self, desc: &[u8]) -> u16 {
        (self.w(desc, W0_OFF) & W0_SEQ_MASK) as u16
    }

    fn pn(&self, desc: &[u8], width: PnWidth) -> Result<PacketNumber, DescError> {
        if !self.first_msdu(desc) {
            return Err(DescError::NotFirstMsdu);
        }
        let word = |i: usize| u128::from(self.w(desc, PN_OFF[i]));
        let value = match width {
            PnWidth::Pn24 => word(0) & 0xff_ffff,
            PnWidth::Pn48 => word(0) | ((word(1) & 0xffff) << 32),
            PnWidth::Pn128 => word(0) | (word(1) << 32) | (word(2) << 64) | (word(3) << 96),
        };
        Ok(PacketNumber { width, value })
    }

    fn tid(&self, _desc: &[u8]) -> u8 {
        INVALID_TID
    }

    fn has_mcast_flag(&self, desc: &[u8]) -> bool {
        self.first_msdu(desc)
    }

    fn is_mcast(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & W0_MCAST_BCAST != 0
    }

    fn is_frag(&self, desc: &[u8]) -> bool {
        self.w(desc, W0_OFF) & W0_FRAGMENT != 0
    }

    fn is_encrypted(&self, desc: &[u8]) -> bool {
        // Valid only where the firmware filled the MPDU fields.
        self.first_msdu(desc) && self.w(desc, W0_OFF) & W0_ENCRYPTED != 0
    }

    fn key_id(&self, desc: &[u8]) -> Option<u8> {
        if !self.first_msdu(desc) {
            return None;
        }
        Some(((self.w(desc, W0_OFF) >> W0_KEY_ID_SHIFT) & W0_KEY_ID_MASK) as u8)
    }

    fn chan_info(&self, desc: &[u8]) -> Option<ChannelInfo> {
        if self.w(desc, W0_OFF) & W0_CHAN_INFO == 0 {
            return None;
        }
        let w6 = self.w(desc, W6_OFF);
        let w7 = self.w(desc, W7_OFF);
        Some(ChannelInfo {
            primary_mhz: (w6 & 0xffff) as u16,
            contig1_mhz: (w6 >> 16) as u16,
            contig2_mhz: (w7 & 0xffff) as u16,
            phy_mode: ((w7 >> 16) & 0xff) as u8,
        })
    }

    fn checksum_flags(&self, desc: &[u8]) -> CksumFlags {
        let flags = self.flags(desc);
        CksumFlags {
            tcp: flags & FLAGS_TCP != 0,
            udp: flags & FLAGS_UDP != 0,
            ipv6: flags & FLAGS_IPV6 != 0,
            ip_frag: false,
            l4_fail: flags & FLAGS_CKSUM_FAIL != 0,
        }
    }
}

/// Descriptor writer mirroring the firmware upload; used by the simulation
/// harness to craft receive buffers.
#[derive(Debug, Clone, Default)]
pub struct HlDescWriter {
    pub seq: u16,
    pub encrypted: bool,
    pub mcast: bool,
    pub frag: bool,
    pub key_id: u8,
    pub msdu_len: u16,
    pub first: bool,
    pub last: bool,
    pub tcp: bool,
    pub udp: bool,
    pub ipv6: bool,
    pub cksum_fail: bool,
    pub pn: u128,
    pub chan_info: Option<ChannelInfo>,
}

impl HlDescWriter {
    pub fn write(&self, endian: Endian, desc: &mut [u8]) {
        let mut w0 = u32::from(self.seq) & W0_SEQ_MASK;
        if self.encrypted {
            w0 |= W0_ENCRYPTED;
        }
        if self.mcast {
            w0 |= W0_MCAST_BCAST;
        }
        if self.frag {
            w0 |= W0_FRAGMENT;
        }
        if self.chan_info.is_some() {
            w0 |= W0_CHAN_INFO;
        }
        w0 |= (u32::from(self.key_id) & W0_KEY_ID_MASK) << W0_KEY_ID_SHIFT;

        let mut flags = 0;
        if self.first {
            flags |= FLAGS_FIRST;
        }
        if self.last {
            flags |= FLAGS_LAST;
        }
        if self.ipv6 {
            flags |= FLAGS_IPV6;
        }
        if self.tcp {
            flags |= FLAGS_TCP;
        }
        if self.udp {
            flags |= FLAGS_UDP;
        }
        if self.cksum_fail {
            flags |= FLAGS_CKSUM_FAIL;
        }
        let w1 = flags | (u32::from(self.msdu_len) << W1_LEN_SHIFT);

        endian.put_word(desc, W0_OFF, w0);
        endian.put_word(desc, W1_OFF, w1);
        for (i, off) in PN_OFF.iter().enumerate() {
            endian.put_word(desc, *off, ((self.pn >> (32 * i)) & 0xffff_ffff) as u32);
        }
        let (w6, w7) = match self.chan_info {
            Some(ci) => (
                u32::from(ci.primary_mhz) | (u32::from(ci.contig1_mhz) << 16),
                u32::from(ci.contig2_mhz) | (u32::from(ci.phy_mode) << 16),
            ),
            None => (0, 0),
        };
        endian.put_word(desc, W6_OFF, w6);
        endian.put_word(desc, W7_OFF, w7);
        endian.put_word(desc, 32, 0);
        endian.put_word(desc, 36, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> HlView {
        HlView::new(Endian::Little)
    }

    #[test]
    fn field_round_trip() {
        let mut desc = [0u8; RESERVATION];
        HlDescWriter {
            seq: 0x321,
            encrypted: true,
            key_id: 0x17,
            msdu_len: 1400,
            first: true,
            last: true,
            udp: true,
            ipv6: true,
            ..HlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);

        let v = view();
        assert_eq!(v.seq_num(&desc), 0x321);
        assert!(v.is_encrypted(&desc));
        assert_eq!(v.key_id(&desc), Some(0x17));
        assert_eq!(v.msdu_len(&desc), 1400);
        assert!(v.first_msdu(&desc) && v.last_msdu(&desc));
        let ck = v.checksum_flags(&desc);
        assert!(ck.udp && ck.ipv6 && !ck.tcp);
    }

    #[test]
    fn fixed_fallbacks() {
        let desc = [0u8; RESERVATION];
        let v = view();
        assert!(v.msdu_done(&desc));
        assert!(!v.retry(&desc));
        assert_eq!(v.tid(&desc), INVALID_TID);
        assert_eq!(v.more_buffers(&desc), 0);
        assert!(!v.len_invalid(&desc));
    }

    #[test]
    fn pn128_assembles_all_four_words() {
        let mut desc = [0u8; RESERVATION];
        let pn = 0x0011_2233_4455_6677_8899_aabb_ccdd_eeff_u128;
        HlDescWriter {
            first: true,
            pn,
            ..HlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        let v = view();
        assert_eq!(v.pn(&desc, PnWidth::Pn128).unwrap().value, pn);
        assert_eq!(v.pn(&desc, PnWidth::Pn24).unwrap().value, pn & 0xff_ffff);
    }

    #[test]
    fn pn_requires_first_msdu() {
        let mut desc = [0u8; RESERVATION];
        HlDescWriter {
            first: false,
            pn: 42,
            ..HlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        assert_eq!(
            view().pn(&desc, PnWidth::Pn48),
            Err(DescError::NotFirstMsdu)
        );
    }

    #[test]
    fn chan_info_gated_by_presence_bit() {
        let mut desc = [0u8; RESERVATION];
        let ci = ChannelInfo {
            primary_mhz: 5180,
            contig1_mhz: 5190,
            contig2_mhz: 0,
            phy_mode: 11,
        };
        HlDescWriter {
            first: true,
            chan_info: Some(ci),
            ..HlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        assert_eq!(view().chan_info(&desc), Some(ci));

        HlDescWriter::default().write(Endian::Little, &mut desc);
        assert_eq!(view().chan_info(&desc), None);
    }

    #[test]
    fn clear_attention_wipes_msdu_flags_only() {
        let mut desc = [0u8; RESERVATION];
        HlDescWriter {
            first: true,
            last: true,
            msdu_len: 900,
            ..HlDescWriter::default()
        }
        .write(Endian::Little, &mut desc);
        let v = view();
        v.clear_attention(&mut desc);
        assert!(!v.first_msdu(&desc) && !v.last_msdu(&desc));
        assert_eq!(v.msdu_len(&desc), 900);
    }
}
