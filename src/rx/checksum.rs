//! Checksum-offload result mapping.
//!
//! The hardware validates TCP/UDP checksums inline and reports the outcome
//! through descriptor flags. This maps those flags onto the verdict a network
//! stack understands: either the checksum is known good and need not be
//! recomputed, or nothing is claimed and the stack verifies as usual.
//!
//! IP fragments are never claimed (the hardware checks per-fragment, the
//! stack needs the reassembled datagram), and contradictory protocol flags
//! are treated as no claim at all.

use crate::desc::CksumFlags;

/// L4 protocol the hardware claims to have checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    None,
    Tcp,
    Udp,
    TcpV6,
    UdpV6,
}

/// What the stack may assume about the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CksumVerdict {
    /// No claim; software verifies.
    Unknown,
    /// Verified in hardware; skip software verification.
    Unnecessary,
}

/// Combined checksum-offload outcome for one MSDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CksumResult {
    pub proto: L4Proto,
    pub verdict: CksumVerdict,
}

impl CksumResult {
    pub(crate) const NONE: Self = Self {
        proto: L4Proto::None,
        verdict: CksumVerdict::Unknown,
    };
}

/// Maps descriptor protocol/fail flags to the offload outcome.
#[must_use]
pub fn map_cksum(flags: CksumFlags) -> CksumResult {
    if flags.ip_frag {
        return CksumResult::NONE;
    }
    let proto = match (flags.tcp, flags.udp, flags.ipv6) {
        (true, false, false) => L4Proto::Tcp,
        (true, false, true) => L4Proto::TcpV6,
        (false, true, false) => L4Proto::Udp,
        (false, true, true) => L4Proto::UdpV6,
        // Neither, or both: the parse is not trustworthy.
        _ => return CksumResult::NONE,
    };
    CksumResult {
        proto,
        verdict: if flags.l4_fail {
            CksumVerdict::Unknown
        } else {
            CksumVerdict::Unnecessary
        },
    }
}
