//! Indication-driven receive processing.

pub mod assembler;
pub mod checksum;
pub mod indication;

pub use assembler::{AssembleOutput, FrameAssembler, FrameBatch, Msdu, MsduMeta, RxError};
pub use checksum::{CksumResult, CksumVerdict, L4Proto, map_cksum};
pub use indication::{FwRxDesc, IndError, Indication, IndicationBuilder, MsduRecord};
