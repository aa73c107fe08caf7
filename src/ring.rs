//! Receive ring ownership: slots, buffer lookup, and refill scheduling.

pub mod hash;
pub mod refill;
pub mod rx_ring;

pub use hash::{BufferHashIndex, HashError};
pub use refill::{RefillScheduler, RingCore};
pub use rx_ring::{DeviceVisible, RxRing};
