//! Channel capability bits
//!
//! Each side of the channel advertises a set of capabilities when the
//! channel comes up. A capability is only used once both sides advertise it.

use serde::{Deserialize, Serialize};

/// Capabilities known to the VMC data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    /// Payloads may be sent as LZ4-compressed envelopes
    DataCompressLz4 = 0,
}

impl Capability {
    fn mask(self) -> u32 {
        1 << (self as u8)
    }
}

/// A set of advertised capability bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// Empty capability set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Advertise a capability
    pub fn set(&mut self, cap: Capability) {
        self.0 |= cap.mask();
    }

    /// Withdraw a capability
    pub fn clear(&mut self, cap: Capability) {
        self.0 &= !cap.mask();
    }

    /// Check whether a capability is advertised
    pub fn has(&self, cap: Capability) -> bool {
        self.0 & cap.mask() != 0
    }

    /// Builder-style variant of [`Capabilities::set`]
    pub fn with(mut self, cap: Capability) -> Self {
        self.set(cap);
        self
    }
}
