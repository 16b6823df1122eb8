//! Real-mode segment:offset addresses.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A `segment:offset` pair.
///
/// Two addresses are equal when they designate the same linear address, so `0000:0010` equals
/// `0001:0000`. Ordering follows the linear address too.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SegmentedAddress {
    pub segment: u16,
    pub offset: u16,
}

impl SegmentedAddress {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// `segment * 16 + offset`, up to `0x10FFEF`
    #[inline]
    pub const fn linear(&self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }

    /// Same segment, offset moved by `delta` with 16-bit wraparound
    #[inline]
    pub const fn wrapping_add(&self, delta: u16) -> Self {
        Self::new(self.segment, self.offset.wrapping_add(delta))
    }
}

impl PartialEq for SegmentedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.linear() == other.linear()
    }
}

impl Eq for SegmentedAddress {}

impl Hash for SegmentedAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.linear().hash(state);
    }
}

impl PartialOrd for SegmentedAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentedAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.linear().cmp(&other.linear())
    }
}

impl fmt::Display for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}
