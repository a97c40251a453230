use std::fmt::{Display, Formatter};

/// A 3-bit frame / ack number. All arithmetic is modulo 8, and ordering only makes sense relative
///  to a window, see [FrameNum::within_range].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct FrameNum(u8);

impl Display for FrameNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FrameNum {
    pub const ZERO: FrameNum = FrameNum(0);

    /// only the lowest three bits are used
    pub fn from_raw(value: u8) -> Self {
        FrameNum(value & 0x07)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn next(&self) -> FrameNum {
        self.plus(1)
    }

    pub fn plus(&self, n: u8) -> FrameNum {
        FrameNum::from_raw(self.0.wrapping_add(n))
    }

    /// number of increments it takes to get from `from` to `self`
    pub fn distance_from(&self, from: FrameNum) -> u8 {
        self.0.wrapping_sub(from.0) & 0x07
    }

    /// `low <= self <= high`, evaluated circularly starting at `low`
    pub fn within_range(&self, low: FrameNum, high: FrameNum) -> bool {
        self.distance_from(low) <= high.distance_from(low)
    }
}
