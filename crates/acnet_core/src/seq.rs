//! Wraparound-aware sequence numbers.
//!
//! The wire protocol uses a 32-bit counter for per-packet reliability instead
//! of the 16-bit counter some other protocols use, since a session can stay
//! open for hours and a 16-bit counter would wrap too quickly to be useful
//! for gap detection. The comparison and arithmetic rules are otherwise the
//! same shape: treat the counter as a point on an infinite circular number
//! line and use wrapping subtraction to recover a signed distance between two
//! points.
//!
//! ```text
//!     u32::MAX-1  u32::MAX    0      1      2
//! ... ----|-----------|------|------|------|-- ...
//! ```

use core::{cmp::Ordering, convert::Infallible};

use derive_more::{Add, AddAssign, Deref, DerefMut, Sub, SubAssign};
use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

/// Monotonically increasing, wrapping counter identifying a packet sent on
/// one side of a session.
///
/// [`Ord`] on this type accounts for wraparound: `a < b` iff the signed
/// distance from `a` to `b`, interpreted as an `i32`, is positive. This
/// breaks down if two sequences are more than `u32::MAX / 2` apart, which
/// should never happen in practice (that's billions of packets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(Deref, DerefMut, Add, AddAssign, Sub, SubAssign)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Seq(pub u32);

impl Seq {
    /// Signed distance from `self` to `rhs`, wrapping.
    ///
    /// A positive result means `rhs` comes after `self` on the sequence
    /// line; negative means before.
    #[must_use]
    pub fn dist_to(self, rhs: Self) -> i32 {
        rhs.0.wrapping_sub(self.0) as i32
    }

    /// Next sequence number after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_to(*other).cmp(&0)
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u32::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Sequence number of a packet in transit, used for ACK/NAK bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Deref, DerefMut, Add, AddAssign, Sub, SubAssign)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketSeq(pub Seq);

impl PacketSeq {
    /// Builds a [`PacketSeq`] from a raw counter value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self(Seq(value))
    }
}

impl FixedEncodeLen for PacketSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for PacketSeq {
    type Error = <Seq as Encode>::Error;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for PacketSeq {
    type Error = <Seq as Decode>::Error;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}

/// Sequence number identifying the set of fragments that make up one
/// reassembled application message.
///
/// Distinct from [`PacketSeq`]: several fragments carrying the same
/// [`FragSeq`] may be spread across several packets, each of which has its
/// own, unrelated [`PacketSeq`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Deref, DerefMut, Add, AddAssign, Sub, SubAssign)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FragSeq(pub Seq);

impl FragSeq {
    /// Builds a [`FragSeq`] from a raw counter value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self(Seq(value))
    }
}

impl FixedEncodeLen for FragSeq {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN;
}

impl Encode for FragSeq {
    type Error = <Seq as Encode>::Error;

    fn encode(&self, dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        self.0.encode(dst)
    }
}

impl Decode for FragSeq {
    type Error = <Seq as Decode>::Error;

    fn decode(src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Seq::decode(src).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, octs::test::*};

    #[test]
    fn encode_decode_round_trip() {
        for seq in [0, 1, 2, u32::MAX - 1, u32::MAX, 1 << 20] {
            hint_round_trip(&Seq(seq));
        }
    }

    #[test]
    fn increasing_wraparound() {
        let a = Seq(u32::MAX - 1);
        let b = Seq(1);
        assert!(a < b, "sequence should wrap around and still compare as increasing");
        assert_eq!(a.dist_to(b), 2);
    }

    #[test]
    fn dist_to_is_antisymmetric() {
        let a = Seq(10);
        let b = Seq(20);
        assert_eq!(a.dist_to(b), 10);
        assert_eq!(b.dist_to(a), -10);
    }

    #[test]
    fn packet_seq_arithmetic() {
        let mut seq = PacketSeq::new(u32::MAX);
        seq += PacketSeq::new(1);
        assert_eq!(seq, PacketSeq::new(0));
    }
}
