//! Wire-format primitives shared by every layer of the stack: the
//! variable-length integer, the two flavours of length-prefixed string, and
//! the position/quaternion types used by object-creation and movement
//! messages.
//!
//! Every type here round-trips through [`octs`]'s [`Encode`]/[`Decode`]
//! traits; none of them go through `serde`, since the wire format has no
//! relation to any self-describing format.

use std::convert::Infallible;

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};
use thiserror::Error;

/// Rounds `len` up to the next multiple of 4.
#[must_use]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Number of zero padding bytes needed to bring `len` up to a multiple of 4.
#[must_use]
pub const fn pad4(len: usize) -> usize {
    align4(len) - len
}

/// Variable-length encoding of an unsigned 32-bit integer.
///
/// Values up to `0x7FFF` are written as a single 16-bit word. Larger values
/// are written as two 16-bit words: the first holds the high 16 bits of the
/// value with its top bit set as a continuation marker, the second holds the
/// low 16 bits.
///
/// This is *not* the same scheme as `octs`'s own `VarInt` (which is
/// LEB128-like); it was reverse engineered from captured traffic and must be
/// matched exactly or the peer will desync on the very next field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarDword(pub u32);

const VARDWORD_CONTINUE: u16 = 0x8000;
const VARDWORD_SMALL_MAX: u32 = 0x7FFF;

impl VarDword {
    /// Largest value representable.
    pub const MAX: Self = Self(0x7FFF_FFFF);

    /// Number of bytes this value will occupy on the wire.
    #[must_use]
    pub const fn encode_len(self) -> usize {
        if self.0 <= VARDWORD_SMALL_MAX { 2 } else { 4 }
    }
}

impl From<u32> for VarDword {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<VarDword> for u32 {
    fn from(value: VarDword) -> Self {
        value.0
    }
}

impl Encode for VarDword {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        if self.0 <= VARDWORD_SMALL_MAX {
            dst.write(&(self.0 as u16))?;
        } else {
            let hi = ((self.0 >> 16) as u16) | VARDWORD_CONTINUE;
            let lo = (self.0 & 0xFFFF) as u16;
            dst.write(&hi)?;
            dst.write(&lo)?;
        }
        Ok(())
    }
}

impl Decode for VarDword {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let first: u16 = src.read()?;
        if first & VARDWORD_CONTINUE == 0 {
            Ok(Self(u32::from(first)))
        } else {
            let hi = u32::from(first & !VARDWORD_CONTINUE) << 16;
            let lo: u16 = src.read()?;
            Ok(Self(hi | u32::from(lo)))
        }
    }
}

/// Errors that can occur decoding the string primitives.
#[derive(Debug, Error)]
pub enum StringDecodeError {
    /// The claimed length does not fit in the remaining buffer.
    #[error("string of {len} bytes does not fit in the remaining buffer")]
    Truncated {
        /// Claimed length in bytes.
        len: usize,
    },
    /// The string bytes were not valid in the expected 8-bit encoding.
    ///
    /// We currently treat this encoding as Latin-1-compatible, so this
    /// variant is unreachable in practice but kept for forward
    /// compatibility with stricter decoders.
    #[error("invalid string bytes")]
    InvalidBytes,
}

/// A 16-bit-length-prefixed string, padded with zero bytes so that the whole
/// field (length prefix included) is a multiple of 4 bytes.
///
/// Used for most in-game strings (character names, chat text, account
/// names outside the login handshake).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PadStr16(pub String);

impl Encode for PadStr16 {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let bytes = self.0.as_bytes();
        let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
        dst.write(&len)?;
        for &b in &bytes[..len as usize] {
            dst.write(&b)?;
        }
        for _ in 0..pad4(2 + len as usize) {
            dst.write(&0u8)?;
        }
        Ok(())
    }
}

impl Decode for PadStr16 {
    type Error = StringDecodeError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let len: u16 = src.read()?;
        let len = len as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(src.read::<u8>()?);
        }
        for _ in 0..pad4(2 + len) {
            let _: u8 = src.read()?;
        }
        // the wire encoding is an 8-bit superset of ASCII; every byte value
        // maps to a valid `char`, so this can never actually fail, but we
        // keep the lossless path rather than silently mangling bytes.
        let s = bytes.iter().map(|&b| b as char).collect();
        Ok(Self(s))
    }
}

impl From<&str> for PadStr16 {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A 32-bit-total-length-prefixed string used only in the login handshake
/// (account name, password).
///
/// The wire shape is: `u32` total bytes following this field (itself
/// 4-byte-aligned), then either a 1-byte length or, if the string is 255
/// bytes or longer, the marker byte `0xFF` followed by a `u16` length, then
/// the string bytes, then zero padding up to the declared total length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoginStr32(pub String);

const LOGINSTR_LONG_MARKER: u8 = 0xFF;

impl Encode for LoginStr32 {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let bytes = self.0.as_bytes();
        let len = bytes.len();
        let header_len = if len < usize::from(LOGINSTR_LONG_MARKER) { 1 } else { 3 };
        let total = align4(header_len + len);
        dst.write(&(total as u32))?;
        if len < usize::from(LOGINSTR_LONG_MARKER) {
            dst.write(&(len as u8))?;
        } else {
            dst.write(&LOGINSTR_LONG_MARKER)?;
            dst.write(&(len as u16))?;
        }
        for &b in bytes {
            dst.write(&b)?;
        }
        for _ in 0..(total - header_len - len) {
            dst.write(&0u8)?;
        }
        Ok(())
    }
}

impl Decode for LoginStr32 {
    type Error = StringDecodeError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let total: u32 = src.read()?;
        let total = total as usize;
        let short_len: u8 = src.read()?;
        let (len, header_len) = if short_len == LOGINSTR_LONG_MARKER {
            let len: u16 = src.read()?;
            (len as usize, 3)
        } else {
            (short_len as usize, 1)
        };
        if header_len + len > total {
            return Err(BufTooShortOr::Other(StringDecodeError::Truncated { len }));
        }
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(src.read::<u8>()?);
        }
        for _ in 0..(total - header_len - len) {
            let _: u8 = src.read()?;
        }
        let s = bytes.iter().map(|&b| b as char).collect();
        Ok(Self(s))
    }
}

impl From<&str> for LoginStr32 {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Four-component quaternion, scalar-first (`w, x, y, z`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quaternion {
    /// Scalar (real) component.
    pub w: f32,
    /// `i` component.
    pub x: f32,
    /// `j` component.
    pub y: f32,
    /// `k` component.
    pub z: f32,
}

impl Quaternion {
    /// Identity rotation.
    pub const IDENTITY: Self = Self { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };
}

impl FixedEncodeLen for Quaternion {
    const ENCODE_LEN: usize = f32::ENCODE_LEN * 4;
}

impl Encode for Quaternion {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.w)?;
        dst.write(&self.x)?;
        dst.write(&self.y)?;
        dst.write(&self.z)?;
        Ok(())
    }
}

impl Decode for Quaternion {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            w: src.read()?,
            x: src.read()?,
            y: src.read()?,
            z: src.read()?,
        })
    }
}

/// Flags controlling which optional fields of a [`Position`] are present on
/// the wire, mirroring the bit layout of the reference protocol's variant
/// position encoding (see `Position::decode_variant`).
pub mod position_flags {
    /// Velocity vector follows.
    pub const HAS_VELOCITY: u32 = 0x01;
    /// Placement id follows.
    pub const HAS_PLACEMENT_ID: u32 = 0x02;
    /// Object is reported as grounded/contact-active.
    pub const GROUNDED: u32 = 0x04;
    /// Quaternion's `w` component is omitted (implicitly `0.0`).
    pub const NO_QUAT_W: u32 = 0x08;
    /// Quaternion's `x` component is omitted (implicitly `0.0`).
    pub const NO_QUAT_X: u32 = 0x10;
    /// Quaternion's `y` component is omitted (implicitly `0.0`).
    pub const NO_QUAT_Y: u32 = 0x20;
    /// Quaternion's `z` component is omitted (implicitly `0.0`).
    pub const NO_QUAT_Z: u32 = 0x40;
}

/// A world position: a cell id plus a local-space offset and orientation.
///
/// Two layouts exist on the wire: a fixed 32-byte layout (used when creating
/// objects, always carries the full quaternion) and a variant layout driven
/// by a flags word (used for movement updates, may omit quaternion
/// components and/or carry velocity).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// World cell this position is relative to.
    pub cell_id: u32,
    /// Local-space offset within `cell_id`.
    pub offset: [f32; 3],
    /// Orientation.
    pub orientation: Quaternion,
    /// Linear velocity, present only in the variant encoding.
    pub velocity: Option<[f32; 3]>,
    /// Placement id, present only in the variant encoding.
    pub placement_id: Option<u16>,
    /// Grounded/contact-active flag, present only in the variant encoding.
    pub grounded: bool,
}

impl Position {
    /// Builds a position with no velocity or placement id, as used by the
    /// fixed object-creation layout.
    #[must_use]
    pub fn fixed(cell_id: u32, offset: [f32; 3], orientation: Quaternion) -> Self {
        Self { cell_id, offset, orientation, velocity: None, placement_id: None, grounded: false }
    }

    /// Encodes this position using the fixed 32-byte layout.
    pub fn encode_fixed(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        dst.write(&self.cell_id)?;
        for c in self.offset {
            dst.write(&c)?;
        }
        dst.write(&self.orientation)?;
        Ok(())
    }

    /// Decodes a position using the fixed 32-byte layout.
    pub fn decode_fixed(mut src: impl Read) -> Result<Self, BufTooShortOr<Infallible>> {
        let cell_id = src.read()?;
        let offset = [src.read()?, src.read()?, src.read()?];
        let orientation = src.read()?;
        Ok(Self { cell_id, offset, orientation, velocity: None, placement_id: None, grounded: false })
    }

    /// Encodes this position using the flag-driven variant layout.
    pub fn encode_variant(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        let mut flags = 0u32;
        if self.velocity.is_some() {
            flags |= position_flags::HAS_VELOCITY;
        }
        if self.placement_id.is_some() {
            flags |= position_flags::HAS_PLACEMENT_ID;
        }
        if self.grounded {
            flags |= position_flags::GROUNDED;
        }
        if self.orientation.w == 0.0 {
            flags |= position_flags::NO_QUAT_W;
        }
        if self.orientation.x == 0.0 {
            flags |= position_flags::NO_QUAT_X;
        }
        if self.orientation.y == 0.0 {
            flags |= position_flags::NO_QUAT_Y;
        }
        if self.orientation.z == 0.0 {
            flags |= position_flags::NO_QUAT_Z;
        }

        dst.write(&flags)?;
        dst.write(&self.cell_id)?;
        for c in self.offset {
            dst.write(&c)?;
        }
        if flags & position_flags::NO_QUAT_W == 0 {
            dst.write(&self.orientation.w)?;
        }
        if flags & position_flags::NO_QUAT_X == 0 {
            dst.write(&self.orientation.x)?;
        }
        if flags & position_flags::NO_QUAT_Y == 0 {
            dst.write(&self.orientation.y)?;
        }
        if flags & position_flags::NO_QUAT_Z == 0 {
            dst.write(&self.orientation.z)?;
        }
        if let Some(v) = self.velocity {
            for c in v {
                dst.write(&c)?;
            }
        }
        if let Some(id) = self.placement_id {
            dst.write(&id)?;
        }
        Ok(())
    }

    /// Decodes a position using the flag-driven variant layout.
    pub fn decode_variant(mut src: impl Read) -> Result<Self, BufTooShortOr<Infallible>> {
        let flags: u32 = src.read()?;
        let cell_id = src.read()?;
        let offset = [src.read()?, src.read()?, src.read()?];

        let w = if flags & position_flags::NO_QUAT_W == 0 { src.read()? } else { 0.0 };
        let x = if flags & position_flags::NO_QUAT_X == 0 { src.read()? } else { 0.0 };
        let y = if flags & position_flags::NO_QUAT_Y == 0 { src.read()? } else { 0.0 };
        let z = if flags & position_flags::NO_QUAT_Z == 0 { src.read()? } else { 0.0 };

        let velocity = if flags & position_flags::HAS_VELOCITY != 0 {
            Some([src.read()?, src.read()?, src.read()?])
        } else {
            None
        };
        let placement_id = if flags & position_flags::HAS_PLACEMENT_ID != 0 {
            Some(src.read()?)
        } else {
            None
        };
        let grounded = flags & position_flags::GROUNDED != 0;

        Ok(Self {
            cell_id,
            offset,
            orientation: Quaternion { w, x, y, z },
            velocity,
            placement_id,
            grounded,
        })
    }
}

#[cfg(test)]
mod tests {
    use octs::Bytes;

    use super::*;

    #[test]
    fn vardword_small() {
        let mut buf = Vec::new();
        VarDword(0x0100).encode(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x01]);
        let decoded = VarDword::decode(Bytes::from(buf)).unwrap();
        assert_eq!(decoded.0, 0x0100);
    }

    #[test]
    fn vardword_large() {
        let mut buf = Vec::new();
        VarDword(0x0001_0000).encode(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x80, 0x00, 0x00]);
        let decoded = VarDword::decode(Bytes::from(buf)).unwrap();
        assert_eq!(decoded.0, 0x0001_0000);
    }

    #[test]
    fn vardword_round_trip_boundary() {
        for v in [0, 1, VARDWORD_SMALL_MAX, VARDWORD_SMALL_MAX + 1, 0xFFFF_FFFF] {
            let mut buf = Vec::new();
            VarDword(v).encode(&mut buf).unwrap();
            assert_eq!(VarDword::decode(Bytes::from(buf)).unwrap().0, v);
        }
    }

    #[test]
    fn padstr16_empty() {
        let mut buf = Vec::new();
        PadStr16::from("").encode(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn padstr16_abc() {
        let mut buf = Vec::new();
        PadStr16::from("abc").encode(&mut buf).unwrap();
        assert_eq!(buf, [0x03, 0x00, b'a', b'b', b'c', 0x00, 0x00, 0x00]);
        let decoded = PadStr16::decode(Bytes::from(buf)).unwrap();
        assert_eq!(decoded.0, "abc");
    }

    #[test]
    fn loginstr32_round_trip() {
        for s in ["", "a", "password123", &"x".repeat(300)] {
            let mut buf = Vec::new();
            LoginStr32::from(s).encode(&mut buf).unwrap();
            assert_eq!(buf.len() % 4, 0);
            let decoded = LoginStr32::decode(Bytes::from(buf)).unwrap();
            assert_eq!(decoded.0, s);
        }
    }

    #[test]
    fn position_variant_round_trip() {
        let pos = Position {
            cell_id: 0x1234_5678,
            offset: [1.0, 2.0, 3.0],
            orientation: Quaternion { w: 0.0, x: 0.5, y: 0.0, z: 0.0 },
            velocity: Some([0.1, 0.2, 0.3]),
            placement_id: Some(7),
            grounded: true,
        };
        let mut buf = Vec::new();
        pos.encode_variant(&mut buf).unwrap();
        let decoded = Position::decode_variant(Bytes::from(buf)).unwrap();
        assert_eq!(decoded, pos);
    }

    #[test]
    fn position_fixed_round_trip() {
        let pos = Position::fixed(1, [1.0, 2.0, 3.0], Quaternion::IDENTITY);
        let mut buf = Vec::new();
        pos.encode_fixed(&mut buf).unwrap();
        let decoded = Position::decode_fixed(Bytes::from(buf)).unwrap();
        assert_eq!(decoded, pos);
    }
}
