//! The 20-byte packet header, its flag-driven optional-header blocks, and
//! the fragment header that precedes each fragment's payload.
//!
//! Parsing and building are kept as free functions over byte slices rather
//! than as a single [`Decode`]/[`Encode`] impl on [`Packet`], because the
//! composite checksum (see [`crate::integrity`]) needs the exact byte
//! ranges of each logical component (the optional-header block, then each
//! fragment's header and data, skipping alignment padding) as they were
//! actually laid out on the wire, not a re-serialization of the decoded
//! value.

use std::convert::Infallible;

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};
use thiserror::Error;

use crate::{
    primitives::pad4,
    seq::{FragSeq, PacketSeq},
};

/// Bitmask values for [`RawHeader::flags`].
///
/// Each flag drives the presence of an optional-header block; see
/// [`parse_optional_headers`] for the fixed parse order, which does not
/// match numeric bit order.
pub mod flag {
    /// This packet is a resend of a previously transmitted sequence; it
    /// carries its original checksum and consumes no new keystream word.
    pub const RETRANSMISSION: u32 = 0x1;
    /// The payload half of the checksum is masked with a keystream word.
    pub const ENCRYPTED_CHECKSUM: u32 = 0x2;
    /// One or more [`super::Fragment`]s follow the optional-header block.
    pub const BLOB_FRAGMENTS: u32 = 0x4;
    /// Peer should migrate to a different server.
    pub const SERVER_SWITCH: u32 = 0x100;
    /// Carries a list of missing sequences the peer should resend.
    pub const REQUEST_RETRANSMIT: u32 = 0x1000;
    /// Carries a list of sequences the peer asked for but we will not
    /// resend (e.g. already evicted from the retention buffer).
    pub const REJECT_RETRANSMIT: u32 = 0x2000;
    /// Carries the sender's current high-watermark of received sequences.
    pub const ACK_SEQUENCE: u32 = 0x4000;
    /// Peer is tearing down the session.
    pub const DISCONNECT: u32 = 0x8000;
    /// Unauthenticated login payload follows the optional-header block.
    pub const LOGIN_REQUEST: u32 = 0x1_0000;
    /// As [`LOGIN_REQUEST`], for the world-entry endpoint.
    pub const WORLD_LOGIN_REQUEST: u32 = 0x2_0000;
    /// Carries the 32-byte connect handshake block (§6.4).
    pub const CONNECT_REQUEST: u32 = 0x4_0000;
    /// Carries the 8-byte echoed handshake cookie.
    pub const CONNECT_RESPONSE: u32 = 0x8_0000;
    /// Carries an 8-byte server time sample.
    pub const TIME_SYNC: u32 = 0x100_0000;
    /// Carries a 4-byte client-supplied timestamp to be echoed back.
    pub const ECHO_REQUEST: u32 = 0x200_0000;
    /// Carries the 8-byte echo of a previous [`ECHO_REQUEST`].
    pub const ECHO_RESPONSE: u32 = 0x400_0000;
    /// Carries the peer's outbound flow-control budget.
    pub const FLOW: u32 = 0x800_0000;
}

/// Fixed value of [`RawHeader`]'s `iteration` field; the reference protocol
/// has never incremented this, but peers are expected to validate it.
pub const ITERATION: u16 = 0x0001;

/// Wire layout of the 20-byte packet header (§4.4), checksum field
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    /// Wrapping per-packet sequence number.
    pub sequence: PacketSeq,
    /// Bitmask of [`flag`] values describing which optional headers follow.
    pub flags: u32,
    /// Composite checksum; see [`crate::integrity`].
    pub checksum: u32,
    /// Server-assigned client id, `0` before authentication.
    pub client_id: u16,
    /// Rolling 16-bit sender-local time.
    pub time: u16,
    /// Number of payload bytes following this header.
    pub size: u16,
}

/// The header decoded with an unexpected `iteration` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bad iteration {found:#06x}, expected {ITERATION:#06x}")]
pub struct BadIteration {
    /// The value actually found on the wire.
    pub found: u16,
}

impl FixedEncodeLen for RawHeader {
    const ENCODE_LEN: usize = 20;
}

impl Encode for RawHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.sequence)?;
        dst.write(&self.flags)?;
        dst.write(&self.checksum)?;
        dst.write(&self.client_id)?;
        dst.write(&self.time)?;
        dst.write(&self.size)?;
        dst.write(&ITERATION)?;
        Ok(())
    }
}

impl Decode for RawHeader {
    type Error = BadIteration;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let sequence = src.read()?;
        let flags = src.read()?;
        let checksum = src.read()?;
        let client_id = src.read()?;
        let time = src.read()?;
        let size = src.read()?;
        let iteration: u16 = src.read()?;
        if iteration != ITERATION {
            return Err(BufTooShortOr::Other(BadIteration { found: iteration }));
        }
        Ok(Self { sequence, flags, checksum, client_id, time, size })
    }
}

/// 16-byte header preceding each fragment's payload (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Groups every fragment of one reassembled application message.
    pub fragment_sequence: FragSeq,
    /// Opcode of the reassembled message; redundant across every fragment
    /// of the same message, but carried on each one regardless.
    pub message_id: u32,
    /// Total number of fragments in this message.
    pub count: u16,
    /// Size of this fragment *including* this 16-byte header.
    pub size_including_header: u16,
    /// Position of this fragment within `[0, count)`.
    pub index: u16,
    /// Destination queue the reassembled message should be delivered to.
    pub queue: u16,
}

impl FixedEncodeLen for FragmentHeader {
    const ENCODE_LEN: usize = 16;
}

impl Encode for FragmentHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.fragment_sequence)?;
        dst.write(&self.message_id)?;
        dst.write(&self.count)?;
        dst.write(&self.size_including_header)?;
        dst.write(&self.index)?;
        dst.write(&self.queue)?;
        Ok(())
    }
}

impl Decode for FragmentHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            fragment_sequence: src.read()?,
            message_id: src.read()?,
            count: src.read()?,
            size_including_header: src.read()?,
            index: src.read()?,
            queue: src.read()?,
        })
    }
}

/// One fragment of a multi-part application message, as carried on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// The fragment's header.
    pub header: FragmentHeader,
    /// Payload bytes, `size_including_header - 16` bytes long; alignment
    /// padding is not included here.
    pub data: Vec<u8>,
}

/// The 32-byte handshake block carried by a [`flag::CONNECT_REQUEST`]
/// packet (§6.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectRequestBody {
    /// Server's current time, used to seed the client's time-sync estimate.
    pub server_time: f64,
    /// Opaque value the client must echo back in its `ConnectResponse`.
    pub cookie: u64,
    /// Client id the server has assigned for this session.
    pub assigned_client_id: u32,
    /// Seed for the server-to-client keystream.
    pub server_seed: u32,
    /// Seed for the client-to-server keystream.
    pub client_seed: u32,
}

impl FixedEncodeLen for ConnectRequestBody {
    const ENCODE_LEN: usize = 32;
}

impl Encode for ConnectRequestBody {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.server_time)?;
        dst.write(&self.cookie)?;
        dst.write(&self.assigned_client_id)?;
        dst.write(&self.server_seed)?;
        dst.write(&self.client_seed)?;
        dst.write(&0u32)?; // reserved pad
        Ok(())
    }
}

impl Decode for ConnectRequestBody {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let server_time = src.read()?;
        let cookie = src.read()?;
        let assigned_client_id = src.read()?;
        let server_seed = src.read()?;
        let client_seed = src.read()?;
        let _pad: u32 = src.read()?;
        Ok(Self { server_time, cookie, assigned_client_id, server_seed, client_seed })
    }
}

/// The 6-byte body carried by a [`flag::FLOW`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowBody {
    /// Upper bound on outbound bytes per `interval_ms`.
    pub bytes: u32,
    /// Length of the throttling interval, in milliseconds.
    pub interval_ms: u16,
}

impl FixedEncodeLen for FlowBody {
    const ENCODE_LEN: usize = 6;
}

impl Encode for FlowBody {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.bytes)?;
        dst.write(&self.interval_ms)?;
        Ok(())
    }
}

impl Decode for FlowBody {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self { bytes: src.read()?, interval_ms: src.read()? })
    }
}

/// Every optional-header block that can follow [`RawHeader`], populated in
/// the fixed parse order given by [`flag`] (§4.4): request/reject
/// retransmit, ack, connect request/response, time sync, echo
/// request/response, flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionalHeaders {
    /// Present, with no body, when [`flag::SERVER_SWITCH`] is set: the peer
    /// wants the client to migrate to a different server.
    pub server_switch: bool,
    /// Sequences the peer is asking us to resend.
    pub request_retransmit: Option<Vec<PacketSeq>>,
    /// Sequences the peer refused to resend to us.
    pub reject_retransmit: Option<Vec<PacketSeq>>,
    /// Peer's high-watermark of contiguously received sequences.
    pub ack_sequence: Option<PacketSeq>,
    /// Present, with no body, when [`flag::DISCONNECT`] is set.
    pub disconnect: bool,
    /// Connect-handshake block, server to client.
    pub connect_request: Option<ConnectRequestBody>,
    /// Connect-handshake cookie echo, client to server.
    pub connect_response: Option<u64>,
    /// Server time sample.
    pub time_sync: Option<f64>,
    /// Client-supplied timestamp to be echoed.
    pub echo_request: Option<u32>,
    /// Echo of a previously sent [`echo_request`](Self::echo_request).
    pub echo_response: Option<u64>,
    /// Peer's outbound flow-control budget.
    pub flow: Option<FlowBody>,
}

/// Errors that can occur while parsing the framing layer of an inbound
/// datagram. Every variant here is a recoverable, per-datagram failure: the
/// caller drops the packet and increments a counter, it never propagates to
/// the upper layer (§7).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Datagram was shorter than the fixed 20-byte header.
    #[error("datagram of {len} bytes is shorter than the 20-byte header")]
    ShortDatagram {
        /// Actual datagram length.
        len: usize,
    },
    /// `iteration` field did not hold the expected constant.
    #[error(transparent)]
    BadIteration(#[from] BadIteration),
    /// Header's `size` field does not match the number of bytes actually
    /// following the header.
    #[error("header claims {claimed} payload bytes, datagram has {actual}")]
    SizeMismatch {
        /// Value of the `size` field.
        claimed: usize,
        /// Bytes actually remaining after the header.
        actual: usize,
    },
    /// An optional-header block's flag was set but its body did not fit in
    /// the remaining payload.
    #[error("optional header block did not fit in the remaining payload")]
    UnknownFlagShape,
    /// A fragment's `size_including_header` ran past the end of the
    /// packet's payload.
    #[error("fragment claims {claimed} bytes, only {available} available")]
    FragmentOverrun {
        /// Bytes the fragment header claims.
        claimed: usize,
        /// Bytes actually left in the packet.
        available: usize,
    },
}

/// A byte range within the original datagram, used to feed
/// [`crate::integrity::composite_payload_hash`] the exact bytes that were
/// parsed for one logical component, with alignment padding excluded.
fn consumed<'a>(original: &'a [u8], before: &[u8], after: &[u8]) -> &'a [u8] {
    let start = original.len() - before.len();
    let end = original.len() - after.len();
    &original[start..end]
}

fn read_seq_list(mut src: &[u8]) -> Result<(Vec<PacketSeq>, &[u8]), FrameError> {
    let count: u32 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
    let mut seqs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw: u32 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        seqs.push(PacketSeq::new(raw));
    }
    Ok((seqs, src))
}

/// Parses every optional-header block indicated by `flags`, in the fixed
/// order specified by §4.4, advancing `src` past them.
pub fn parse_optional_headers(
    mut src: &[u8],
    flags: u32,
) -> Result<(OptionalHeaders, &[u8]), FrameError> {
    let mut out = OptionalHeaders::default();

    if flags & flag::SERVER_SWITCH != 0 {
        out.server_switch = true;
    }
    if flags & flag::REQUEST_RETRANSMIT != 0 {
        let (seqs, rest) = read_seq_list(src)?;
        out.request_retransmit = Some(seqs);
        src = rest;
    }
    if flags & flag::REJECT_RETRANSMIT != 0 {
        let (seqs, rest) = read_seq_list(src)?;
        out.reject_retransmit = Some(seqs);
        src = rest;
    }
    if flags & flag::ACK_SEQUENCE != 0 {
        let raw: u32 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.ack_sequence = Some(PacketSeq::new(raw));
    }
    if flags & flag::DISCONNECT != 0 {
        out.disconnect = true;
    }
    if flags & flag::CONNECT_REQUEST != 0 {
        out.connect_request =
            Some(src.read().map_err(|_| FrameError::UnknownFlagShape)?);
    }
    if flags & flag::CONNECT_RESPONSE != 0 {
        let cookie: u64 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.connect_response = Some(cookie);
    }
    if flags & flag::TIME_SYNC != 0 {
        let t: f64 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.time_sync = Some(t);
    }
    if flags & flag::ECHO_REQUEST != 0 {
        let t: u32 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.echo_request = Some(t);
    }
    if flags & flag::ECHO_RESPONSE != 0 {
        let t: u64 = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.echo_response = Some(t);
    }
    if flags & flag::FLOW != 0 {
        let f: FlowBody = src.read().map_err(|_| FrameError::UnknownFlagShape)?;
        out.flow = Some(f);
    }

    Ok((out, src))
}

/// Writes every optional-header block that `flags` indicates, in the same
/// fixed order [`parse_optional_headers`] expects.
pub fn build_optional_headers(dst: &mut Vec<u8>, flags: u32, headers: &OptionalHeaders) {
    // SERVER_SWITCH carries no body.
    if flags & flag::REQUEST_RETRANSMIT != 0 {
        let seqs = headers.request_retransmit.as_deref().unwrap_or_default();
        let _ = dst.write(&(seqs.len() as u32));
        for seq in seqs {
            let _ = dst.write(&seq.0.0);
        }
    }
    if flags & flag::REJECT_RETRANSMIT != 0 {
        let seqs = headers.reject_retransmit.as_deref().unwrap_or_default();
        let _ = dst.write(&(seqs.len() as u32));
        for seq in seqs {
            let _ = dst.write(&seq.0.0);
        }
    }
    if flags & flag::ACK_SEQUENCE != 0 {
        let seq = headers.ack_sequence.unwrap_or_default();
        let _ = dst.write(&seq.0.0);
    }
    // DISCONNECT carries no body.
    if flags & flag::CONNECT_REQUEST != 0 {
        if let Some(body) = &headers.connect_request {
            let _ = dst.write(body);
        }
    }
    if flags & flag::CONNECT_RESPONSE != 0 {
        let _ = dst.write(&headers.connect_response.unwrap_or_default());
    }
    if flags & flag::TIME_SYNC != 0 {
        let _ = dst.write(&headers.time_sync.unwrap_or_default());
    }
    if flags & flag::ECHO_REQUEST != 0 {
        let _ = dst.write(&headers.echo_request.unwrap_or_default());
    }
    if flags & flag::ECHO_RESPONSE != 0 {
        let _ = dst.write(&headers.echo_response.unwrap_or_default());
    }
    if flags & flag::FLOW != 0 {
        if let Some(body) = &headers.flow {
            let _ = dst.write(body);
        }
    }
}

/// A fully decoded packet, plus the exact byte ranges of its components
/// needed to recompute the composite checksum for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Per-packet sequence number.
    pub sequence: PacketSeq,
    /// Raw flag bitmask.
    pub flags: u32,
    /// Server-assigned client id.
    pub client_id: u16,
    /// Rolling sender-local time.
    pub time: u16,
    /// Decoded optional-header blocks.
    pub optional: OptionalHeaders,
    /// Fragments carried by this packet, present iff
    /// [`flag::BLOB_FRAGMENTS`] was set.
    pub fragments: Vec<Fragment>,
    /// Raw login/world-login payload, present iff [`flag::LOGIN_REQUEST`]
    /// or [`flag::WORLD_LOGIN_REQUEST`] was set. These handshake packets
    /// precede fragment-based messaging entirely, so their payload is
    /// carried unfragmented, directly after the optional-header block.
    pub login_payload: Option<Vec<u8>>,
}

/// The header hash and composite payload hash computed while decoding a
/// packet, needed by the caller to verify (or, on the encode side,
/// recompute) the checksum. See [`crate::integrity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHashes {
    /// `Hash32` of the 20-byte header with the checksum field replaced by
    /// the sentinel.
    pub header_hash: u32,
    /// Sum of `Hash32` over every logical payload component.
    pub payload_hash: u32,
}

/// Parses a raw UDP datagram into a [`Packet`] plus the hashes needed to
/// verify its checksum. Does not itself verify the checksum or consult a
/// keystream; see [`crate::integrity::recover_keystream_word`] for that.
pub fn decode_packet(datagram: &[u8]) -> Result<(Packet, u32, PacketHashes), FrameError> {
    if datagram.len() < RawHeader::ENCODE_LEN {
        return Err(FrameError::ShortDatagram { len: datagram.len() });
    }
    let mut cursor = datagram;
    let header: RawHeader = cursor.read().map_err(|e| match e {
        BufTooShortOr::TooShort => FrameError::ShortDatagram { len: datagram.len() },
        BufTooShortOr::Other(bad) => FrameError::BadIteration(bad),
    })?;

    let body = cursor;
    if body.len() != header.size as usize {
        return Err(FrameError::SizeMismatch { claimed: header.size as usize, actual: body.len() });
    }

    let mut header_bytes = datagram[..RawHeader::ENCODE_LEN].to_vec();
    header_bytes[4..8].copy_from_slice(&crate::integrity::HEADER_HASH_SENTINEL.to_le_bytes());
    let header_hash = crate::integrity::hash32(&header_bytes);

    let mut components: Vec<&[u8]> = Vec::new();

    let (optional, mut rest) = parse_optional_headers(body, header.flags)?;
    let opt_slice = consumed(body, body, rest);
    if !opt_slice.is_empty() {
        components.push(opt_slice);
    }

    let mut fragments = Vec::new();
    let mut login_payload = None;

    if header.flags & flag::BLOB_FRAGMENTS != 0 {
        while !rest.is_empty() {
            let before_header = rest;
            let fh: FragmentHeader =
                rest.read().map_err(|_| FrameError::UnknownFlagShape)?;
            let header_slice = consumed(body, before_header, rest);

            let data_len = (fh.size_including_header as usize)
                .checked_sub(FragmentHeader::ENCODE_LEN)
                .ok_or(FrameError::FragmentOverrun { claimed: 0, available: rest.len() })?;
            if data_len > rest.len() {
                return Err(FrameError::FragmentOverrun { claimed: data_len, available: rest.len() });
            }
            let data = rest[..data_len].to_vec();
            components.push(header_slice);
            components.push(&rest[..data_len]);
            rest = &rest[data_len..];

            let consumed_in_packet = body.len() - rest.len();
            let pad = pad4(consumed_in_packet);
            let pad = pad.min(rest.len());
            rest = &rest[pad..];

            fragments.push(Fragment { header: fh, data });
        }
    } else if header.flags & (flag::LOGIN_REQUEST | flag::WORLD_LOGIN_REQUEST) != 0 {
        login_payload = Some(rest.to_vec());
        rest = &[];
    }

    let payload_hash = crate::integrity::composite_payload_hash(components);

    let packet = Packet {
        sequence: header.sequence,
        flags: header.flags,
        client_id: header.client_id,
        time: header.time,
        optional,
        fragments,
        login_payload,
    };
    Ok((packet, header.checksum, PacketHashes { header_hash, payload_hash }))
}

/// Serializes `packet` to a datagram, computing and filling in the
/// checksum as it goes. `keystream` must be `Some` iff
/// [`flag::ENCRYPTED_CHECKSUM`] is set in `packet.flags`.
pub fn encode_packet(
    packet: &Packet,
    keystream: Option<&mut crate::keystream::Keystream>,
) -> Vec<u8> {
    let mut payload = Vec::new();
    build_optional_headers(&mut payload, packet.flags, &packet.optional);

    let mut components_owned: Vec<Vec<u8>> = Vec::new();
    let opt_len = payload.len();
    if opt_len > 0 {
        components_owned.push(payload[..opt_len].to_vec());
    }

    if packet.flags & flag::BLOB_FRAGMENTS != 0 {
        for frag in &packet.fragments {
            let mut header_bytes = Vec::new();
            let _ = frag.header.encode(&mut header_bytes);
            payload.extend_from_slice(&header_bytes);
            payload.extend_from_slice(&frag.data);
            components_owned.push(header_bytes);
            components_owned.push(frag.data.clone());

            let pad = pad4(payload.len());
            payload.extend(std::iter::repeat_n(0u8, pad));
        }
    } else if let Some(login) = &packet.login_payload {
        payload.extend_from_slice(login);
    }

    let mut header_bytes = Vec::with_capacity(RawHeader::ENCODE_LEN);
    let raw = RawHeader {
        sequence: packet.sequence,
        flags: packet.flags,
        checksum: crate::integrity::HEADER_HASH_SENTINEL,
        client_id: packet.client_id,
        time: packet.time,
        size: u16::try_from(payload.len()).expect("packet payload exceeds u16::MAX bytes"),
    };
    let _ = raw.encode(&mut header_bytes);

    let checksum = crate::integrity::checksum(
        &header_bytes,
        components_owned.iter().map(Vec::as_slice),
        keystream,
    );
    header_bytes[4..8].copy_from_slice(&checksum.to_le_bytes());

    let mut datagram = header_bytes;
    datagram.extend_from_slice(&payload);
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_header(flags: u32, size: u16) -> Vec<u8> {
        let raw = RawHeader {
            sequence: PacketSeq::new(7),
            flags,
            checksum: 0,
            client_id: 1,
            time: 2,
            size,
        };
        let mut buf = Vec::new();
        raw.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn rejects_short_datagram() {
        let err = decode_packet(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, FrameError::ShortDatagram { .. }));
    }

    #[test]
    fn rejects_bad_iteration() {
        let mut datagram = bare_header(0, 0);
        let len = datagram.len();
        datagram[len - 2..].copy_from_slice(&0xFFFFu16.to_le_bytes());
        let err = decode_packet(&datagram).unwrap_err();
        assert!(matches!(err, FrameError::BadIteration(_)));
    }

    #[test]
    fn round_trips_keepalive_with_ack() {
        let mut headers = OptionalHeaders::default();
        headers.ack_sequence = Some(PacketSeq::new(41));
        let packet = Packet {
            sequence: PacketSeq::new(9),
            flags: flag::ACK_SEQUENCE,
            client_id: 5,
            time: 100,
            optional: headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = encode_packet(&packet, None);
        let (decoded, _checksum, _hashes) = decode_packet(&datagram).unwrap();
        assert_eq!(decoded.sequence, packet.sequence);
        assert_eq!(decoded.optional.ack_sequence, Some(PacketSeq::new(41)));
    }

    #[test]
    fn round_trips_single_fragment() {
        let frag = Fragment {
            header: FragmentHeader {
                fragment_sequence: FragSeq::new(3),
                message_id: 0xAABB,
                count: 1,
                size_including_header: 16 + 8,
                index: 0,
                queue: 0,
            },
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let packet = Packet {
            sequence: PacketSeq::new(10),
            flags: flag::BLOB_FRAGMENTS,
            client_id: 5,
            time: 100,
            optional: OptionalHeaders::default(),
            fragments: vec![frag.clone()],
            login_payload: None,
        };
        let datagram = encode_packet(&packet, None);
        let (decoded, checksum, hashes) = decode_packet(&datagram).unwrap();
        assert_eq!(decoded.fragments, vec![frag]);
        assert_eq!(checksum, hashes.header_hash.wrapping_add(hashes.payload_hash));
    }

    #[test]
    fn fragment_sum_of_sizes_matches_declared_payload_size() {
        let frags = vec![
            Fragment {
                header: FragmentHeader {
                    fragment_sequence: FragSeq::new(1),
                    message_id: 1,
                    count: 2,
                    size_including_header: 16 + 3,
                    index: 0,
                    queue: 0,
                },
                data: vec![1, 2, 3],
            },
            Fragment {
                header: FragmentHeader {
                    fragment_sequence: FragSeq::new(1),
                    message_id: 1,
                    count: 2,
                    size_including_header: 16 + 5,
                    index: 1,
                    queue: 0,
                },
                data: vec![4, 5, 6, 7, 8],
            },
        ];
        let packet = Packet {
            sequence: PacketSeq::new(1),
            flags: flag::BLOB_FRAGMENTS,
            client_id: 0,
            time: 0,
            optional: OptionalHeaders::default(),
            fragments: frags,
            login_payload: None,
        };
        let datagram = encode_packet(&packet, None);
        let (decoded, _, _) = decode_packet(&datagram).unwrap();
        let declared_size = u16::from_le_bytes([datagram[16], datagram[17]]) as usize;

        let mut running = 0usize;
        for frag in &decoded.fragments {
            running += frag.header.size_including_header as usize;
            running += pad4(running);
        }
        assert_eq!(declared_size, running);
    }

    #[test]
    fn connect_request_body_round_trip() {
        let body = ConnectRequestBody {
            server_time: 12345.5,
            cookie: 0xDEAD_BEEF_0000_0001,
            assigned_client_id: 77,
            server_seed: 0x1111_2222,
            client_seed: 0x3333_4444,
        };
        let mut buf = Vec::new();
        body.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), ConnectRequestBody::ENCODE_LEN);
        let decoded = ConnectRequestBody::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn round_trips_server_switch_flag() {
        let packet = Packet {
            sequence: PacketSeq::new(12),
            flags: flag::SERVER_SWITCH,
            client_id: 5,
            time: 100,
            optional: OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = encode_packet(&packet, None);
        let (decoded, _checksum, _hashes) = decode_packet(&datagram).unwrap();
        assert!(decoded.optional.server_switch);
    }
}
