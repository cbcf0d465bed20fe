//! The top-level error taxonomy (§7).
//!
//! Per-datagram recoverable failures ([`crate::framing::FrameError`],
//! checksum mismatches) never reach this type: they're logged and counted
//! at the point they occur and the offending datagram is dropped. This enum
//! is reserved for failures that actually terminate a session or need to
//! reach a specific opcode handler.

use derive_more::{Display, Error};

use crate::framing::FrameError;

/// A fatal or handler-visible error from the core network stack.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The underlying UDP socket returned an I/O error.
    #[display("io error")]
    Io(#[from] std::io::Error),

    /// An incoming encrypted packet's checksum implied a keystream word that
    /// didn't match the next expected one, outside the tolerated drift
    /// window; the two sides' keystreams have desynced and the session
    /// cannot continue.
    #[display("keystream desync: session keystream word did not match")]
    DecryptionDesync,

    /// A flag was set that is not permitted in the session's current state
    /// (e.g. the encrypted-checksum flag before the handshake completes).
    #[display("flag {flag:#x} is not valid in state {state}")]
    ProtocolStateViolation {
        /// The offending flag bit.
        flag: u32,
        /// Name of the session state it was rejected in.
        state: &'static str,
    },

    /// The handshake, or the session as a whole, did not complete in time.
    #[display("timed out waiting for {_0}")]
    Timeout(#[error(not(source))] &'static str),

    /// The peer cleanly closed the session.
    #[display("peer disconnected")]
    PeerDisconnected,

    /// A known opcode's payload failed to decode.
    #[display("malformed message: opcode {opcode:#x}, field {field} at offset {offset}")]
    MalformedMessage {
        /// Opcode of the message that failed to decode.
        opcode: u32,
        /// Name of the field the decoder was reading when it failed.
        field: &'static str,
        /// Byte offset into the message payload.
        offset: usize,
    },

    /// Too many messages are buffered awaiting reassembly or
    /// retransmission; the session-wide memory cap (§5) was exceeded.
    #[display("reassembly/retention memory cap exceeded")]
    ReassemblyOverflow,

    /// The framing layer rejected an outbound packet it was asked to build;
    /// unlike inbound framing errors, these are programmer errors (§4.4).
    #[display("failed to build outbound packet")]
    Framing(#[from] FrameError),
}

/// An opcode was received with no registered decoder. Not an error: per
/// §4.8/§7, unsupported opcodes are delivered as opaque `(opcode, bytes)` to
/// the default handler rather than surfaced as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("opcode {_0:#x} has no registered decoder")]
pub struct Unsupported(#[error(not(source))] pub u32);
