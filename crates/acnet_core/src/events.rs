//! Session lifecycle events delivered to the upper layer (§4.8,
//! `SessionEvents`). These, plus delivered application messages, are the
//! *only* user-visible surface of the core: everything else is internal
//! telemetry (§7).

use std::time::Duration;

/// A session lifecycle event, emitted to whatever listener was registered
/// via the upper layer's `SessionEvents` operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The handshake completed; the session is authenticated and
    /// encrypted-checksum traffic may now flow.
    Connected,
    /// A `TimeSync` packet was applied to the local server-time estimate.
    TimeSyncApplied {
        /// Server time sample the sync carried.
        server_time: f64,
    },
    /// An echo request we sent was answered, yielding a round-trip sample.
    EchoRoundTripMeasured {
        /// Measured round-trip time.
        rtt: Duration,
    },
    /// The peer asked us to resend one or more packets.
    PeerRequestedRetransmit {
        /// Number of sequences the peer listed as missing.
        count: usize,
    },
    /// The session has ended and will accept no further traffic.
    Disconnected(DisconnectReason),
}

/// Why a session transitioned to `Dead` (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The upper layer called `Disconnect()`.
    UserRequested,
    /// The peer sent a packet with the `Disconnect` flag set.
    PeerDisconnected,
    /// No traffic was received within the inactivity timeout.
    InactivityTimeout,
    /// The handshake did not complete before its own timeout.
    HandshakeTimeout,
    /// A fatal protocol error terminated the session; rendered from the
    /// originating [`crate::error::CoreError`] since that type itself
    /// wraps non-`Clone` I/O errors.
    Error(String),
}
