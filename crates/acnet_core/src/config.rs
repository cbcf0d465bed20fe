//! Tunables for one [`crate::session::Session`], collecting every wire-level
//! timing and size constant behind a single, once-constructed value.

use std::time::Duration;

/// Maximum number of bytes in a single outbound UDP datagram.
pub const MAX_UDP_PAYLOAD: usize = 1024;

/// Maximum number of data bytes (excluding the 16-byte fragment header) in a
/// single fragment.
pub const MAX_FRAGMENT_DATA: usize = 448;

/// As [`MAX_FRAGMENT_DATA`], including the fragment header.
pub const MAX_FRAGMENT_SIZE: usize = MAX_FRAGMENT_DATA + 16;

/// Tunable timing and resource limits for a session.
///
/// Constructed once per session and passed into
/// [`crate::session::Session::new`]; not hot-reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest UDP datagram this session will ever send.
    pub max_udp_payload: usize,
    /// Largest data portion of a single fragment.
    pub max_fragment_data: usize,
    /// A session with no traffic for this long is considered dead.
    pub inactivity_timeout: Duration,
    /// Upper bound on how long a received sequence can go un-acked before an
    /// ACK must be flushed.
    pub ack_coalesce_window: Duration,
    /// Lower bound on how stale a gap in received sequences must be before
    /// it is worth requesting a retransmit for.
    pub retransmit_threshold: Duration,
    /// A session with no *sent* traffic for this long emits a keep-alive.
    pub keep_alive_interval: Duration,
    /// Minimum delay between receiving `ConnectRequest` and sending
    /// `ConnectResponse`, to give the peer's own asynchronous bookkeeping
    /// (e.g. a database lookup) time to settle.
    pub handshake_activation_delay: Duration,
    /// A handshake (from `LoginRequest` to `Authenticated`) that hasn't
    /// completed within this long surfaces as
    /// `Disconnected(HandshakeTimeout)` (§7) rather than hanging forever.
    pub handshake_timeout: Duration,
    /// Pending reassembly entries older than this are dropped incomplete.
    pub reassembly_ttl: Duration,
    /// Combined cap, in bytes, on retained-for-retransmit and
    /// pending-reassembly memory; exceeding it terminates the session.
    pub max_memory_usage: usize,
    /// Consecutive encrypted-checksum mismatches tolerated before the
    /// session is considered keystream-desynced and torn down (§4.3, §9).
    /// The reference description names the tolerated-drift window without
    /// pinning a count; a single dropped/reordered encrypted packet (the
    /// reliability layer recovering it out of band) should not alone read
    /// as a desync, so this allows a small run of consecutive failures
    /// before giving up.
    pub desync_tolerance: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_udp_payload: MAX_UDP_PAYLOAD,
            max_fragment_data: MAX_FRAGMENT_DATA,
            inactivity_timeout: Duration::from_secs(60),
            ack_coalesce_window: Duration::from_millis(200),
            retransmit_threshold: Duration::from_millis(300),
            keep_alive_interval: Duration::from_secs(5),
            handshake_activation_delay: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(10),
            reassembly_ttl: Duration::from_secs(30),
            max_memory_usage: 4 * 1024 * 1024,
            desync_tolerance: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.max_udp_payload, 1024);
        assert_eq!(config.max_fragment_data, 448);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(config.ack_coalesce_window, Duration::from_millis(200));
        assert_eq!(config.retransmit_threshold, Duration::from_millis(300));
    }
}
