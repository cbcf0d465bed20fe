//! Saturating send/receive counters for one [`crate::session::Session`].
//!
//! Everything observable outside a handful of lifecycle
//! [`crate::events::SessionEvent`]s is exposed only here and through
//! `tracing`; there is no per-message or per-packet callback.

use std::num::Saturating;

use derive_more::{Add, AddAssign, Sub, SubAssign};

/// A point-in-time snapshot of one session's traffic counters, cheap to
/// clone and safe to diff against an earlier snapshot (`a - b`) to get a
/// delta over some interval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Add, AddAssign, Sub, SubAssign)]
pub struct Stats {
    /// Datagrams received and successfully parsed and checksum-verified.
    pub packets_recv: Saturating<usize>,
    /// Datagrams sent, one per fragment for a fragmented message.
    pub packets_sent: Saturating<usize>,
    /// Application messages delivered to the caller, after reassembly.
    pub msgs_recv: Saturating<usize>,
    /// Application messages handed to [`crate::session::Session::send_message`],
    /// counted once regardless of how many fragments it was split into.
    pub msgs_sent: Saturating<usize>,
    /// `AckSequence` optional headers received.
    pub acks_recv: Saturating<usize>,
    /// Datagrams resent via [`crate::reliability::SendLog::retransmission_bytes`]
    /// in answer to a peer's `RequestRetransmit`.
    pub retransmits_sent: Saturating<usize>,
    /// Bytes received, header and payload together.
    pub bytes_recv: Saturating<usize>,
    /// Bytes sent, header and payload together.
    pub bytes_sent: Saturating<usize>,
    /// Datagrams dropped before reaching the application: truncated/malformed
    /// on decode, or failing checksum verification (§7).
    pub bad_datagrams_recv: Saturating<usize>,
}

impl Stats {
    /// An all-zero snapshot, same as [`Default::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_subtracts_componentwise() {
        let earlier = Stats { packets_sent: Saturating(3), bytes_sent: Saturating(300), ..Stats::new() };
        let later = Stats { packets_sent: Saturating(5), bytes_sent: Saturating(500), ..Stats::new() };
        let delta = later - earlier;
        assert_eq!(delta.packets_sent, Saturating(2));
        assert_eq!(delta.bytes_sent, Saturating(200));
    }
}
