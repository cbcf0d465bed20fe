//! Per-packet reliability: the high-watermark ACK tracker, gap-driven NAK
//! requests, and the retained-for-retransmit send log.
//!
//! This is deliberately independent of [`crate::reassembly`], which tracks a
//! completely different sequence space (§4.5): a packet can be acked and
//! still be waiting on sibling fragments, and a fragment can complete a
//! message well before every packet up to it has been acked.

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use ahash::AHashMap;

use crate::{
    framing::flag,
    integrity::{hash32, HEADER_HASH_SENTINEL},
    seq::PacketSeq,
};

/// Tracks which per-packet sequences we've received from the peer, for the
/// purposes of computing an ACK high-watermark and detecting gaps worth
/// requesting a retransmit for.
#[derive(Debug, Default)]
pub struct AckTracker {
    /// Highest sequence such that every sequence `<= high_watermark` has
    /// been received (i.e. no gaps below it).
    high_watermark: Option<PacketSeq>,
    /// Sequences received strictly after `high_watermark`, out of order,
    /// each with the instant it was first observed missing.
    out_of_order: BTreeSet<PacketSeq>,
    /// First time each sequence below `out_of_order`'s frontier was noticed
    /// missing, used to age gaps past the NAK threshold.
    gap_first_seen: AHashMap<PacketSeq, Instant>,
}

impl AckTracker {
    /// Builds a tracker with no packets received yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ACK high-watermark, if any packet has been received.
    #[must_use]
    pub fn high_watermark(&self) -> Option<PacketSeq> {
        self.high_watermark
    }

    /// Records that `seq` was successfully decoded (i.e. its checksum
    /// verified), advancing the high-watermark and/or buffering it as
    /// out-of-order.
    pub fn on_received(&mut self, seq: PacketSeq, now: Instant) {
        match self.high_watermark {
            None => {
                self.high_watermark = Some(seq);
            }
            Some(hw) if seq <= hw => {
                // already covered or a stale retransmit; nothing to do.
            }
            Some(hw) if seq == hw.next() => {
                self.high_watermark = Some(seq);
                self.advance_contiguous();
            }
            Some(_) => {
                self.out_of_order.insert(seq);
                self.gap_first_seen.entry(seq).or_insert(now);
            }
        }
    }

    /// After advancing `high_watermark` by one, absorb any buffered
    /// out-of-order sequences that are now contiguous.
    fn advance_contiguous(&mut self) {
        loop {
            let Some(hw) = self.high_watermark else { return };
            let next = hw.next();
            if self.out_of_order.remove(&next) {
                self.gap_first_seen.remove(&next);
                self.high_watermark = Some(next);
            } else {
                return;
            }
        }
    }

    /// Sequences missing between the high-watermark and the lowest buffered
    /// out-of-order sequence, whose gap has persisted longer than
    /// `threshold` and so are worth requesting a retransmit for.
    #[must_use]
    pub fn stale_gaps(&self, now: Instant, threshold: Duration) -> Vec<PacketSeq> {
        let Some(hw) = self.high_watermark else { return Vec::new() };
        let Some(&highest_buffered) = self.out_of_order.iter().next_back() else {
            return Vec::new();
        };

        let mut missing = Vec::new();
        let mut cursor = hw.next();
        while cursor <= highest_buffered {
            if !self.out_of_order.contains(&cursor) {
                let aged = self
                    .gap_first_seen
                    .get(&cursor)
                    .is_some_and(|&first_seen| now.duration_since(first_seen) >= threshold);
                if aged {
                    missing.push(cursor);
                }
            }
            cursor = cursor.next();
        }
        missing
    }
}

/// One packet's worth of bytes retained in case the peer reports it
/// missing, plus the checksum inputs needed to rebuild it with the
/// `Retransmission` flag set (§4.4, §4.5) without consuming a fresh
/// keystream word.
#[derive(Debug, Clone)]
struct Retained {
    bytes: Vec<u8>,
    sent_at: Instant,
    payload_hash: u32,
    /// Keystream word folded into the original checksum, if the packet was
    /// sent with `EncryptedChecksum` set. Reused verbatim on resend.
    keystream_word: Option<u32>,
}

/// Outbound packets kept around, keyed by their original per-packet
/// sequence, until the peer acknowledges a sequence at or past them.
#[derive(Debug, Default)]
pub struct SendLog {
    retained: AHashMap<PacketSeq, Retained>,
}

impl SendLog {
    /// Builds an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets currently retained for possible resend.
    #[must_use]
    pub fn len(&self) -> usize {
        self.retained.len()
    }

    /// Returns `true` if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    /// Total bytes currently retained, used to enforce the session memory
    /// cap (§5).
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.retained.values().map(|r| r.bytes.len()).sum()
    }

    /// Records that `seq` was just transmitted with these exact bytes,
    /// alongside the payload hash and (if encrypted) keystream word that
    /// went into its checksum, so a later retransmit can be rebuilt without
    /// recomputing the payload hash or consuming a new keystream word.
    pub fn record(
        &mut self,
        seq: PacketSeq,
        bytes: Vec<u8>,
        sent_at: Instant,
        payload_hash: u32,
        keystream_word: Option<u32>,
    ) {
        self.retained.insert(seq, Retained { bytes, sent_at, payload_hash, keystream_word });
    }

    /// Drops every retained packet with sequence `<= ack`, per §4.5's
    /// retention rule ("until any ACK value >= that sequence is seen").
    pub fn on_ack(&mut self, ack: PacketSeq) {
        self.retained.retain(|&seq, _| seq > ack);
    }

    /// Builds the datagram to resend for `seq` in answer to a peer's
    /// `RequestRetransmit`: the original payload bytes, unchanged, under a
    /// header with the `Retransmission` flag set and the checksum
    /// recomputed over that new header using the *original* payload hash
    /// and keystream word (§4.5 — a resend consumes no additional
    /// keystream word).
    #[must_use]
    pub fn retransmission_bytes(&self, seq: PacketSeq) -> Option<Vec<u8>> {
        let retained = self.retained.get(&seq)?;
        debug_assert!(retained.bytes.len() >= 20, "retained datagram shorter than the fixed header");

        let mut header = retained.bytes[..20].to_vec();
        let orig_flags = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        let new_flags = orig_flags | flag::RETRANSMISSION;
        header[4..8].copy_from_slice(&new_flags.to_le_bytes());
        header[8..12].copy_from_slice(&HEADER_HASH_SENTINEL.to_le_bytes());

        let header_hash = hash32(&header);
        let checksum = match retained.keystream_word {
            Some(word) => header_hash.wrapping_add(retained.payload_hash ^ word),
            None => header_hash.wrapping_add(retained.payload_hash),
        };
        header[8..12].copy_from_slice(&checksum.to_le_bytes());

        let mut datagram = header;
        datagram.extend_from_slice(&retained.bytes[20..]);
        Some(datagram)
    }

    /// Drops every retained packet. Used on disconnect.
    pub fn clear(&mut self) {
        self.retained.clear();
    }

    /// Every currently retained sequence, oldest first, with its send time
    /// (used by the driver to decide candidates for an idle keep-alive
    /// rather than an actual resend).
    pub fn iter(&self) -> impl Iterator<Item = (PacketSeq, Instant)> + '_ {
        self.retained.iter().map(|(&seq, r)| (seq, r.sent_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_advances_in_order() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        tracker.on_received(PacketSeq::new(0), now);
        tracker.on_received(PacketSeq::new(1), now);
        tracker.on_received(PacketSeq::new(2), now);
        assert_eq!(tracker.high_watermark(), Some(PacketSeq::new(2)));
    }

    #[test]
    fn out_of_order_buffers_then_collapses() {
        let mut tracker = AckTracker::new();
        let now = Instant::now();
        tracker.on_received(PacketSeq::new(0), now);
        tracker.on_received(PacketSeq::new(2), now);
        assert_eq!(tracker.high_watermark(), Some(PacketSeq::new(0)));
        tracker.on_received(PacketSeq::new(1), now);
        assert_eq!(tracker.high_watermark(), Some(PacketSeq::new(2)));
    }

    #[test]
    fn stale_gap_is_reported_after_threshold() {
        let mut tracker = AckTracker::new();
        let t0 = Instant::now();
        tracker.on_received(PacketSeq::new(0), t0);
        tracker.on_received(PacketSeq::new(2), t0);

        let threshold = Duration::from_millis(300);
        assert!(tracker.stale_gaps(t0, threshold).is_empty());

        let later = t0 + Duration::from_millis(301);
        assert_eq!(tracker.stale_gaps(later, threshold), vec![PacketSeq::new(1)]);
    }

    fn dummy_datagram(seq: u32) -> Vec<u8> {
        let packet = crate::framing::Packet {
            sequence: PacketSeq::new(seq),
            flags: 0,
            client_id: 0,
            time: 0,
            optional: crate::framing::OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: None,
        };
        crate::framing::encode_packet(&packet, None)
    }

    #[test]
    fn ack_clears_retained_packets_at_or_below() {
        let mut log = SendLog::new();
        let now = Instant::now();
        log.record(PacketSeq::new(1), dummy_datagram(1), now, 0, None);
        log.record(PacketSeq::new(2), dummy_datagram(2), now, 0, None);
        log.record(PacketSeq::new(3), dummy_datagram(3), now, 0, None);
        log.on_ack(PacketSeq::new(2));
        assert!(log.retransmission_bytes(PacketSeq::new(1)).is_none());
        assert!(log.retransmission_bytes(PacketSeq::new(2)).is_none());
        assert!(log.retransmission_bytes(PacketSeq::new(3)).is_some());
    }

    #[test]
    fn retransmission_sets_flag_and_keeps_checksum_valid() {
        let mut log = SendLog::new();
        let now = Instant::now();
        let datagram = dummy_datagram(7);
        let (_, checksum, hashes) = crate::framing::decode_packet(&datagram).unwrap();
        log.record(PacketSeq::new(7), datagram, now, hashes.payload_hash, None);

        let resent = log.retransmission_bytes(PacketSeq::new(7)).unwrap();
        let (decoded, resent_checksum, resent_hashes) = crate::framing::decode_packet(&resent).unwrap();
        assert_eq!(decoded.flags & flag::RETRANSMISSION, flag::RETRANSMISSION);
        assert_eq!(resent_checksum, resent_hashes.header_hash.wrapping_add(resent_hashes.payload_hash));
        assert_ne!(checksum, resent_checksum, "flag bit changes the header hash, and thus the checksum");
    }
}
