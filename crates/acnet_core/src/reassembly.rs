//! Reassembles the fragments emitted by [`crate::framing`] back into
//! complete application messages.
//!
//! Distinct from per-packet reliability (see [`crate::reliability`]):
//! fragments are keyed by [`FragSeq`], a sequence completely independent of
//! the per-packet [`crate::seq::PacketSeq`] used for ACK/NAK bookkeeping.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use octs::FixedEncodeLen;
use typesize::{derive::TypeSize, TypeSize as _};

use crate::{
    framing::{Fragment, FragmentHeader},
    seq::FragSeq,
};

/// One fragment's worth of bookkeeping inside a [`PendingMessage`].
#[derive(Debug, Clone, TypeSize)]
struct Slot {
    data: Vec<u8>,
}

/// A message currently being reassembled from its fragments.
#[derive(Debug, Clone, TypeSize)]
struct PendingMessage {
    message_id: u32,
    queue: u16,
    expected_count: u16,
    received: AHashMap<u16, Slot>,
    arrived_at: Instant,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        self.received.len() == usize::from(self.expected_count)
    }

    fn concat(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for index in 0..self.expected_count {
            if let Some(slot) = self.received.get(&index) {
                out.extend_from_slice(&slot.data);
            }
        }
        out
    }
}

/// A fully reassembled application message, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    /// Fragment sequence the message was reassembled from; used by the
    /// caller to order delivery when multiple messages complete from the
    /// same datagram (lower `fragment_sequence` is delivered first).
    pub fragment_sequence: FragSeq,
    /// Opcode carried by the message's fragments.
    pub message_id: u32,
    /// Destination queue the message should be delivered to.
    pub queue: u16,
    /// Concatenated payload bytes, in fragment-index order.
    pub payload: Vec<u8>,
}

/// Splits `payload` into one or more [`Fragment`]s no larger than
/// `max_fragment_data` bytes of data each, all sharing `fragment_sequence`
/// and `message_id` (§4.5). A payload that fits in a single fragment still
/// gets a `count: 1` fragment header, the form [`ReassemblyTable::receive`]
/// special-cases for immediate delivery.
#[must_use]
pub fn fragment_message(
    fragment_sequence: FragSeq,
    message_id: u32,
    queue: u16,
    payload: &[u8],
    max_fragment_data: usize,
) -> Vec<Fragment> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_fragment_data.max(1)).collect()
    };
    let count = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, data)| Fragment {
            header: FragmentHeader {
                fragment_sequence,
                message_id,
                count,
                size_including_header: (FragmentHeader::ENCODE_LEN + data.len()) as u16,
                index: index as u16,
                queue,
            },
            data: data.to_vec(),
        })
        .collect()
}

/// Buffers fragments keyed by [`FragSeq`] and emits [`ReassembledMessage`]s
/// once every expected index has arrived.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    pending: AHashMap<FragSeq, PendingMessage>,
}

/// A fragment could not be buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// This index was already received for this `fragment_sequence`.
    #[error("duplicate fragment {index} for fragment sequence {fragment_sequence:?}")]
    Duplicate {
        /// The fragment sequence the duplicate was received under.
        fragment_sequence: FragSeq,
        /// The repeated index.
        index: u16,
    },
    /// Accepting this fragment would exceed the session's memory cap.
    #[error("reassembly buffer is full")]
    Overflow,
}

impl ReassemblyTable {
    /// Builds an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently being reassembled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no messages are currently pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total bytes currently buffered across all pending messages, used to
    /// enforce the session-wide memory cap (§5).
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.pending
            .values()
            .flat_map(|m| m.received.values())
            .map(|s| s.data.len())
            .sum()
    }

    /// Feeds one fragment in. Returns `Some` once the fragment it belongs to
    /// is complete (including immediately, for single-fragment messages),
    /// dropping the entry.
    pub fn receive(
        &mut self,
        fragment: &Fragment,
        now: Instant,
        max_buffered_bytes: usize,
    ) -> Result<Option<ReassembledMessage>, ReassemblyError> {
        let seq = fragment.header.fragment_sequence;

        if fragment.header.count == 1 {
            self.pending.remove(&seq);
            return Ok(Some(ReassembledMessage {
                fragment_sequence: seq,
                message_id: fragment.header.message_id,
                queue: fragment.header.queue,
                payload: fragment.data.clone(),
            }));
        }

        if self.buffered_bytes() + fragment.data.len() > max_buffered_bytes
            && !self.pending.contains_key(&seq)
        {
            return Err(ReassemblyError::Overflow);
        }

        let entry = self.pending.entry(seq).or_insert_with(|| PendingMessage {
            message_id: fragment.header.message_id,
            queue: fragment.header.queue,
            expected_count: fragment.header.count,
            received: AHashMap::default(),
            arrived_at: now,
        });

        if entry.received.contains_key(&fragment.header.index) {
            return Err(ReassemblyError::Duplicate {
                fragment_sequence: seq,
                index: fragment.header.index,
            });
        }
        entry
            .received
            .insert(fragment.header.index, Slot { data: fragment.data.clone() });

        if entry.is_complete() {
            let entry = self.pending.remove(&seq).expect("just inserted above");
            Ok(Some(ReassembledMessage {
                fragment_sequence: seq,
                message_id: entry.message_id,
                queue: entry.queue,
                payload: entry.concat(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Drops every pending entry older than `ttl`, as measured from the
    /// arrival of its first fragment.
    pub fn expire(&mut self, now: Instant, ttl: Duration) {
        self.pending.retain(|_, msg| now.duration_since(msg.arrived_at) < ttl);
    }

    /// Drops every pending entry. Used on disconnect (§5, Cancellation).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FragmentHeader;

    fn frag(seq: u32, count: u16, index: u16, data: &[u8]) -> Fragment {
        Fragment {
            header: FragmentHeader {
                fragment_sequence: FragSeq::new(seq),
                message_id: 42,
                count,
                size_including_header: 16 + data.len() as u16,
                index,
                queue: 0,
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn single_fragment_emits_immediately() {
        let mut table = ReassemblyTable::new();
        let msg = table
            .receive(&frag(1, 1, 0, b"hello"), Instant::now(), 1 << 20)
            .unwrap()
            .expect("single-fragment message completes immediately");
        assert_eq!(msg.payload, b"hello");
        assert!(table.is_empty());
    }

    #[test]
    fn reassembles_regardless_of_arrival_order() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        let parts: [&[u8]; 3] = [b"aaa", b"bbb", b"ccc"];
        let order = [2, 0, 1];

        let mut completed = None;
        for &index in &order {
            let result = table
                .receive(&frag(9, 3, index, parts[index as usize]), now, 1 << 20)
                .unwrap();
            if result.is_some() {
                completed = result;
            }
        }

        let msg = completed.expect("message should complete after all 3 fragments arrive");
        assert_eq!(msg.payload, b"aaabbbccc");
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        table.receive(&frag(4, 2, 0, b"ab"), now, 1 << 20).unwrap();
        let err = table.receive(&frag(4, 2, 0, b"ab"), now, 1 << 20).unwrap_err();
        assert!(matches!(err, ReassemblyError::Duplicate { .. }));
    }

    #[test]
    fn fragment_then_reassemble_round_trips() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let fragments = fragment_message(FragSeq::new(3), 99, 1, &payload, 10);
        assert!(fragments.len() > 1);

        let mut table = ReassemblyTable::new();
        let mut completed = None;
        for fragment in &fragments {
            if let Some(msg) = table.receive(fragment, Instant::now(), 1 << 20).unwrap() {
                completed = Some(msg);
            }
        }
        let msg = completed.expect("message should complete once all fragments arrive");
        assert_eq!(msg.payload, payload);
        assert_eq!(msg.queue, 1);
    }

    #[test]
    fn expires_stale_entries() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        table.receive(&frag(1, 2, 0, b"a"), now, 1 << 20).unwrap();
        assert_eq!(table.len(), 1);
        table.expire(now + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(table.len(), 0);
    }
}
