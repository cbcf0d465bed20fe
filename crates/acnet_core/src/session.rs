//! The session state machine (§4.6): handshake progression from an
//! unconfigured socket through to an authenticated, encrypted session, and
//! the reliability/reassembly bookkeeping a live session carries.
//!
//! This module owns *state*, not I/O: it decides what a given inbound
//! packet means and what outbound packets (if any) should result, but the
//! actual sending/receiving is [`crate::driver`]'s job, keeping transport
//! mechanics separate from the socket-owning event loop.

use std::{
    num::Saturating,
    time::{Duration, Instant},
};

use crate::{
    config::SessionConfig,
    dispatch::{DispatchError, Dispatcher, LOGIN_OPCODE},
    error::CoreError,
    events::{DisconnectReason, SessionEvent},
    framing::{self, flag, ConnectRequestBody, Fragment, OptionalHeaders, Packet},
    keystream::Keystream,
    reassembly::ReassemblyTable,
    reliability::{AckTracker, SendLog},
    seq::{FragSeq, PacketSeq},
    stats::Stats,
};

/// The session's current position in the handshake/teardown lifecycle
/// (§4.6). Transitions are one-directional; there is no path back to an
/// earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake traffic has been sent or received yet.
    Unconfigured,
    /// We have sent `LoginRequest` (or `WorldLoginRequest`) and are waiting
    /// for the server's `ConnectRequest`.
    LoginSent,
    /// We received `ConnectRequest`; both keystreams are seeded and a
    /// `ConnectResponse` is pending (subject to
    /// [`SessionConfig::handshake_activation_delay`]).
    ConnectReceived,
    /// `ConnectResponse` has been sent; encrypted-checksum traffic now
    /// flows in both directions.
    Authenticated,
    /// Teardown has started (we sent or received `Disconnect`); no further
    /// application traffic will be processed.
    Disconnecting,
    /// The session is over and must not be used again.
    Dead,
}

impl SessionState {
    /// Name used in [`crate::error::CoreError::ProtocolStateViolation`]
    /// messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unconfigured => "Unconfigured",
            Self::LoginSent => "LoginSent",
            Self::ConnectReceived => "ConnectReceived",
            Self::Authenticated => "Authenticated",
            Self::Disconnecting => "Disconnecting",
            Self::Dead => "Dead",
        }
    }
}

/// One side of a session's identity as assigned during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Server-assigned client id, `0` until `ConnectRequest` is received.
    pub client_id: u32,
    /// Opaque cookie to echo back in `ConnectResponse`.
    pub cookie: u64,
    /// Server's clock sample at the moment of `ConnectRequest`, used to
    /// seed the local server-time estimate.
    pub server_time_at_connect: f64,
}

/// A live (or live-becoming) session's complete protocol state: one
/// instance per peer.
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    handshake: HandshakeInfo,

    next_send_seq: PacketSeq,
    ack_tracker: AckTracker,
    send_log: SendLog,
    reassembly: ReassemblyTable,
    dispatcher: Dispatcher,

    /// Consecutive encrypted packets whose checksum implied a keystream
    /// word that didn't match the next expected one. Reset to 0 on every
    /// successful encrypted verification; exceeding
    /// [`SessionConfig::desync_tolerance`] terminates the session (§4.3,
    /// §9: "outside a window of tolerated drift").
    desync_strikes: u32,

    /// Decrypts inbound packets once authenticated. `None` before the
    /// handshake supplies a seed.
    recv_keystream: Option<Keystream>,
    /// Encrypts outbound packets once authenticated.
    send_keystream: Option<Keystream>,

    last_received_at: Option<Instant>,
    last_sent_at: Option<Instant>,
    connect_received_at: Option<Instant>,
    handshake_started_at: Option<Instant>,

    /// Client time we last sent in an `EchoRequest`, plus the instant we
    /// sent it at, so a matching `EchoResponse` can yield a round-trip
    /// sample. Cleared once the matching response arrives.
    pending_echo: Option<(u32, Instant)>,
    /// Outbound throttle the peer imposed via a `Flow` header, if any.
    flow: Option<FlowBudget>,

    client_id_field: u16,
    local_time_base: Instant,

    stats: Stats,
}

/// A simple windowed token bucket driven by the peer's `Flow` optional
/// header (§4.6): at most `max_bytes` may be sent per `interval`, reset at
/// the start of each window.
#[derive(Debug, Clone, Copy)]
struct FlowBudget {
    max_bytes: u32,
    interval: Duration,
    window_start: Instant,
    used: u32,
}

impl FlowBudget {
    fn new(max_bytes: u32, interval: Duration, now: Instant) -> Self {
        Self { max_bytes, interval, window_start: now, used: 0 }
    }

    fn allow(&mut self, bytes: usize, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.interval {
            self.window_start = now;
            self.used = 0;
        }
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        if self.used.saturating_add(bytes) <= self.max_bytes {
            self.used += bytes;
            true
        } else {
            false
        }
    }
}

/// A decoded inbound packet has been applied to the session; these are the
/// visible side effects the driver needs to act on.
#[derive(Debug, Default)]
pub struct Effects {
    /// Lifecycle events to hand to the upper layer.
    pub events: Vec<SessionEvent>,
    /// Fully reassembled application messages ready for opcode dispatch.
    pub messages: Vec<ReassembledDelivery>,
    /// Outbound packets the driver should send immediately (handshake
    /// replies, acks piggybacked on receipt).
    pub outbound: Vec<Vec<u8>>,
}

/// One reassembled application message delivered to the dispatch layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassembledDelivery {
    /// Opcode the message was dispatched under; [`dispatch::LOGIN_OPCODE`]
    /// for a `LoginRequest`/`WorldLoginRequest` payload, which carries no
    /// wire opcode of its own.
    ///
    /// [`dispatch::LOGIN_OPCODE`]: crate::dispatch::LOGIN_OPCODE
    pub opcode: u32,
    /// Destination queue the message was addressed to.
    pub queue: u16,
    /// Concatenated, in-order payload bytes.
    pub payload: Vec<u8>,
}

impl Session {
    /// Builds a new, unconfigured session.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Unconfigured,
            handshake: HandshakeInfo::default(),
            next_send_seq: PacketSeq::new(0),
            ack_tracker: AckTracker::new(),
            send_log: SendLog::new(),
            reassembly: ReassemblyTable::new(),
            dispatcher: Dispatcher::new(),
            desync_strikes: 0,
            recv_keystream: None,
            send_keystream: None,
            last_received_at: None,
            last_sent_at: None,
            connect_received_at: None,
            handshake_started_at: None,
            pending_echo: None,
            flow: None,
            client_id_field: 0,
            local_time_base: Instant::now(),
            stats: Stats::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A snapshot of this session's traffic counters (§7).
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// The opcode dispatcher this session feeds every reassembled message
    /// through (§4.8): register decoders and subscribers here before
    /// driving the session.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Total bytes currently retained for possible retransmit or pending
    /// reassembly, for enforcing the session-wide memory cap (§5).
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.send_log.buffered_bytes() + self.reassembly.buffered_bytes()
    }

    /// Feeds a delivered message through [`Self::dispatcher_mut`], logging
    /// (not propagating) a decode failure: per §7, a bad payload for a
    /// known opcode is the handler's problem to surface, not a session
    /// fault.
    fn dispatch_delivered(&self, opcode: u32, payload: &[u8]) {
        if let Err(DispatchError::Decode { opcode, source }) = self.dispatcher.dispatch(opcode, payload) {
            tracing::trace!(
                error = %CoreError::MalformedMessage { opcode, field: source.field, offset: source.offset },
                "dropping message that failed opcode dispatch"
            );
        }
    }

    /// Drops pending reassembly entries older than
    /// [`SessionConfig::reassembly_ttl`]. The driver calls this on a timer;
    /// a sender that stops mid-message otherwise leaves its fragments
    /// buffered forever.
    pub fn expire_reassembly(&mut self, now: Instant) {
        self.reassembly.expire(now, self.config.reassembly_ttl);
    }

    fn rolling_time(&self) -> u16 {
        self.local_time_base.elapsed().as_millis() as u16
    }

    /// Builds the raw `LoginRequest` datagram to kick off a handshake and
    /// transitions to [`SessionState::LoginSent`]. Sent at sequence 0,
    /// unencrypted, per §4.6.
    pub fn begin_login(&mut self, world_login: bool, credentials: Vec<u8>) -> Vec<u8> {
        let flags = if world_login { flag::WORLD_LOGIN_REQUEST } else { flag::LOGIN_REQUEST };
        let packet = Packet {
            sequence: PacketSeq::new(0),
            flags,
            client_id: 0,
            time: self.rolling_time(),
            optional: OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: Some(credentials),
        };
        let datagram = framing::encode_packet(&packet, None);
        self.state = SessionState::LoginSent;
        self.next_send_seq = PacketSeq::new(1);
        let now = Instant::now();
        self.last_sent_at = Some(now);
        self.handshake_started_at = Some(now);
        self.record_send(&datagram);
        datagram
    }

    /// Folds one outbound datagram's size into [`Self::stats`].
    fn record_send(&mut self, datagram: &[u8]) {
        self.stats.packets_sent += Saturating(1);
        self.stats.bytes_sent += Saturating(datagram.len());
    }

    /// Applies one inbound, already-framed datagram to the session. Framing
    /// failures have already been filtered out by the caller (§7); this
    /// only sees datagrams that parsed.
    pub fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> Effects {
        let mut effects = Effects::default();
        if self.state == SessionState::Dead {
            return effects;
        }

        let (packet, claimed_checksum, hashes) = match framing::decode_packet(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                // malformed datagram, drop silently (§7)
                self.stats.bad_datagrams_recv += Saturating(1);
                tracing::trace!(error = %err, len = datagram.len(), "dropping malformed datagram");
                return effects;
            }
        };

        if !self.verify_checksum(&packet, claimed_checksum, hashes.header_hash, hashes.payload_hash) {
            // checksum mismatch, drop (§7)
            self.stats.bad_datagrams_recv += Saturating(1);

            let encrypted = packet.flags & flag::ENCRYPTED_CHECKSUM != 0;
            if encrypted && self.recv_keystream.is_none() {
                // peer is sending encrypted traffic before the handshake
                // gave us a keystream to decrypt it with; not a desync.
                tracing::trace!(
                    error = %CoreError::ProtocolStateViolation { flag: flag::ENCRYPTED_CHECKSUM, state: self.state.name() },
                    sequence = ?packet.sequence,
                    "dropping packet with checksum mismatch"
                );
                return effects;
            }
            tracing::trace!(sequence = ?packet.sequence, "dropping packet with checksum mismatch");

            let encrypted_non_retransmit = encrypted && packet.flags & flag::RETRANSMISSION == 0;
            if encrypted_non_retransmit {
                self.desync_strikes += 1;
                if self.desync_strikes > self.config.desync_tolerance {
                    self.state = SessionState::Dead;
                    tracing::trace!("keystream desync exceeded tolerance, terminating session");
                    effects.events.push(SessionEvent::Disconnected(DisconnectReason::Error(
                        CoreError::DecryptionDesync.to_string(),
                    )));
                }
            }
            return effects;
        }
        self.desync_strikes = 0;

        self.stats.packets_recv += Saturating(1);
        self.stats.bytes_recv += Saturating(datagram.len());
        self.last_received_at = Some(now);
        self.ack_tracker.on_received(packet.sequence, now);

        if let Some(ack) = packet.optional.ack_sequence {
            self.stats.acks_recv += Saturating(1);
            self.send_log.on_ack(ack);
        }

        if packet.optional.disconnect {
            self.state = SessionState::Dead;
            effects.events.push(SessionEvent::Disconnected(DisconnectReason::PeerDisconnected));
            return effects;
        }

        if let Some(connect_request) = packet.optional.connect_request {
            self.apply_connect_request(connect_request, now, &mut effects);
        }

        if let Some(sample) = packet.optional.time_sync {
            effects.events.push(SessionEvent::TimeSyncApplied { server_time: sample });
        }

        if let Some(requested) = &packet.optional.request_retransmit {
            effects.events.push(SessionEvent::PeerRequestedRetransmit { count: requested.len() });
            for &seq in requested {
                if let Some(datagram) = self.send_log.retransmission_bytes(seq) {
                    self.stats.retransmits_sent += Saturating(1);
                    self.record_send(&datagram);
                    effects.outbound.push(datagram);
                }
            }
        }

        if let Some(client_time) = packet.optional.echo_request {
            effects.outbound.push(self.build_echo_response(client_time, now));
        }

        if let Some(echoed) = packet.optional.echo_response {
            if let Some((sent_value, sent_at)) = self.pending_echo {
                if (echoed & 0xFFFF_FFFF) as u32 == sent_value {
                    self.pending_echo = None;
                    effects
                        .events
                        .push(SessionEvent::EchoRoundTripMeasured { rtt: now.duration_since(sent_at) });
                }
            }
        }

        if let Some(body) = packet.optional.flow {
            self.flow = Some(FlowBudget::new(body.bytes, Duration::from_millis(u64::from(body.interval_ms)), now));
        }

        if let Some(login) = &packet.login_payload {
            self.stats.msgs_recv += Saturating(1);
            self.dispatch_delivered(LOGIN_OPCODE, login);
            effects.messages.push(ReassembledDelivery { opcode: LOGIN_OPCODE, queue: 0, payload: login.clone() });
        }

        for fragment in &packet.fragments {
            self.apply_fragment(fragment, now, &mut effects);
        }

        effects
    }

    /// Allocates the next outbound per-packet sequence.
    fn take_seq(&mut self) -> PacketSeq {
        let seq = self.next_send_seq;
        self.next_send_seq = PacketSeq::new(self.next_send_seq.0.0.wrapping_add(1));
        seq
    }

    /// Encrypts and records an outbound packet the same way
    /// [`Self::send_message`] does, but without fragmenting or going
    /// through the reassembly layer: used for session-control traffic
    /// (echo, ack) that still must honor the mandatory encrypted-checksum
    /// invariant once authenticated.
    fn encode_control_packet(&mut self, packet: &Packet) -> Vec<u8> {
        if packet.flags & flag::ENCRYPTED_CHECKSUM != 0 {
            framing::encode_packet(packet, self.send_keystream.as_mut())
        } else {
            framing::encode_packet(packet, None)
        }
    }

    /// Builds the `EchoRequest` datagram to ping the peer, recording the
    /// send time so the matching `EchoResponse` can yield a round-trip
    /// sample (§4.6).
    pub fn send_echo_request(&mut self, now: Instant) -> Vec<u8> {
        let client_time = u32::try_from(self.local_time_base.elapsed().as_millis()).unwrap_or(u32::MAX);
        self.pending_echo = Some((client_time, now));

        let mut optional = OptionalHeaders::default();
        optional.echo_request = Some(client_time);
        let mut flags = flag::ECHO_REQUEST;
        if self.state == SessionState::Authenticated {
            flags |= flag::ENCRYPTED_CHECKSUM;
        }
        let seq = self.take_seq();
        let packet = Packet {
            sequence: seq,
            flags,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = self.encode_control_packet(&packet);
        self.last_sent_at = Some(now);
        self.record_send(&datagram);
        datagram
    }

    /// Builds the `EchoResponse` datagram answering a peer's `EchoRequest`,
    /// echoing its client time in the low 32 bits and our own rolling clock
    /// in the high 32 bits so the peer's RTT sample stays matchable to its
    /// own send time regardless of which side issued the original ping.
    fn build_echo_response(&mut self, client_time: u32, now: Instant) -> Vec<u8> {
        let our_time = u32::try_from(self.local_time_base.elapsed().as_millis()).unwrap_or(u32::MAX);
        let echoed = u64::from(client_time) | (u64::from(our_time) << 32);

        let mut optional = OptionalHeaders::default();
        optional.echo_response = Some(echoed);
        let mut flags = flag::ECHO_RESPONSE;
        if self.state == SessionState::Authenticated {
            flags |= flag::ENCRYPTED_CHECKSUM;
        }
        let seq = self.take_seq();
        let packet = Packet {
            sequence: seq,
            flags,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = self.encode_control_packet(&packet);
        self.last_sent_at = Some(now);
        self.record_send(&datagram);
        datagram
    }

    /// Builds a `RequestRetransmit` datagram listing `missing`, per the NAK
    /// policy (§4.5).
    pub fn build_request_retransmit(&mut self, missing: Vec<PacketSeq>, now: Instant) -> Option<Vec<u8>> {
        if missing.is_empty() {
            return None;
        }
        let mut optional = OptionalHeaders::default();
        optional.request_retransmit = Some(missing);
        let mut flags = flag::REQUEST_RETRANSMIT;
        if self.state == SessionState::Authenticated {
            flags |= flag::ENCRYPTED_CHECKSUM;
        }
        let seq = self.take_seq();
        let packet = Packet {
            sequence: seq,
            flags,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = self.encode_control_packet(&packet);
        self.last_sent_at = Some(now);
        self.record_send(&datagram);
        Some(datagram)
    }

    /// `true` iff `bytes` may be sent right now without exceeding the
    /// peer-supplied `Flow` budget (§4.6); always `true` if the peer has
    /// never sent a `Flow` header.
    #[must_use]
    pub fn flow_allows(&mut self, bytes: usize, now: Instant) -> bool {
        self.flow.as_mut().is_none_or(|budget| budget.allow(bytes, now))
    }

    fn verify_checksum(
        &mut self,
        packet: &Packet,
        claimed: u32,
        header_hash: u32,
        payload_hash: u32,
    ) -> bool {
        if packet.flags & flag::ENCRYPTED_CHECKSUM != 0 {
            let Some(keystream) = self.recv_keystream.as_mut() else { return false };
            if packet.flags & flag::RETRANSMISSION != 0 {
                // Retransmitted packets reuse their original checksum and
                // consume no new keystream word (§4.5).
                return true;
            }
            let word = keystream.next();
            let expected = header_hash.wrapping_add(payload_hash).wrapping_add(word);
            claimed == expected
        } else {
            claimed == header_hash.wrapping_add(payload_hash)
        }
    }

    fn apply_connect_request(&mut self, body: ConnectRequestBody, now: Instant, effects: &mut Effects) {
        if self.state != SessionState::LoginSent {
            return; // stale/duplicate ConnectRequest, ignore
        }
        self.handshake = HandshakeInfo {
            client_id: body.assigned_client_id,
            cookie: body.cookie,
            server_time_at_connect: body.server_time,
        };
        self.client_id_field = body.assigned_client_id as u16;
        self.recv_keystream = Some(Keystream::new(body.server_seed));
        self.send_keystream = Some(Keystream::new(body.client_seed));
        self.connect_received_at = Some(now);
        self.state = SessionState::ConnectReceived;
        effects.events.push(SessionEvent::TimeSyncApplied { server_time: body.server_time });
    }

    /// `true` once [`SessionConfig::handshake_activation_delay`] has
    /// elapsed since `ConnectRequest` was received, at which point
    /// [`Self::send_connect_response`] may be called.
    #[must_use]
    pub fn ready_for_connect_response(&self, now: Instant) -> bool {
        self.state == SessionState::ConnectReceived
            && self
                .connect_received_at
                .is_some_and(|at| now.duration_since(at) >= self.config.handshake_activation_delay)
    }

    /// Builds the `ConnectResponse` datagram, sent at sequence 1,
    /// unencrypted, and transitions to [`SessionState::Authenticated`].
    pub fn send_connect_response(&mut self) -> Option<Vec<u8>> {
        if self.state != SessionState::ConnectReceived {
            return None;
        }
        let mut optional = OptionalHeaders::default();
        optional.connect_response = Some(self.handshake.cookie);
        let packet = Packet {
            sequence: PacketSeq::new(1),
            flags: flag::CONNECT_RESPONSE,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = framing::encode_packet(&packet, None);
        self.next_send_seq = PacketSeq::new(2);
        self.state = SessionState::Authenticated;
        self.last_sent_at = Some(Instant::now());
        self.record_send(&datagram);
        Some(datagram)
    }

    fn apply_fragment(&mut self, fragment: &Fragment, now: Instant, effects: &mut Effects) {
        let remaining_budget = self.config.max_memory_usage.saturating_sub(self.buffered_bytes());
        match self.reassembly.receive(fragment, now, remaining_budget) {
            Ok(Some(message)) => {
                self.stats.msgs_recv += Saturating(1);
                self.dispatch_delivered(message.message_id, &message.payload);
                effects.messages.push(ReassembledDelivery {
                    opcode: message.message_id,
                    queue: message.queue,
                    payload: message.payload,
                });
            }
            Ok(None) => {}
            Err(_) => {
                self.state = SessionState::Dead;
                tracing::trace!("reassembly/retention memory cap exceeded, terminating session");
                effects.events.push(SessionEvent::Disconnected(DisconnectReason::Error(
                    CoreError::ReassemblyOverflow.to_string(),
                )));
            }
        }
    }

    /// Encodes and records an outbound application message as one or more
    /// fragments, assigning the next packet/fragment sequences. Returns the
    /// datagrams ready to send, in order.
    pub fn send_message(&mut self, message_id: u32, queue: u16, payload: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let frag_seq = FragSeq::new(self.next_send_seq.0.0);
        let fragments = crate::reassembly::fragment_message(
            frag_seq,
            message_id,
            queue,
            payload,
            self.config.max_fragment_data,
        );

        let mut datagrams = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let seq = self.take_seq();

            let mut flags = flag::BLOB_FRAGMENTS;
            if self.state == SessionState::Authenticated {
                flags |= flag::ENCRYPTED_CHECKSUM;
            }

            let packet = Packet {
                sequence: seq,
                flags,
                client_id: self.client_id_field,
                time: self.rolling_time(),
                optional: OptionalHeaders::default(),
                fragments: vec![fragment],
                login_payload: None,
            };

            let datagram = self.encode_control_packet(&packet);

            // Recover the payload hash and (if encrypted) the keystream
            // word that went into this datagram's checksum by re-decoding
            // what we just built, so a later retransmit can reuse them
            // without consuming a fresh keystream word (§4.5).
            let (_, checksum, hashes) =
                framing::decode_packet(&datagram).expect("we just built this datagram ourselves");
            let keystream_word = (flags & flag::ENCRYPTED_CHECKSUM != 0)
                .then(|| crate::integrity::recover_keystream_word(checksum, hashes.header_hash, hashes.payload_hash));

            self.send_log.record(seq, datagram.clone(), now, hashes.payload_hash, keystream_word);
            self.last_sent_at = Some(now);
            self.record_send(&datagram);
            datagrams.push(datagram);
        }
        self.stats.msgs_sent += Saturating(1);
        datagrams
    }

    /// Builds a standalone `ack`-only datagram reflecting the current
    /// receive high-watermark, for the driver's ACK-coalesce timer.
    pub fn build_ack(&mut self, now: Instant) -> Option<Vec<u8>> {
        let ack = self.ack_tracker.high_watermark()?;
        let mut optional = OptionalHeaders::default();
        optional.ack_sequence = Some(ack);
        let mut flags = flag::ACK_SEQUENCE;
        if self.state == SessionState::Authenticated {
            flags |= flag::ENCRYPTED_CHECKSUM;
        }
        let seq = self.take_seq();
        let packet = Packet {
            sequence: seq,
            flags,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = self.encode_control_packet(&packet);
        self.last_sent_at = Some(now);
        self.record_send(&datagram);
        Some(datagram)
    }

    /// Sequences the driver should ask the peer to resend, per
    /// [`SessionConfig::retransmit_threshold`].
    #[must_use]
    pub fn stale_gaps(&self, now: Instant) -> Vec<PacketSeq> {
        self.ack_tracker.stale_gaps(now, self.config.retransmit_threshold)
    }

    /// `true` once [`SessionConfig::inactivity_timeout`] has elapsed since
    /// the last datagram was received.
    #[must_use]
    pub fn is_inactive(&self, now: Instant) -> bool {
        self.last_received_at.is_some_and(|at| now.duration_since(at) >= self.config.inactivity_timeout)
    }

    /// `true` once [`SessionConfig::handshake_timeout`] has elapsed since
    /// `begin_login` without reaching [`SessionState::Authenticated`] (§7).
    #[must_use]
    pub fn is_handshake_timed_out(&self, now: Instant) -> bool {
        !matches!(self.state, SessionState::Authenticated | SessionState::Disconnecting | SessionState::Dead)
            && self
                .handshake_started_at
                .is_some_and(|at| now.duration_since(at) >= self.config.handshake_timeout)
    }

    /// `true` once [`SessionConfig::keep_alive_interval`] has elapsed since
    /// the last datagram was sent.
    #[must_use]
    pub fn needs_keep_alive(&self, now: Instant) -> bool {
        self.last_sent_at.is_none_or(|at| now.duration_since(at) >= self.config.keep_alive_interval)
    }

    /// Moves the session to [`SessionState::Disconnecting`] and builds the
    /// `Disconnect` datagram to send.
    pub fn begin_disconnect(&mut self) -> Vec<u8> {
        let mut flags = flag::DISCONNECT;
        if self.state == SessionState::Authenticated {
            flags |= flag::ENCRYPTED_CHECKSUM;
        }
        let seq = self.take_seq();
        let packet = Packet {
            sequence: seq,
            flags,
            client_id: self.client_id_field,
            time: self.rolling_time(),
            optional: OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = self.encode_control_packet(&packet);
        self.state = SessionState::Disconnecting;
        self.record_send(&datagram);
        datagram
    }

    /// Tears the session down fully, e.g. after the `Disconnect` datagram
    /// above has been flushed.
    pub fn finish_disconnect(&mut self) {
        self.state = SessionState::Dead;
        self.send_log.clear();
        self.reassembly.clear();
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(instant: Instant, by: Duration) -> Instant {
        instant + by
    }

    #[test]
    fn login_then_connect_then_response_reaches_authenticated() {
        let mut client = Session::new(SessionConfig::default());
        let _login_datagram = client.begin_login(false, b"user:pass".to_vec());
        assert_eq!(client.state(), SessionState::LoginSent);

        let mut connect_headers = OptionalHeaders::default();
        connect_headers.connect_request = Some(ConnectRequestBody {
            server_time: 1000.0,
            cookie: 0xCAFE,
            assigned_client_id: 42,
            server_seed: 111,
            client_seed: 222,
        });
        let connect_packet = Packet {
            sequence: PacketSeq::new(0),
            flags: flag::CONNECT_REQUEST,
            client_id: 0,
            time: 0,
            optional: connect_headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = framing::encode_packet(&connect_packet, None);

        let now = Instant::now();
        let effects = client.on_datagram(&datagram, now);
        assert_eq!(client.state(), SessionState::ConnectReceived);
        assert!(effects.events.iter().any(|e| matches!(e, SessionEvent::TimeSyncApplied { .. })));

        assert!(!client.ready_for_connect_response(now));
        let later = advance(now, Duration::from_millis(201));
        assert!(client.ready_for_connect_response(later));

        let response = client.send_connect_response().unwrap();
        assert_eq!(client.state(), SessionState::Authenticated);
        let (decoded, ..) = framing::decode_packet(&response).unwrap();
        assert_eq!(decoded.optional.connect_response, Some(0xCAFE));
    }

    #[test]
    fn send_message_encrypts_once_authenticated() {
        let mut client = Session::new(SessionConfig::default());
        client.state = SessionState::Authenticated;
        client.send_keystream = Some(Keystream::new(7));
        client.recv_keystream = Some(Keystream::new(7));
        let now = Instant::now();
        let datagrams = client.send_message(1, 0, b"hello", now);
        assert_eq!(datagrams.len(), 1);
        let (decoded, ..) = framing::decode_packet(&datagrams[0]).unwrap();
        assert_eq!(decoded.flags & flag::ENCRYPTED_CHECKSUM, flag::ENCRYPTED_CHECKSUM);
    }

    #[test]
    fn disconnect_flag_kills_session() {
        let mut client = Session::new(SessionConfig::default());
        client.state = SessionState::Authenticated;
        let mut headers = OptionalHeaders::default();
        headers.disconnect = true;
        let packet = Packet {
            sequence: PacketSeq::new(5),
            flags: flag::DISCONNECT,
            client_id: 0,
            time: 0,
            optional: headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = framing::encode_packet(&packet, None);
        let effects = client.on_datagram(&datagram, Instant::now());
        assert_eq!(client.state(), SessionState::Dead);
        assert!(matches!(effects.events[0], SessionEvent::Disconnected(DisconnectReason::PeerDisconnected)));
    }

    #[test]
    fn inactivity_timeout_is_detected() {
        let mut client = Session::new(SessionConfig::default());
        client.last_received_at = Some(Instant::now());
        assert!(!client.is_inactive(Instant::now()));
        let later = Instant::now() + Duration::from_secs(61);
        assert!(client.is_inactive(later));
    }

    #[test]
    fn handshake_timeout_fires_while_stuck_in_login_sent() {
        let mut client = Session::new(SessionConfig::default());
        let start = Instant::now();
        let _login_datagram = client.begin_login(false, b"user:pass".to_vec());
        assert!(!client.is_handshake_timed_out(start));
        let later = start + Duration::from_secs(11);
        assert!(client.is_handshake_timed_out(later));
    }

    #[test]
    fn handshake_timeout_does_not_apply_once_authenticated() {
        let mut client = Session::new(SessionConfig::default());
        let start = Instant::now();
        let _login_datagram = client.begin_login(false, b"user:pass".to_vec());
        client.state = SessionState::Authenticated;
        let later = start + Duration::from_secs(11);
        assert!(!client.is_handshake_timed_out(later));
    }

    #[test]
    fn echo_round_trip_is_measured() {
        let mut client = Session::new(SessionConfig::default());
        let sent_at = Instant::now();
        let _request = client.send_echo_request(sent_at);
        let (client_time, _) = client.pending_echo.unwrap();

        let mut server = Session::new(SessionConfig::default());
        let mut headers = OptionalHeaders::default();
        headers.echo_request = Some(client_time);
        let packet = Packet {
            sequence: PacketSeq::new(0),
            flags: flag::ECHO_REQUEST,
            client_id: 0,
            time: 0,
            optional: headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let request_datagram = framing::encode_packet(&packet, None);
        let response_effects = server.on_datagram(&request_datagram, Instant::now());
        let response_datagram = response_effects.outbound.first().expect("echo response queued");

        let rtt_at = advance(sent_at, Duration::from_millis(40));
        let effects = client.on_datagram(response_datagram, rtt_at);
        assert!(client.pending_echo.is_none());
        assert!(effects
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::EchoRoundTripMeasured { rtt } if *rtt == Duration::from_millis(40))));
    }

    #[test]
    fn flow_budget_denies_once_exhausted_then_refills() {
        let mut client = Session::new(SessionConfig::default());
        let now = Instant::now();
        let mut headers = OptionalHeaders::default();
        headers.flow = Some(crate::framing::FlowBody { bytes: 100, interval_ms: 50 });
        let packet = Packet {
            sequence: PacketSeq::new(0),
            flags: 0,
            client_id: 0,
            time: 0,
            optional: headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let datagram = framing::encode_packet(&packet, None);
        client.on_datagram(&datagram, now);

        assert!(client.flow_allows(60, now));
        assert!(!client.flow_allows(60, now));

        let next_window = advance(now, Duration::from_millis(51));
        assert!(client.flow_allows(60, next_window));
    }

    #[test]
    fn flow_allows_is_unconditional_without_a_flow_header() {
        let mut client = Session::new(SessionConfig::default());
        let now = Instant::now();
        assert!(client.flow_allows(usize::from(u16::MAX), now));
    }

    #[test]
    fn build_request_retransmit_is_none_for_empty_gaps() {
        let mut client = Session::new(SessionConfig::default());
        assert!(client.build_request_retransmit(Vec::new(), Instant::now()).is_none());
    }

    #[test]
    fn build_request_retransmit_lists_missing_sequences() {
        let mut client = Session::new(SessionConfig::default());
        let missing = vec![PacketSeq::new(3), PacketSeq::new(4)];
        let datagram = client.build_request_retransmit(missing.clone(), Instant::now()).unwrap();
        let (decoded, ..) = framing::decode_packet(&datagram).unwrap();
        assert_eq!(decoded.flags & flag::REQUEST_RETRANSMIT, flag::REQUEST_RETRANSMIT);
        assert_eq!(decoded.optional.request_retransmit, Some(missing));
    }

    #[test]
    fn stats_count_sent_and_received_messages() {
        let mut client = Session::new(SessionConfig::default());
        let mut server = Session::new(SessionConfig::default());
        let now = Instant::now();

        let login = client.begin_login(false, b"user:pass".to_vec());
        assert_eq!(client.stats().packets_sent, std::num::Saturating(1));

        let effects = server.on_datagram(&login, now);
        assert_eq!(server.stats().packets_recv, std::num::Saturating(1));
        assert_eq!(server.stats().msgs_recv, std::num::Saturating(1));
        assert_eq!(effects.messages.first().unwrap().payload, b"user:pass");

        let datagrams = client.send_message(7, 0, b"hello world", now);
        assert_eq!(client.stats().msgs_sent, std::num::Saturating(1));
        assert_eq!(client.stats().packets_sent, std::num::Saturating(1 + datagrams.len()));
    }

    #[test]
    fn bad_datagrams_recv_counts_short_datagrams() {
        let mut server = Session::new(SessionConfig::default());
        let effects = server.on_datagram(&[0u8; 4], Instant::now());
        assert_eq!(server.stats().bad_datagrams_recv, std::num::Saturating(1));
        assert_eq!(server.stats().packets_recv, std::num::Saturating(0));
        assert!(effects.messages.is_empty());
    }

    #[test]
    fn bad_datagrams_recv_counts_checksum_mismatches() {
        let mut server = Session::new(SessionConfig::default());
        let packet = Packet {
            sequence: PacketSeq::new(0),
            flags: 0,
            client_id: 0,
            time: 0,
            optional: OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: None,
        };
        let mut datagram = framing::encode_packet(&packet, None);
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;

        server.on_datagram(&datagram, Instant::now());
        assert_eq!(server.stats().bad_datagrams_recv, std::num::Saturating(1));
        assert_eq!(server.stats().packets_recv, std::num::Saturating(0));
    }

    #[test]
    fn login_payload_reaches_registered_dispatch_subscriber() {
        use std::sync::{Arc, Mutex};

        let mut server = Session::new(SessionConfig::default());
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        server.dispatcher_mut().set_default_handler(Box::new(move |msg| {
            if let crate::dispatch::DecodedMessage::Unknown { opcode, bytes } = msg {
                *received_clone.lock().unwrap() = Some((*opcode, bytes.clone()));
            }
        }));

        let mut client = Session::new(SessionConfig::default());
        let login = client.begin_login(false, b"user:pass".to_vec());
        let effects = server.on_datagram(&login, Instant::now());

        assert_eq!(effects.messages.first().unwrap().opcode, crate::dispatch::LOGIN_OPCODE);
        let (opcode, bytes) = received.lock().unwrap().clone().unwrap();
        assert_eq!(opcode, crate::dispatch::LOGIN_OPCODE);
        assert_eq!(bytes, b"user:pass");
    }

    #[test]
    fn consecutive_encrypted_checksum_failures_terminate_session_past_tolerance() {
        let mut config = SessionConfig::default();
        config.desync_tolerance = 2;
        let mut server = Session::new(config);
        server.state = SessionState::Authenticated;
        server.recv_keystream = Some(Keystream::new(7));

        let packet = Packet {
            sequence: PacketSeq::new(0),
            flags: flag::ENCRYPTED_CHECKSUM,
            client_id: 0,
            time: 0,
            optional: OptionalHeaders::default(),
            fragments: Vec::new(),
            login_payload: None,
        };
        // Encoded without consuming the recv keystream, so every delivery's
        // claimed checksum fails to match what `verify_checksum` expects.
        let datagram = framing::encode_packet(&packet, None);

        for _ in 0..2 {
            let effects = server.on_datagram(&datagram, Instant::now());
            assert_eq!(server.state(), SessionState::Authenticated);
            assert!(effects.events.is_empty());
        }
        let effects = server.on_datagram(&datagram, Instant::now());
        assert_eq!(server.state(), SessionState::Dead);
        assert!(effects
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected(DisconnectReason::Error(_)))));
    }
}
