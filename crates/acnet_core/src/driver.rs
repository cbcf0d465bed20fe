//! The async runtime that actually drives a [`Session`] against a real
//! socket (§4.9, ambient): owns the `tokio::net::UdpSocket`, the three
//! timers, and the bounded channels the upper layer's `Send`/`OnMessage`
//! operations are built on.
//!
//! Everything in [`crate::session`] is a pure, synchronous transformation
//! over bytes and `Instant`s; this module is the only place that touches
//! a socket or the clock directly, mirroring how the corpus keeps its
//! `Transport`/send/recv split separate from the event loop that owns the
//! actual connection.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex},
    time::{interval, Instant as TokioInstant, Interval},
};
use tracing::{trace, warn};

use crate::{
    config::SessionConfig,
    dispatch::Dispatcher,
    error::CoreError,
    events::{DisconnectReason, SessionEvent},
    session::{ReassembledDelivery, Session, SessionState},
};

/// One message handed to [`SessionDriver::send`]: an opcode-tagged payload
/// bound for a specific delivery queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Opcode to tag the message with.
    pub opcode: u32,
    /// Destination queue.
    pub queue: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Bound on the outbound/inbound channels backing a [`SessionDriver`];
/// beyond this, `Send`'s bounded-channel suspension point (§5) actually
/// blocks the caller.
const CHANNEL_CAPACITY: usize = 256;

/// Owns the socket and timers that drive one [`Session`]'s handshake and
/// steady-state traffic.
pub struct SessionDriver {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    /// `peer`'s port plus one (§6.1): the only address a `ConnectResponse`
    /// is ever sent to. Every other datagram, before and after the
    /// handshake, goes to `peer` itself.
    activation_peer: SocketAddr,
    session: Arc<Mutex<Session>>,
    config: SessionConfig,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    inbound_tx: mpsc::Sender<ReassembledDelivery>,
    events_tx: mpsc::Sender<SessionEvent>,
    ack_timer: Interval,
    retransmit_timer: Interval,
    keep_alive_timer: Interval,
    reassembly_expire_timer: Interval,
    /// Messages held back because [`Session::flow_allows`] denied them,
    /// retried in order as the peer's advertised flow window refills.
    pending_outbound: VecDeque<OutboundMessage>,
}

/// The two receivers an upper layer holds onto for the lifetime of a
/// [`SessionDriver`]: delivered messages and session lifecycle events.
pub struct DriverHandles {
    /// Sender side of the outbound-message channel (`Send`, §4.8).
    pub outbound_tx: mpsc::Sender<OutboundMessage>,
    /// Receiver side of the inbound-message channel (`OnMessage`, §4.8).
    pub inbound_rx: mpsc::Receiver<ReassembledDelivery>,
    /// Receiver side of the session-event channel (`SessionEvents`, §4.8).
    pub events_rx: mpsc::Receiver<SessionEvent>,
}

impl SessionDriver {
    /// Binds a UDP socket and builds a driver for a session with `peer`,
    /// returning it alongside the channel handles the upper layer uses to
    /// drive and observe it.
    pub async fn bind(
        local_addr: SocketAddr,
        peer: SocketAddr,
        config: SessionConfig,
    ) -> Result<(Self, DriverHandles), CoreError> {
        let socket = UdpSocket::bind(local_addr).await.map_err(CoreError::Io)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut activation_peer = peer;
        activation_peer.set_port(peer.port().wrapping_add(1));

        let driver = Self {
            socket: Arc::new(socket),
            peer,
            activation_peer,
            session: Arc::new(Mutex::new(Session::new(config.clone()))),
            ack_timer: interval(config.ack_coalesce_window),
            retransmit_timer: interval(config.retransmit_threshold),
            keep_alive_timer: interval(config.keep_alive_interval),
            reassembly_expire_timer: interval(config.reassembly_ttl),
            config,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            inbound_tx,
            events_tx,
            pending_outbound: VecDeque::new(),
        };
        Ok((driver, DriverHandles { outbound_tx, inbound_rx, events_rx }))
    }

    /// Gives `configure` mutable access to this driver's [`Dispatcher`] so
    /// callers can register opcode decoders/subscribers before [`Self::run`]
    /// starts feeding it live traffic.
    pub async fn configure_dispatcher(&self, configure: impl FnOnce(&mut Dispatcher)) {
        let mut session = self.session.lock().await;
        configure(session.dispatcher_mut());
    }

    /// Sends `credentials` as a `LoginRequest` and begins the handshake.
    pub async fn connect(&mut self, world_login: bool, credentials: Vec<u8>) -> Result<(), CoreError> {
        let datagram = self.session.lock().await.begin_login(world_login, credentials);
        self.send_to_peer(&datagram).await
    }

    async fn send_to_peer(&self, bytes: &[u8]) -> Result<(), CoreError> {
        self.send_to(bytes, self.peer).await
    }

    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), CoreError> {
        trace!(bytes = bytes.len(), peer = %addr, "flushing packet");
        self.socket.send_to(bytes, addr).await.map_err(CoreError::Io)?;
        Ok(())
    }

    /// Runs the `tokio::select!` event loop described in §4.9/§5 until the
    /// session reaches [`SessionState::Dead`] or the socket errors.
    pub async fn run(mut self) -> Result<(), CoreError> {
        let mut recv_buf = vec![0u8; self.config.max_udp_payload.max(2048)];

        loop {
            if self.session.lock().await.state() == SessionState::Dead {
                return Ok(());
            }

            tokio::select! {
                recv_result = self.socket.recv_from(&mut recv_buf) => {
                    let (len, from) = recv_result.map_err(CoreError::Io)?;
                    if from != self.peer {
                        continue;
                    }
                    self.handle_datagram(&recv_buf[..len]).await?;
                }

                _ = self.ack_timer.tick() => {
                    self.flush_ack().await?;
                }

                _ = self.retransmit_timer.tick() => {
                    self.request_stale_retransmits().await?;
                }

                _ = self.keep_alive_timer.tick() => {
                    self.maybe_send_keep_alive().await?;
                }

                _ = self.reassembly_expire_timer.tick() => {
                    let now = TokioInstant::now().into_std();
                    self.session.lock().await.expire_reassembly(now);
                }

                Some(message) = self.outbound_rx.recv() => {
                    self.pending_outbound.push_back(message);
                }
            }

            self.drain_pending_outbound().await?;
            self.maybe_send_connect_response().await?;
            self.check_inactivity().await;
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let now = TokioInstant::now().into_std();
        let mut session = self.session.lock().await;
        let span = tracing::trace_span!("recv_packet", len = bytes.len());
        let _enter = span.enter();

        let effects = session.on_datagram(bytes, now);
        drop(session);

        for datagram in &effects.outbound {
            self.send_to_peer(datagram).await?;
        }
        for message in effects.messages {
            if self.inbound_tx.send(message).await.is_err() {
                warn!("inbound message channel closed, dropping delivered message");
            }
        }
        for event in effects.events {
            if let SessionEvent::Disconnected(DisconnectReason::Error(reason)) = &event {
                warn!(reason = %reason, "session terminated by protocol error");
            }
            if self.events_tx.send(event).await.is_err() {
                warn!("session-event channel closed, dropping event");
            }
        }
        Ok(())
    }

    /// Sends `ConnectResponse` to the activation endpoint (peer port + 1,
    /// §6.1), never to `self.peer` directly. All subsequent traffic, once
    /// authenticated, resumes to `self.peer` as normal.
    async fn maybe_send_connect_response(&mut self) -> Result<(), CoreError> {
        let now = TokioInstant::now().into_std();
        let mut session = self.session.lock().await;
        if !session.ready_for_connect_response(now) {
            return Ok(());
        }
        let Some(datagram) = session.send_connect_response() else { return Ok(()) };
        drop(session);
        self.send_to(&datagram, self.activation_peer).await?;
        let _ = self.events_tx.send(SessionEvent::Connected).await;
        Ok(())
    }

    async fn flush_ack(&mut self) -> Result<(), CoreError> {
        let now = TokioInstant::now().into_std();
        let datagram = self.session.lock().await.build_ack(now);
        if let Some(datagram) = datagram {
            self.send_to_peer(&datagram).await?;
        }
        Ok(())
    }

    async fn request_stale_retransmits(&mut self) -> Result<(), CoreError> {
        let now = TokioInstant::now().into_std();
        let mut session = self.session.lock().await;
        let gaps = session.stale_gaps(now);
        if gaps.is_empty() {
            return Ok(());
        }
        let count = gaps.len();
        let datagram = session.build_request_retransmit(gaps, now);
        drop(session);
        if let Some(datagram) = datagram {
            trace!(count, "requesting retransmit for stale gaps");
            self.send_to_peer(&datagram).await?;
        }
        Ok(())
    }

    async fn maybe_send_keep_alive(&mut self) -> Result<(), CoreError> {
        let now = TokioInstant::now().into_std();
        let mut session = self.session.lock().await;
        if session.state() != SessionState::Authenticated || !session.needs_keep_alive(now) {
            return Ok(());
        }
        let datagram = session.build_ack(now);
        drop(session);
        if let Some(datagram) = datagram {
            self.send_to_peer(&datagram).await?;
        }
        Ok(())
    }

    /// Sends as many queued [`OutboundMessage`]s as the peer's advertised
    /// flow window allows, stopping at the first one that doesn't fit
    /// rather than reordering around it.
    async fn drain_pending_outbound(&mut self) -> Result<(), CoreError> {
        loop {
            let Some(message) = self.pending_outbound.front() else { return Ok(()) };
            let now = TokioInstant::now().into_std();
            let mut session = self.session.lock().await;
            if !session.flow_allows(message.payload.len(), now) {
                return Ok(());
            }
            let datagrams = session.send_message(message.opcode, message.queue, &message.payload, now);
            drop(session);
            self.pending_outbound.pop_front();
            for datagram in datagrams {
                self.send_to_peer(&datagram).await?;
            }
        }
    }

    /// Sends a `Disconnect`-flagged packet, tears down the session's
    /// buffers, and emits `Disconnected(UserRequested)` (§4.8, `Disconnect`).
    /// After this returns, [`Self::run`]'s next iteration observes
    /// [`SessionState::Dead`] and exits.
    pub async fn disconnect(&mut self) -> Result<(), CoreError> {
        let mut session = self.session.lock().await;
        let datagram = session.begin_disconnect();
        session.finish_disconnect();
        drop(session);
        self.send_to_peer(&datagram).await?;
        let _ = self
            .events_tx
            .send(SessionEvent::Disconnected(DisconnectReason::UserRequested))
            .await;
        Ok(())
    }

    async fn check_inactivity(&mut self) {
        let now = TokioInstant::now().into_std();
        let mut session = self.session.lock().await;
        if session.state() == SessionState::Dead {
            return;
        }
        let reason = if session.is_handshake_timed_out(now) {
            Some(DisconnectReason::HandshakeTimeout)
        } else if session.is_inactive(now) {
            Some(DisconnectReason::InactivityTimeout)
        } else {
            None
        };
        let Some(reason) = reason else { return };
        if matches!(reason, DisconnectReason::HandshakeTimeout) {
            trace!(error = %CoreError::Timeout("handshake"), "handshake did not complete in time");
        }
        session.finish_disconnect();
        drop(session);
        let _ = self.events_tx.send(SessionEvent::Disconnected(reason)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::framing::{self, flag, ConnectRequestBody, OptionalHeaders, Packet};

    /// Stands in for the server side of the handshake: a bare socket that
    /// answers whatever the driver sends it, without running a full
    /// `Session` of its own.
    async fn bind_peer() -> UdpSocket {
        UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.expect("bind peer socket")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_handshake_then_user_disconnect() {
        let peer_socket = bind_peer().await;
        let peer_addr = peer_socket.local_addr().unwrap();
        let mut activation_addr = peer_addr;
        activation_addr.set_port(peer_addr.port() + 1);
        let activation_socket =
            UdpSocket::bind(activation_addr).await.expect("bind activation-endpoint socket");

        let config = SessionConfig { handshake_activation_delay: Duration::from_millis(10), ..SessionConfig::default() };
        let (mut driver, mut handles) =
            SessionDriver::bind((std::net::Ipv4Addr::LOCALHOST, 0).into(), peer_addr, config)
                .await
                .expect("bind driver");

        driver.connect(false, b"player:hunter2".to_vec()).await.expect("send login");

        // the peer observes the LoginRequest datagram.
        let mut buf = vec![0u8; 2048];
        let (len, client_addr) = peer_socket.recv_from(&mut buf).await.expect("recv login");
        let (login_packet, ..) = framing::decode_packet(&buf[..len]).expect("decode login");
        assert_eq!(login_packet.flags & flag::LOGIN_REQUEST, flag::LOGIN_REQUEST);

        // the peer replies with ConnectRequest.
        let mut connect_headers = OptionalHeaders::default();
        connect_headers.connect_request = Some(ConnectRequestBody {
            server_time: 42.0,
            cookie: 0xF00D,
            assigned_client_id: 9,
            server_seed: 11,
            client_seed: 22,
        });
        let connect_packet = Packet {
            sequence: crate::seq::PacketSeq::new(0),
            flags: flag::CONNECT_REQUEST,
            client_id: 0,
            time: 0,
            optional: connect_headers,
            fragments: Vec::new(),
            login_payload: None,
        };
        let connect_datagram = framing::encode_packet(&connect_packet, None);
        peer_socket.send_to(&connect_datagram, client_addr).await.expect("send connect request");

        let run_task = tokio::spawn(driver.run());

        // `ConnectRequest` also yields a `TimeSyncApplied` event ahead of
        // `Connected`; wait out the handshake for whichever order they land
        // in rather than asserting on the very first event received.
        let saw_connected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match handles.events_rx.recv().await.expect("events channel open") {
                    SessionEvent::Connected => return,
                    _ => continue,
                }
            }
        })
        .await;
        saw_connected.expect("did not time out waiting for Connected");

        // the ConnectResponse arrives at the activation endpoint (peer
        // port + 1), never at the peer's main socket.
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), activation_socket.recv_from(&mut buf))
            .await
            .expect("did not time out waiting for ConnectResponse")
            .expect("recv connect response");
        let (response_packet, ..) = framing::decode_packet(&buf[..len]).expect("decode connect response");
        assert_eq!(response_packet.optional.connect_response, Some(0xF00D));

        handles.outbound_tx.send(OutboundMessage { opcode: 7, queue: 0, payload: b"hi".to_vec() }).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer_socket.recv_from(&mut buf))
            .await
            .expect("did not time out waiting for application message")
            .expect("recv application message");
        let (app_packet, ..) = framing::decode_packet(&buf[..len]).expect("decode application message");
        assert_eq!(app_packet.fragments[0].data, b"hi");
        assert_eq!(app_packet.flags & flag::ENCRYPTED_CHECKSUM, flag::ENCRYPTED_CHECKSUM);

        run_task.abort();
    }

    #[tokio::test]
    async fn disconnect_sends_flagged_packet_and_emits_event() {
        let peer_socket = bind_peer().await;
        let peer_addr = peer_socket.local_addr().unwrap();

        let (mut driver, mut handles) =
            SessionDriver::bind((std::net::Ipv4Addr::LOCALHOST, 0).into(), peer_addr, SessionConfig::default())
                .await
                .expect("bind driver");

        driver.disconnect().await.expect("disconnect");

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer_socket.recv_from(&mut buf))
            .await
            .expect("did not time out waiting for Disconnect packet")
            .expect("recv disconnect packet");
        let (packet, ..) = framing::decode_packet(&buf[..len]).expect("decode disconnect packet");
        assert_eq!(packet.flags & flag::DISCONNECT, flag::DISCONNECT);

        let event = handles.events_rx.recv().await.expect("events channel open");
        assert!(matches!(event, SessionEvent::Disconnected(DisconnectReason::UserRequested)));
    }
}
