//! Huddle host - the authoritative endpoint for a single session.
//!
//! The host registers its session with the relay, admits clients, hands
//! out client ids and reconnect tokens, delivers the session configuration
//! reliably, and answers keepalive pings. Application code observes all of
//! it through [`HostEvents`]; callbacks run on the host loop task and must
//! not block.

#![forbid(unsafe_code)]

pub mod clients;
pub mod reliable;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use huddle_common::{config::Config, config::HostConfig, Error, ErrorReason, Metrics, Result};
use nexus_core::{
    Header, Packet, Payload, RegistryEntry, SequenceCounter, BROADCAST_ID, GAME_PACKET_BASE,
    HOST_ID, PROTOCOL_VERSION, RECONNECT_TOKEN_LEN, UNASSIGNED_ID,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use clients::{ClientInfo, ClientRegistry};
use reliable::ReliableQueue;

/// How often an idle host refreshes its registration so the relay does not
/// expire the session before the first client arrives.
const REGISTRATION_REFRESH: Duration = Duration::from_secs(10);

/// Consecutive send failures before the transport is declared dead.
const MAX_TRANSPORT_ERRORS: u32 = 8;

/// Application callbacks. All of them are invoked synchronously on the
/// host loop task and must return quickly.
pub trait HostEvents: Send {
    /// Final say on admission after the protocol checks pass. Returning
    /// an error denies the applicant with that reason.
    fn admit(&mut self, _name: &str, _game_id: u32) -> std::result::Result<(), String> {
        Ok(())
    }

    fn client_connected(&mut self, _client_id: u8, _name: &str) {}

    fn client_denied(&mut self, _name: &str, _reason: &str) {}

    fn client_disconnected(&mut self, _client_id: u8) {}

    fn ping_received(&mut self, _client_id: u8) {}

    /// A reliable delivery ran out of retries.
    fn delivery_failed(&mut self, _client_id: u8, _sequence: u16) {}

    /// An opaque game packet addressed to the host (or broadcast).
    fn game_packet(&mut self, _header: &Header, _data: &Bytes) {}

    fn error(&mut self, _message: &str) {}
}

/// No-op event sink.
pub struct NullEvents;

impl HostEvents for NullEvents {}

/// Per-session host parameters.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub relay_addr: SocketAddr,
    pub session_id: u32,
    /// When set, CONNECT_REQUESTs carrying a different game id are denied.
    pub required_game_id: Option<u32>,
    pub max_clients: usize,
    /// SESSION_CONFIG payload values.
    pub config_version: u8,
    pub tick_rate: u16,
    pub max_packet_size: u16,
    /// Advertised application packet types, sent after each accept.
    pub registry: Vec<RegistryEntry>,
}

impl HostOptions {
    pub fn new(relay_addr: SocketAddr, session_id: u32) -> Self {
        Self {
            relay_addr,
            session_id,
            required_game_id: None,
            max_clients: 8,
            config_version: PROTOCOL_VERSION,
            tick_rate: 60,
            max_packet_size: 1024,
            registry: Vec::new(),
        }
    }
}

/// Host lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Registering,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Commands a [`HostHandle`] can issue.
#[derive(Debug)]
enum HostCommand {
    Stop,
    Send {
        destination: u8,
        packet_type: u8,
        data: Bytes,
        reliable: bool,
    },
}

/// Clonable control surface for a running host.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostCommand>,
}

impl HostHandle {
    /// Begin graceful shutdown: drain reliable sends, notify the session.
    pub fn stop(&self) {
        let _ = self.tx.send(HostCommand::Stop);
    }

    /// Fire-and-forget game packet. `destination` 0 broadcasts via the
    /// relay.
    pub fn send_game(&self, destination: u8, packet_type: u8, data: Bytes) {
        let _ = self.tx.send(HostCommand::Send {
            destination,
            packet_type,
            data,
            reliable: false,
        });
    }

    /// Game packet with resend-until-ACK semantics. Needs a specific
    /// destination; broadcast cannot be tracked.
    pub fn send_game_reliable(&self, destination: u8, packet_type: u8, data: Bytes) {
        let _ = self.tx.send(HostCommand::Send {
            destination,
            packet_type,
            data,
            reliable: true,
        });
    }
}

/// Protocol admission checks, in their authoritative order: session match,
/// protocol version, game id, capacity, application hook.
fn check_admission(
    options: &HostOptions,
    active_clients: usize,
    events: &mut dyn HostEvents,
    client_version: u8,
    name: &str,
    target_session_id: u32,
    game_id: u32,
) -> std::result::Result<(), String> {
    if target_session_id != options.session_id {
        return Err("wrong session".to_string());
    }
    if client_version != PROTOCOL_VERSION {
        return Err("unsupported protocol version".to_string());
    }
    if let Some(required) = options.required_game_id {
        if game_id != required {
            return Err("game mismatch".to_string());
        }
    }
    if active_clients >= options.max_clients {
        return Err("full".to_string());
    }
    events.admit(name, game_id)
}

/// The host session machine.
pub struct Host {
    socket: UdpSocket,
    options: HostOptions,
    timing: HostConfig,
    state: HostState,
    clients: ClientRegistry,
    reliable: ReliableQueue,
    sequence: SequenceCounter,
    events: Box<dyn HostEvents>,
    metrics: Arc<Metrics>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    buf: Vec<u8>,
    last_register: Option<Instant>,
    stop_deadline: Option<Instant>,
    send_errors: u32,
}

impl Host {
    /// Bind an ephemeral socket and prepare the host. `run` does the rest.
    pub async fn bind(
        config: &Config,
        options: HostOptions,
        events: Box<dyn HostEvents>,
    ) -> Result<(Self, HostHandle)> {
        config.validate()?;
        if options.session_id == 0 {
            return Err(Error::config("session_id must be non-zero"));
        }
        if options.max_clients == 0 || options.max_clients > 253 {
            return Err(Error::config("max_clients must be between 1 and 253"));
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let host = Self {
            socket,
            options,
            timing: config.host.clone(),
            state: HostState::Idle,
            clients: ClientRegistry::new(),
            reliable: ReliableQueue::new(),
            sequence: SequenceCounter::new(),
            events,
            metrics: Arc::new(Metrics::new()),
            commands: rx,
            buf: vec![0u8; config.buffer_size],
            last_register: None,
            stop_deadline: None,
            send_errors: 0,
        };
        Ok((host, HostHandle { tx }))
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register with the relay and serve the session until stopped.
    pub async fn run(mut self) -> Result<()> {
        self.state = HostState::Registering;
        self.send_registration().await;
        self.state = HostState::Running;
        info!(
            session_id = self.options.session_id,
            relay = %self.options.relay_addr,
            "host running"
        );

        let mut tick = tokio::time::interval(self.timing.loop_sleep());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut self.buf) => {
                    match result {
                        Ok((len, src)) => {
                            self.metrics.packet_received(len);
                            self.handle_datagram(len, src).await;
                        }
                        Err(e) => {
                            warn!("socket receive error: {e}");
                            self.metrics.packet_dropped(ErrorReason::Transport);
                        }
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
            }

            match self.state {
                HostState::Stopped => break,
                HostState::Failed => {
                    return Err(Error::internal("host transport failed"));
                }
                _ => {}
            }
        }

        info!(session_id = self.options.session_id, "host stopped");
        Ok(())
    }

    async fn handle_datagram(&mut self, len: usize, src: SocketAddr) {
        if src != self.options.relay_addr {
            debug!("datagram from unexpected source {src}");
            self.metrics.packet_dropped(ErrorReason::RoutingUnknown);
            return;
        }
        if len == self.buf.len() {
            warn!("datagram filled the receive buffer, possibly truncated");
            self.metrics.packet_dropped(ErrorReason::Malformed);
            return;
        }

        let packet = match Packet::decode(&self.buf[..len]) {
            Ok(packet) => packet,
            Err(nexus_core::WireError::InvalidMagic(got, _)) => {
                warn!("bad magic 0x{got:04x}");
                self.metrics.packet_dropped(ErrorReason::BadMagic);
                return;
            }
            Err(e) => {
                warn!("malformed packet: {e}");
                self.metrics.packet_dropped(ErrorReason::Malformed);
                return;
            }
        };

        let now = Instant::now();
        let header = packet.header;
        match packet.payload {
            Payload::ConnectRequest {
                client_version,
                player_name,
                target_session_id,
                game_id,
            } => {
                self.handle_connect_request(
                    client_version,
                    player_name,
                    target_session_id,
                    game_id,
                    now,
                )
                .await;
            }
            Payload::ReconnectRequest {
                previous_client_id,
                token,
            } => {
                self.handle_reconnect(previous_client_id, token, now).await;
            }
            Payload::Ping { timestamp } => {
                if self.clients.touch_ping(header.sender_id, now) {
                    self.events.ping_received(header.sender_id);
                    let pong = Payload::Pong {
                        original_timestamp: timestamp,
                    };
                    self.send_payload(pong, header.sender_id).await;
                } else {
                    debug!(client_id = header.sender_id, "ping from unknown client");
                    self.metrics.packet_dropped(ErrorReason::RoutingUnknown);
                }
            }
            Payload::Ack { sequences } => {
                for sequence in sequences {
                    if self.reliable.acknowledge(header.sender_id, sequence) {
                        debug!(client_id = header.sender_id, sequence, "reliable delivery acked");
                    }
                }
            }
            Payload::DisconnectNotice => {
                if self.clients.mark_disconnected(header.sender_id, now) {
                    self.reliable.drop_destination(header.sender_id);
                    self.metrics.connection_disconnected();
                    info!(client_id = header.sender_id, "client disconnected");
                    self.events.client_disconnected(header.sender_id);
                }
            }
            Payload::Game { data, .. } => {
                self.events.game_packet(&header, &data);
            }
            other => {
                debug!("ignoring host-bound {:?}", other.type_code());
            }
        }
    }

    async fn handle_connect_request(
        &mut self,
        client_version: u8,
        name: String,
        target_session_id: u32,
        game_id: u32,
        now: Instant,
    ) {
        // A client retrying its CONNECT_REQUEST while the handshake is
        // still in flight keeps its original id.
        if let Some(existing) = self.clients.find_active_by_name(&name) {
            if self.reliable.pending_for(existing) > 0 {
                debug!(client_id = existing, "connect retry, re-sending accept");
                self.send_accept(existing).await;
                return;
            }
        }

        let verdict = check_admission(
            &self.options,
            self.clients.active_count(),
            self.events.as_mut(),
            client_version,
            &name,
            target_session_id,
            game_id,
        );

        let reason = match verdict {
            Ok(()) => match self.clients.allocate_id() {
                Some(id) => {
                    let token: [u8; RECONNECT_TOKEN_LEN] = rand::random();
                    self.clients.insert(
                        id,
                        ClientInfo {
                            name: name.clone(),
                            reconnect_token: token,
                            connected_at: now,
                            last_ping: now,
                            disconnected: false,
                        },
                    );
                    debug!(
                        client_id = id,
                        token_prefix = %hex::encode(&token[..4]),
                        "issued reconnect token"
                    );
                    info!(client_id = id, name = %name, "client connected");
                    self.metrics.connection_accepted();
                    self.events.client_connected(id, &name);
                    self.send_accept(id).await;
                    self.send_token_grant(id).await;
                    self.schedule_session_config(id, now);
                    return;
                }
                None => "full".to_string(),
            },
            Err(reason) => reason,
        };

        info!(name = %name, reason = %reason, "connection denied");
        self.metrics.connection_denied();
        self.events.client_denied(&name, &reason);
        self.send_payload(Payload::ConnectDeny { reason }, UNASSIGNED_ID)
            .await;
    }

    async fn handle_reconnect(
        &mut self,
        previous_client_id: u8,
        token: [u8; RECONNECT_TOKEN_LEN],
        now: Instant,
    ) {
        let token_timeout = self.timing.session_token_timeout();
        if self
            .clients
            .validate_token(previous_client_id, &token, now, token_timeout)
        {
            self.clients.revive(previous_client_id, now);
            self.reliable.drop_destination(previous_client_id);
            let name = self
                .clients
                .get(previous_client_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            info!(client_id = previous_client_id, "client reconnected with token");
            self.metrics.connection_accepted();
            self.events.client_connected(previous_client_id, &name);
            self.send_accept(previous_client_id).await;
            self.send_token_grant(previous_client_id).await;
            self.schedule_session_config(previous_client_id, now);
            return;
        }

        // Expired or unknown token: treat as a fresh connection under the
        // remembered name, subject to capacity and the application hook.
        let name = self
            .clients
            .get(previous_client_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "player".to_string());
        if self
            .clients
            .get(previous_client_id)
            .map(|c| c.disconnected)
            .unwrap_or(false)
        {
            self.clients.remove(previous_client_id);
        }
        debug!(
            client_id = previous_client_id,
            "reconnect token expired, treating as fresh connect"
        );
        self.handle_connect_request(
            PROTOCOL_VERSION,
            name,
            self.options.session_id,
            self.options.required_game_id.unwrap_or_default(),
            now,
        )
        .await;
    }

    async fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Stop => {
                if matches!(self.state, HostState::Running | HostState::Registering) {
                    info!("host stopping, draining reliable sends");
                    self.state = HostState::Stopping;
                    self.stop_deadline =
                        Some(Instant::now() + self.timing.graceful_shutdown_timeout());
                } else {
                    self.state = HostState::Stopped;
                }
            }
            HostCommand::Send {
                destination,
                packet_type,
                data,
                reliable,
            } => {
                if packet_type < GAME_PACKET_BASE {
                    warn!(packet_type, "application sends must use game type codes");
                    return;
                }
                if reliable && destination == BROADCAST_ID {
                    warn!("reliable sends need a specific destination");
                    return;
                }
                let sequence = self.sequence.next();
                let packet = Packet::new(
                    Payload::Game { packet_type, data },
                    sequence,
                    HOST_ID,
                    destination,
                );
                match packet.encode() {
                    Ok(frame) => {
                        if reliable {
                            self.reliable
                                .schedule(destination, sequence, frame, Instant::now());
                        } else {
                            self.send_frame(&frame).await;
                        }
                    }
                    Err(e) => {
                        warn!("unencodable game packet: {e}");
                        self.events.error(&format!("unencodable game packet: {e}"));
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        if self.state == HostState::Stopping {
            let deadline_passed = self
                .stop_deadline
                .map(|deadline| now >= deadline)
                .unwrap_or(true);
            if self.reliable.is_empty() || deadline_passed {
                self.broadcast_disconnect().await;
                self.state = HostState::Stopped;
                return;
            }
        }

        let actions = self.reliable.process(
            now,
            self.timing.ack_timeout(),
            self.timing.max_ack_retries,
        );
        for _ in 0..actions.retry_count {
            self.metrics.packet_retried();
        }
        for (destination, frame) in &actions.sends {
            debug!(client_id = destination, "reliable send");
            self.send_frame(frame).await;
        }
        for (destination, sequence) in actions.failures {
            warn!(
                client_id = destination,
                sequence, "reliable delivery failed after retries"
            );
            self.events.delivery_failed(destination, sequence);
        }

        for id in self
            .clients
            .expire_tokens(now, self.timing.session_token_timeout())
        {
            debug!(client_id = id, "reconnect token expired");
        }

        if self.state == HostState::Running {
            let refresh_due = self
                .last_register
                .map(|at| now.duration_since(at) >= REGISTRATION_REFRESH)
                .unwrap_or(true);
            if refresh_due {
                self.send_registration().await;
            }
        }
    }

    /// The host registers (and keeps alive) its session by sending a
    /// self-addressed CONNECT_ACCEPT through the relay.
    async fn send_registration(&mut self) {
        let payload = Payload::ConnectAccept {
            client_id: HOST_ID,
            session_id: self.options.session_id,
        };
        self.send_payload(payload, HOST_ID).await;
        self.last_register = Some(Instant::now());
    }

    async fn send_accept(&mut self, client_id: u8) {
        let payload = Payload::ConnectAccept {
            client_id,
            session_id: self.options.session_id,
        };
        self.send_payload(payload, client_id).await;

        if !self.options.registry.is_empty() {
            let registry = Payload::PacketTypeRegistry {
                entries: self.options.registry.clone(),
            };
            self.send_payload(registry, client_id).await;
        }
    }

    /// Hand the client its reconnect token, reusing the RECONNECT_REQUEST
    /// shape in the host-to-client direction.
    async fn send_token_grant(&mut self, client_id: u8) {
        let Some(token) = self.clients.get(client_id).map(|c| c.reconnect_token) else {
            return;
        };
        let payload = Payload::ReconnectRequest {
            previous_client_id: client_id,
            token,
        };
        self.send_payload(payload, client_id).await;
    }

    fn schedule_session_config(&mut self, client_id: u8, now: Instant) {
        let sequence = self.sequence.next();
        let packet = Packet::new(
            Payload::SessionConfig {
                version: self.options.config_version,
                tick_rate: self.options.tick_rate,
                max_packet_size: self.options.max_packet_size,
            },
            sequence,
            HOST_ID,
            client_id,
        );
        match packet.encode() {
            Ok(frame) => {
                self.reliable.schedule(
                    client_id,
                    sequence,
                    frame,
                    now + self.timing.reliability_delay(),
                );
            }
            Err(e) => warn!("unencodable session config: {e}"),
        }
    }

    async fn broadcast_disconnect(&mut self) {
        let packet = Packet::new(
            Payload::DisconnectNotice,
            self.sequence.next(),
            HOST_ID,
            BROADCAST_ID,
        );
        if let Ok(frame) = packet.encode() {
            self.send_frame(&frame).await;
        }
    }

    async fn send_payload(&mut self, payload: Payload, destination: u8) {
        let packet = Packet::new(payload, self.sequence.next(), HOST_ID, destination);
        match packet.encode() {
            Ok(frame) => self.send_frame(&frame).await,
            Err(e) => warn!("unencodable packet: {e}"),
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) {
        match self.socket.send_to(frame, self.options.relay_addr).await {
            Ok(n) => {
                self.metrics.packet_sent(n);
                self.send_errors = 0;
            }
            Err(e) => {
                warn!("send to relay failed: {e}");
                self.metrics.packet_dropped(ErrorReason::Transport);
                self.send_errors += 1;
                if self.send_errors >= MAX_TRANSPORT_ERRORS {
                    self.events.error("persistent transport failure");
                    self.state = HostState::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingEvents {
        admit_calls: Vec<(String, u32)>,
        admit_response: Option<String>,
    }

    impl HostEvents for RecordingEvents {
        fn admit(&mut self, name: &str, game_id: u32) -> std::result::Result<(), String> {
            self.admit_calls.push((name.to_string(), game_id));
            match &self.admit_response {
                Some(reason) => Err(reason.clone()),
                None => Ok(()),
            }
        }
    }

    fn options() -> HostOptions {
        let mut options = HostOptions::new(SocketAddr::from(([127, 0, 0, 1], 7777)), 12345);
        options.required_game_id = Some(42);
        options.max_clients = 2;
        options
    }

    #[test]
    fn admission_rejects_wrong_session_before_anything_else() {
        let mut events = RecordingEvents::default();
        let err = check_admission(&options(), 0, &mut events, 1, "Alice", 999, 42).unwrap_err();
        assert_eq!(err, "wrong session");
        assert!(events.admit_calls.is_empty());
    }

    #[test]
    fn admission_rejects_bad_version_then_game_then_capacity() {
        let mut events = RecordingEvents::default();
        let opts = options();

        let err = check_admission(&opts, 0, &mut events, 9, "Alice", 12345, 42).unwrap_err();
        assert_eq!(err, "unsupported protocol version");

        let err = check_admission(&opts, 0, &mut events, 1, "Alice", 12345, 7).unwrap_err();
        assert_eq!(err, "game mismatch");

        let err = check_admission(&opts, 2, &mut events, 1, "Alice", 12345, 42).unwrap_err();
        assert_eq!(err, "full");
        assert!(events.admit_calls.is_empty());
    }

    #[test]
    fn admission_hook_runs_last_and_carries_its_reason() {
        let mut events = RecordingEvents {
            admit_response: Some("banned".to_string()),
            ..Default::default()
        };
        let err = check_admission(&options(), 0, &mut events, 1, "Alice", 12345, 42).unwrap_err();
        assert_eq!(err, "banned");
        assert_eq!(events.admit_calls, vec![("Alice".to_string(), 42)]);
    }

    #[test]
    fn admission_accepts_when_everything_lines_up() {
        let mut events = RecordingEvents::default();
        check_admission(&options(), 1, &mut events, 1, "Alice", 12345, 42).unwrap();
        assert_eq!(events.admit_calls.len(), 1);
    }

    #[test]
    fn game_id_is_not_checked_when_policy_is_open() {
        let mut events = RecordingEvents::default();
        let mut opts = options();
        opts.required_game_id = None;
        check_admission(&opts, 0, &mut events, 1, "Alice", 12345, 7).unwrap();
    }
}
