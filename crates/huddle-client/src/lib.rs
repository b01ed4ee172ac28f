//! Huddle client - owns the lifecycle against a single session.
//!
//! Connect with retries, keep the connection alive with pings, ACK
//! reliable host packets, and reconnect with exponential backoff using the
//! session token. Application code observes everything through
//! [`ClientEvents`]; callbacks run on the client loop task and must not
//! block.

#![forbid(unsafe_code)]

pub mod backoff;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ReconnectBackoff;
use bytes::Bytes;
use huddle_common::{config::ClientConfig, config::Config, Error, ErrorReason, Metrics, Result};
use nexus_core::{
    Header, Packet, Payload, RegistryEntry, SequenceCounter, HOST_ID, PROTOCOL_VERSION,
    RECONNECT_TOKEN_LEN, UNASSIGNED_ID,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consecutive send failures before the transport is declared dead.
const MAX_TRANSPORT_ERRORS: u32 = 8;

/// Application callbacks. Invoked synchronously on the client loop task;
/// they must return quickly.
pub trait ClientEvents: Send {
    fn connected(&mut self, _client_id: u8, _session_id: u32) {}

    fn denied(&mut self, _reason: &str) {}

    fn disconnected(&mut self) {}

    fn session_config(&mut self, _version: u8, _tick_rate: u16, _max_packet_size: u16) {}

    fn packet_registry(&mut self, _entries: &[RegistryEntry]) {}

    /// A PONG came back; `rtt` is the measured round trip.
    fn pong(&mut self, _rtt: Duration) {}

    /// An opaque game packet addressed to this client (or broadcast).
    fn game_packet(&mut self, _header: &Header, _data: &Bytes) {}

    fn error(&mut self, _message: &str) {}
}

/// No-op event sink.
pub struct NullEvents;

impl ClientEvents for NullEvents {}

/// What to connect to and as whom.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub relay_addr: SocketAddr,
    pub session_id: u32,
    pub player_name: String,
    pub game_id: u32,
}

impl ClientOptions {
    pub fn new(relay_addr: SocketAddr, session_id: u32, player_name: impl Into<String>) -> Self {
        Self {
            relay_addr,
            session_id,
            player_name: player_name.into(),
            game_id: 0,
        }
    }
}

/// Client lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug)]
enum ClientCommand {
    Stop,
    Send {
        destination: u8,
        packet_type: u8,
        data: Bytes,
    },
}

/// Clonable control surface for a running client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    /// Graceful close: notify the host, flush, tear down.
    pub fn stop(&self) {
        let _ = self.tx.send(ClientCommand::Stop);
    }

    /// Fire-and-forget game packet. `destination` 0 broadcasts to the
    /// whole session, 1 addresses the host.
    pub fn send_game(&self, destination: u8, packet_type: u8, data: Bytes) {
        let _ = self.tx.send(ClientCommand::Send {
            destination,
            packet_type,
            data,
        });
    }
}

/// The client state machine.
pub struct Client {
    socket: UdpSocket,
    options: ClientOptions,
    timing: ClientConfig,
    state: ClientState,
    client_id: Option<u8>,
    session_id: Option<u32>,
    reconnect_token: Option<[u8; RECONNECT_TOKEN_LEN]>,
    sequence: SequenceCounter,
    events: Box<dyn ClientEvents>,
    metrics: Arc<Metrics>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    buf: Vec<u8>,
    /// Base for PING timestamps.
    epoch: Instant,
    connect_started: Option<Instant>,
    last_request: Option<Instant>,
    last_ping_sent: Option<Instant>,
    /// Also seeded on connect so the timeout baseline is always set.
    last_pong: Option<Instant>,
    backoff: ReconnectBackoff,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
    /// Last accepted SESSION_CONFIG sequence, for duplicate suppression.
    last_config_seq: Option<u16>,
    send_errors: u32,
    stopping: bool,
}

impl Client {
    /// Bind an ephemeral socket and prepare the client. `run` connects.
    pub async fn bind(
        config: &Config,
        options: ClientOptions,
        events: Box<dyn ClientEvents>,
    ) -> Result<(Self, ClientHandle)> {
        config.validate()?;
        if options.session_id == 0 {
            return Err(Error::config("session_id must be non-zero"));
        }
        if options.player_name.is_empty() {
            return Err(Error::config("player_name must not be empty"));
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let timing = config.client.clone();
        let backoff = ReconnectBackoff::new(
            timing.initial_reconnect_delay(),
            timing.max_reconnect_delay(),
        );

        let client = Self {
            socket,
            options,
            timing,
            state: ClientState::Disconnected,
            client_id: None,
            session_id: None,
            reconnect_token: None,
            sequence: SequenceCounter::new(),
            events,
            metrics: Arc::new(Metrics::new()),
            commands: rx,
            buf: vec![0u8; config.buffer_size],
            epoch: Instant::now(),
            connect_started: None,
            last_request: None,
            last_ping_sent: None,
            last_pong: None,
            backoff,
            reconnect_attempts: 0,
            next_reconnect_at: None,
            last_config_seq: None,
            send_errors: 0,
            stopping: false,
        };
        Ok((client, ClientHandle { tx }))
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Connect and serve the session until stopped, denied, or given up.
    pub async fn run(mut self) -> Result<()> {
        let now = Instant::now();
        self.state = ClientState::Connecting;
        self.connect_started = Some(now);
        self.send_connect_request().await;
        info!(
            session_id = self.options.session_id,
            relay = %self.options.relay_addr,
            "connecting"
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

            if self.state == ClientState::Disconnected {
                break;
            }
        }

        info!("client loop finished");
        Ok(())
    }

    fn timestamp_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
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
            Payload::ConnectAccept {
                client_id,
                session_id,
            } => self.handle_accept(client_id, session_id, now),
            Payload::ConnectDeny { reason } => {
                if matches!(
                    self.state,
                    ClientState::Connecting | ClientState::Reconnecting
                ) {
                    info!(reason = %reason, "connection denied");
                    self.metrics.connection_denied();
                    self.events.denied(&reason);
                    self.state = ClientState::Disconnected;
                }
            }
            Payload::SessionConfig {
                version,
                tick_rate,
                max_packet_size,
            } => {
                // ACK every copy so a lost ACK gets another chance, but
                // deliver each sequence to the application once.
                self.send_ack(header.sequence).await;
                if self.last_config_seq != Some(header.sequence) {
                    self.last_config_seq = Some(header.sequence);
                    self.events
                        .session_config(version, tick_rate, max_packet_size);
                } else {
                    debug!(sequence = header.sequence, "duplicate session config");
                }
            }
            Payload::PacketTypeRegistry { entries } => {
                self.events.packet_registry(&entries);
            }
            Payload::Pong { original_timestamp } => {
                self.last_pong = Some(now);
                let rtt = Duration::from_micros(
                    self.timestamp_us().saturating_sub(original_timestamp),
                );
                self.metrics.observe_rtt(rtt);
                self.events.pong(rtt);
            }
            Payload::ReconnectRequest { token, .. } => {
                // Token grant from the host.
                debug!("received reconnect token");
                self.reconnect_token = Some(token);
            }
            Payload::DisconnectNotice => {
                if header.sender_id == HOST_ID {
                    info!("session ended by host or relay");
                    self.events.disconnected();
                    self.state = ClientState::Disconnected;
                }
            }
            Payload::Game { data, .. } => {
                self.events.game_packet(&header, &data);
            }
            other => {
                debug!("ignoring client-bound {:?}", other.type_code());
            }
        }
    }

    fn handle_accept(&mut self, client_id: u8, session_id: u32, now: Instant) {
        match self.state {
            ClientState::Connecting | ClientState::Reconnecting => {
                // A reconnect past the token window comes back with a
                // fresh id; adopt whatever the host assigned.
                self.client_id = Some(client_id);
                self.session_id = Some(session_id);
                self.state = ClientState::Connected;
                self.connect_started = None;
                self.next_reconnect_at = None;
                self.reconnect_attempts = 0;
                self.backoff.reset();
                self.last_pong = Some(now);
                self.last_ping_sent = None;
                info!(client_id, session_id, "connected");
                self.metrics.connection_accepted();
                self.events.connected(client_id, session_id);
            }
            _ => {
                debug!("ignoring accept while {:?}", self.state);
            }
        }
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Stop => {
                self.stopping = true;
                if self.state == ClientState::Connected {
                    info!("disconnecting");
                    self.send_payload(Payload::DisconnectNotice, HOST_ID).await;
                    // Give the datagram a moment to flush before the
                    // socket goes away.
                    tokio::time::sleep(self.timing.disconnect_notice_delay()).await;
                }
                self.events.disconnected();
                self.state = ClientState::Disconnected;
            }
            ClientCommand::Send {
                destination,
                packet_type,
                data,
            } => {
                if self.state != ClientState::Connected {
                    debug!("dropping game send while {:?}", self.state);
                    return;
                }
                if packet_type < nexus_core::GAME_PACKET_BASE {
                    warn!(packet_type, "application sends must use game type codes");
                    return;
                }
                self.send_payload(Payload::Game { packet_type, data }, destination)
                    .await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state {
            ClientState::Connecting => {
                let started = self.connect_started.unwrap_or(now);
                if now.duration_since(started) >= self.timing.connection_timeout() {
                    warn!("connect timed out");
                    self.events.error("connect timed out");
                    self.begin_reconnect_or_give_up(now);
                    return;
                }
                let request_due = self
                    .last_request
                    .map(|at| now.duration_since(at) >= self.timing.connect_retry_interval())
                    .unwrap_or(true);
                if request_due {
                    self.send_connect_request().await;
                }
            }
            ClientState::Connected => {
                let ping_due = self
                    .last_ping_sent
                    .map(|at| now.duration_since(at) >= self.timing.ping_interval())
                    .unwrap_or(true);
                if ping_due {
                    let ping = Payload::Ping {
                        timestamp: self.timestamp_us(),
                    };
                    self.send_payload(ping, HOST_ID).await;
                    self.last_ping_sent = Some(Instant::now());
                }

                let baseline = self.last_pong.unwrap_or(self.epoch);
                if now.duration_since(baseline) >= self.timing.connection_timeout() {
                    warn!("ping timeout, connection lost");
                    self.events.error("ping timeout");
                    self.begin_reconnect_or_give_up(now);
                }
            }
            ClientState::Reconnecting => {
                let due = self
                    .next_reconnect_at
                    .map(|at| now >= at)
                    .unwrap_or(true);
                if !due {
                    return;
                }
                if self.reconnect_attempts >= self.timing.max_reconnect_attempts {
                    warn!(
                        attempts = self.reconnect_attempts,
                        "giving up on reconnection"
                    );
                    self.events.disconnected();
                    self.state = ClientState::Disconnected;
                    return;
                }
                self.reconnect_attempts += 1;
                let delay = self.backoff.next_delay();
                self.next_reconnect_at = Some(now + delay);
                info!(
                    attempt = self.reconnect_attempts,
                    next_delay_ms = delay.as_millis() as u64,
                    "reconnect attempt"
                );
                self.send_reconnect_request().await;
            }
            ClientState::Disconnected => {}
        }
    }

    /// Network failure or timeout: reconnect if a token is held, otherwise
    /// give up.
    fn begin_reconnect_or_give_up(&mut self, now: Instant) {
        if self.reconnect_token.is_some() && self.client_id.is_some() && !self.stopping {
            self.state = ClientState::Reconnecting;
            self.reconnect_attempts = 0;
            self.backoff.reset();
            self.next_reconnect_at = Some(now + self.backoff.next_delay());
        } else {
            self.events.disconnected();
            self.state = ClientState::Disconnected;
        }
    }

    async fn send_connect_request(&mut self) {
        let payload = Payload::ConnectRequest {
            client_version: PROTOCOL_VERSION,
            player_name: self.options.player_name.clone(),
            target_session_id: self.options.session_id,
            game_id: self.options.game_id,
        };
        self.send_payload(payload, HOST_ID).await;
        self.last_request = Some(Instant::now());
    }

    async fn send_reconnect_request(&mut self) {
        let (Some(previous_client_id), Some(token)) = (self.client_id, self.reconnect_token)
        else {
            self.events.disconnected();
            self.state = ClientState::Disconnected;
            return;
        };
        let payload = Payload::ReconnectRequest {
            previous_client_id,
            token,
        };
        self.send_payload(payload, HOST_ID).await;
    }

    async fn send_ack(&mut self, sequence: u16) {
        let payload = Payload::Ack {
            sequences: vec![sequence],
        };
        self.send_payload(payload, HOST_ID).await;
    }

    async fn send_payload(&mut self, payload: Payload, destination: u8) {
        let sender = self.client_id.unwrap_or(UNASSIGNED_ID);
        let packet = Packet::new(payload, self.sequence.next(), sender, destination);
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
                    let now = Instant::now();
                    self.begin_reconnect_or_give_up(now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_bad_options() {
        let config = Config::default();
        let relay = SocketAddr::from(([127, 0, 0, 1], 7777));

        let options = ClientOptions::new(relay, 0, "Alice");
        assert!(Client::bind(&config, options, Box::new(NullEvents))
            .await
            .is_err());

        let options = ClientOptions::new(relay, 5, "");
        assert!(Client::bind(&config, options, Box::new(NullEvents))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fresh_client_starts_disconnected_with_no_identity() {
        let config = Config::default();
        let relay = SocketAddr::from(([127, 0, 0, 1], 7777));
        let options = ClientOptions::new(relay, 12345, "Alice");
        let (client, _handle) = Client::bind(&config, options, Box::new(NullEvents))
            .await
            .unwrap();
        assert_eq!(client.state, ClientState::Disconnected);
        assert!(client.client_id.is_none());
        assert!(client.reconnect_token.is_none());
    }
}
