//! The relay event loop: validate, rate-limit, route.
//!
//! The relay never parses payloads of game packets; core packets get the
//! special handling the protocol requires (session registration, pending
//! connect bookkeeping, disconnect fan-out). Everything runs on one task;
//! the only event sources are the socket and the periodic cleanup tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use huddle_common::{config::Config, ErrorReason, Metrics, Result};
use nexus_core::{
    Header, Packet, Payload, SequenceCounter, BROADCAST_ID, HEADER_SIZE, HOST_ID,
};
use thiserror::Error as ThisError;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::export::{RelaySnapshot, SessionSummary};
use crate::rate_limit::RateLimiterMap;
use crate::session::{SessionError, SessionPool};

/// Why a datagram was dropped. Dropped means dropped: none of these is
/// ever signalled to the peer.
#[derive(Debug, ThisError)]
pub enum RouteError {
    #[error("datagram filled the receive buffer, possibly truncated")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("malformed packet: {0}")]
    Malformed(#[from] nexus_core::WireError),
    #[error("rate limited")]
    RateLimited,
    #[error("unknown session {0}")]
    UnknownSession(u32),
    #[error("no binding for destination id {0}")]
    UnknownDestination(u8),
    #[error("sender endpoint not in any session")]
    UnknownPeer,
    #[error("core packet not from the session host")]
    NotFromHost,
    #[error("admission limit: {0}")]
    AdmissionLimit(#[from] SessionError),
}

impl RouteError {
    fn reason(&self) -> ErrorReason {
        match self {
            RouteError::Truncated | RouteError::Malformed(_) => ErrorReason::Malformed,
            RouteError::BadMagic => ErrorReason::BadMagic,
            RouteError::RateLimited => ErrorReason::RateLimited,
            RouteError::UnknownSession(_)
            | RouteError::UnknownDestination(_)
            | RouteError::UnknownPeer
            | RouteError::NotFromHost
            | RouteError::AdmissionLimit(_) => ErrorReason::RoutingUnknown,
        }
    }
}

/// Relay server state. All of it lives on the loop task.
pub struct RelayServer {
    socket: UdpSocket,
    pool: SessionPool,
    limiters: RateLimiterMap,
    config: Config,
    metrics: Arc<Metrics>,
    sequence: SequenceCounter,
    buf: Vec<u8>,
}

impl RelayServer {
    /// Bind the relay socket and build the server.
    pub async fn bind(listen: SocketAddr, config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(listen).await?;
        info!("relay listening on {}", socket.local_addr()?);

        let pool = SessionPool::new(
            config.relay.max_total_connections,
            config.relay.max_clients_per_session,
            config.relay.max_pending_connections,
        );
        let limiters = RateLimiterMap::new(config.rate_limit.clone());
        let buf = vec![0u8; config.buffer_size];

        Ok(Self {
            socket,
            pool,
            limiters,
            config,
            metrics,
            sequence: SequenceCounter::new(),
            buf,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Point-in-time view of sessions for operators and tests.
    pub fn snapshot(&self) -> RelaySnapshot {
        let now = Instant::now();
        RelaySnapshot {
            sessions: self
                .pool
                .sessions()
                .map(|s| SessionSummary {
                    session_id: s.session_id,
                    client_count: s.clients.len(),
                    age_secs: now.duration_since(s.created_at).as_secs(),
                    idle_secs: now.duration_since(s.last_activity).as_secs(),
                    packets_forwarded: s.packets_forwarded,
                    bytes_forwarded: s.bytes_forwarded,
                })
                .collect(),
            pending_connections: self.pool.pending_len(),
            rate_limiters: self.limiters.len(),
        }
    }

    /// Run until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves. The loop exits at the next event
    /// after the signal fires.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut cleanup = tokio::time::interval(self.config.relay.cleanup_interval());
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay loop stopping");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut self.buf) => {
                    let (len, src) = match result {
                        Ok(ok) => ok,
                        Err(e) => {
                            warn!("socket receive error: {e}");
                            self.metrics.packet_dropped(ErrorReason::Transport);
                            continue;
                        }
                    };
                    self.metrics.packet_received(len);
                    if let Err(e) = self.handle_datagram(len, src).await {
                        debug!("packet from {src} dropped: {e}");
                        self.metrics.packet_dropped(e.reason());
                    }
                }
                _ = cleanup.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, len: usize, src: SocketAddr) -> std::result::Result<(), RouteError> {
        // A datagram that exactly fills the buffer may have been cut off
        // by the kernel; it is never decoded.
        if len == self.buf.len() {
            return Err(RouteError::Truncated);
        }

        if !Header::quick_check(&self.buf[..len]) {
            if len < HEADER_SIZE {
                return Err(RouteError::Malformed(nexus_core::WireError::TooShort(
                    len,
                    HEADER_SIZE,
                )));
            }
            return Err(RouteError::BadMagic);
        }

        let now = Instant::now();
        if !self.limiters.check(src, now) {
            return Err(RouteError::RateLimited);
        }

        let header = Header::decode(&self.buf[..len])?;

        if header.is_game_packet() {
            return self.route_game(&header, len, src, now).await;
        }

        let payload = Payload::decode(header.packet_type, &self.buf[HEADER_SIZE..len])?;
        match payload {
            Payload::ConnectRequest {
                target_session_id, ..
            } => self.route_connect_request(target_session_id, len, src, now).await,
            Payload::ConnectAccept {
                client_id,
                session_id,
            } => {
                self.route_connect_accept(&header, client_id, session_id, len, src, now)
                    .await
            }
            Payload::ConnectDeny { .. } => self.route_connect_deny(len, src, now).await,
            Payload::SessionConfig { .. } | Payload::PacketTypeRegistry { .. } | Payload::Pong { .. } => {
                self.route_from_host(&header, len, src, now).await
            }
            Payload::Ping { .. } => self.route_to_host(len, src, now).await,
            Payload::Ack { .. } => self.route_any(&header, len, src, now).await,
            Payload::DisconnectNotice => self.route_disconnect(len, src, now).await,
            Payload::ReconnectRequest { .. } => self.route_reconnect(&header, len, src, now).await,
            // Game payloads were dispatched before core decode; reaching
            // here means the type code tables disagree.
            Payload::Game { .. } => Err(RouteError::Malformed(
                nexus_core::WireError::UnknownPacketType(header.packet_type),
            )),
        }
    }

    /// Opaque forwarding. The relay looks at the header only; payload
    /// bytes are passed through untouched.
    async fn route_game(
        &mut self,
        header: &Header,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;
        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;

        if header.destination_id == BROADCAST_ID {
            let targets = session.participants_except(src);
            session.record_forward(len, now);
            let frame = self.buf[..len].to_vec();
            for target in targets {
                self.send_raw(&frame, target).await;
            }
            return Ok(());
        }

        let target = session
            .endpoint_of(header.destination_id)
            .ok_or(RouteError::UnknownDestination(header.destination_id))?;
        session.record_forward(len, now);
        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, target).await;
        Ok(())
    }

    async fn route_connect_request(
        &mut self,
        target_session_id: u32,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let host = self
            .pool
            .get(target_session_id)
            .map(|s| s.host_endpoint)
            .ok_or(RouteError::UnknownSession(target_session_id))?;

        self.pool.mark_pending(src, target_session_id, now)?;
        if let Some(session) = self.pool.get_mut(target_session_id) {
            session.touch(now);
        }

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, host).await;
        Ok(())
    }

    async fn route_connect_accept(
        &mut self,
        header: &Header,
        client_id: u8,
        session_id: u32,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        // A self-addressed accept from the host is session registration
        // (and, for an existing session, a keepalive refresh).
        if header.sender_id == HOST_ID && header.destination_id == HOST_ID {
            let created = self.pool.get(session_id).is_none();
            self.pool.register_host(session_id, src, now)?;
            if created {
                info!(session_id, host = %src, "session registered");
                self.metrics.session_created();
            }
            return Ok(());
        }

        let session = self
            .pool
            .get(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        if session.host_endpoint != src {
            return Err(RouteError::NotFromHost);
        }

        // Route to the already-bound endpoint (a reconnect keeping its id)
        // or to the oldest pending applicant for this session.
        let target = session
            .endpoint_of(header.destination_id)
            .or_else(|| self.pool.oldest_pending_for(session_id))
            .ok_or(RouteError::UnknownDestination(header.destination_id))?;

        self.pool.bind_client(session_id, client_id, target, now)?;
        self.pool.clear_pending(target);
        self.metrics.connection_accepted();
        info!(session_id, client_id, endpoint = %target, "client admitted");

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, target).await;
        Ok(())
    }

    async fn route_connect_deny(
        &mut self,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;
        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        if session.host_endpoint != src {
            return Err(RouteError::NotFromHost);
        }
        session.touch(now);

        // Denies leave no routing state behind; the applicant just hears
        // the bad news.
        let target = self
            .pool
            .oldest_pending_for(session_id)
            .ok_or(RouteError::UnknownDestination(BROADCAST_ID))?;
        self.pool.clear_pending(target);
        self.metrics.connection_denied();

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, target).await;
        Ok(())
    }

    /// Host-to-client forwarding with source binding enforced.
    async fn route_from_host(
        &mut self,
        header: &Header,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;
        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        if session.host_endpoint != src {
            return Err(RouteError::NotFromHost);
        }

        let target = session
            .endpoint_of(header.destination_id)
            .ok_or(RouteError::UnknownDestination(header.destination_id))?;
        session.touch(now);

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, target).await;
        Ok(())
    }

    /// Client-to-host forwarding (PING).
    async fn route_to_host(
        &mut self,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;
        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        let host = session.host_endpoint;
        session.touch(now);

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, host).await;
        Ok(())
    }

    /// ACKs travel in either direction; no relay state is involved.
    async fn route_any(
        &mut self,
        header: &Header,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;
        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        let target = session
            .endpoint_of(header.destination_id)
            .ok_or(RouteError::UnknownDestination(header.destination_id))?;
        session.touch(now);

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, target).await;
        Ok(())
    }

    async fn route_disconnect(
        &mut self,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let (session_id, id, survivors) = self
            .pool
            .remove_endpoint(src, now)
            .ok_or(RouteError::UnknownPeer)?;

        if id == HOST_ID {
            info!(session_id, "host left, session destroyed");
            self.metrics.session_destroyed();
        } else {
            info!(session_id, client_id = id, "client left session");
            self.metrics.connection_disconnected();
        }

        let frame = self.buf[..len].to_vec();
        for target in survivors {
            self.send_raw(&frame, target).await;
        }
        Ok(())
    }

    /// RECONNECT_REQUEST runs both ways: clients use it to resume an
    /// identity, and the host uses the same shape to grant the token in
    /// the first place.
    async fn route_reconnect(
        &mut self,
        header: &Header,
        len: usize,
        src: SocketAddr,
        now: Instant,
    ) -> std::result::Result<(), RouteError> {
        let session_id = self
            .pool
            .session_of_endpoint(src)
            .ok_or(RouteError::UnknownPeer)?;

        if self
            .pool
            .get(session_id)
            .map(|s| s.host_endpoint == src)
            .unwrap_or(false)
        {
            return self.route_from_host(header, len, src, now).await;
        }

        // A reconnect that ends in a fresh client id routes back through
        // the pending queue, so mark the applicant; a full queue is fine
        // as long as the old binding is still in place.
        let _ = self.pool.mark_pending(src, session_id, now);

        let session = self
            .pool
            .get_mut(session_id)
            .ok_or(RouteError::UnknownSession(session_id))?;
        let host = session.host_endpoint;
        session.touch(now);

        let frame = self.buf[..len].to_vec();
        self.send_raw(&frame, host).await;
        Ok(())
    }

    async fn cleanup(&mut self) {
        let now = Instant::now();
        let report = self.pool.cleanup(
            now,
            self.config.relay.client_timeout(),
            self.config.relay.pending_connection_timeout(),
        );

        for (session_id, clients) in &report.expired_sessions {
            info!(session_id, clients = clients.len(), "session expired, notifying survivors");
            self.metrics.session_destroyed();
            let notice = Packet::new(
                Payload::DisconnectNotice,
                self.sequence.next(),
                HOST_ID,
                BROADCAST_ID,
            );
            if let Ok(frame) = notice.encode() {
                for target in clients {
                    self.send_raw(&frame, *target).await;
                }
            }
        }

        let reclaimed = self
            .limiters
            .cleanup(now, self.config.relay.client_timeout());
        if !report.is_empty() || reclaimed > 0 {
            debug!(
                expired_sessions = report.expired_sessions.len(),
                expired_pending = report.expired_pending,
                reclaimed_limiters = reclaimed,
                "cleanup pass"
            );
        }
    }

    /// Best-effort send. Errors are packet loss, not failures.
    async fn send_raw(&self, frame: &[u8], dest: SocketAddr) {
        match self.socket.send_to(frame, dest).await {
            Ok(n) => self.metrics.packet_sent(n),
            Err(e) => {
                warn!("send to {dest} failed: {e}");
                self.metrics.packet_dropped(ErrorReason::Transport);
            }
        }
    }
}

/// Convenience wrapper: bind on the configured port and run forever.
pub async fn run_relay(listen: SocketAddr, config: Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let mut server = RelayServer::bind(listen, config, metrics).await?;
    server.run().await
}
