//! Host behavior against a scripted relay endpoint.
//!
//! The test socket plays both the relay and the clients behind it: every
//! packet the host emits lands here, and frames written from here look to
//! the host like relayed client traffic.

use std::net::SocketAddr;
use std::time::Duration;

use huddle_common::Config;
use huddle_host::{Host, HostEvents, HostHandle, HostOptions};
use nexus_core::{Packet, Payload, SequenceCounter, HOST_ID, PROTOCOL_VERSION, RECONNECT_TOKEN_LEN};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq, Clone)]
enum Event {
    Connected(u8, String),
    Denied(String, String),
    Disconnected(u8),
    Ping(u8),
    DeliveryFailed(u8, u16),
}

struct ChannelEvents {
    tx: mpsc::UnboundedSender<Event>,
}

impl HostEvents for ChannelEvents {
    fn client_connected(&mut self, client_id: u8, name: &str) {
        let _ = self.tx.send(Event::Connected(client_id, name.to_string()));
    }

    fn client_denied(&mut self, name: &str, reason: &str) {
        let _ = self
            .tx
            .send(Event::Denied(name.to_string(), reason.to_string()));
    }

    fn client_disconnected(&mut self, client_id: u8) {
        let _ = self.tx.send(Event::Disconnected(client_id));
    }

    fn ping_received(&mut self, client_id: u8) {
        let _ = self.tx.send(Event::Ping(client_id));
    }

    fn delivery_failed(&mut self, client_id: u8, sequence: u16) {
        let _ = self.tx.send(Event::DeliveryFailed(client_id, sequence));
    }
}

struct Harness {
    relay: UdpSocket,
    host_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<Event>,
    handle: HostHandle,
    task: JoinHandle<()>,
    seq: SequenceCounter,
    buf: Vec<u8>,
}

impl Harness {
    async fn start(config: Config, mut options_fn: impl FnMut(&mut HostOptions)) -> Self {
        let relay = UdpSocket::bind("127.0.0.1:0").await.expect("bind relay");
        let relay_addr = relay.local_addr().expect("relay addr");

        let mut options = HostOptions::new(relay_addr, 12345);
        options_fn(&mut options);

        let (tx, events) = mpsc::unbounded_channel();
        let (host, handle) = Host::bind(&config, options, Box::new(ChannelEvents { tx }))
            .await
            .expect("bind host");
        let host_addr = host.local_addr().expect("host addr");
        let task = tokio::spawn(async move {
            let _ = host.run().await;
        });

        Self {
            relay,
            host_addr,
            events,
            handle,
            task,
            seq: SequenceCounter::new(),
            buf: vec![0u8; 65_535],
        }
    }

    async fn send(&mut self, payload: Payload, sender_id: u8, destination_id: u8) {
        let packet = Packet::new(payload, self.seq.next(), sender_id, destination_id);
        let frame = packet.encode().expect("encode");
        self.relay
            .send_to(&frame, self.host_addr)
            .await
            .expect("send to host");
    }

    /// Read host output until a packet matches, skipping registration
    /// refreshes and anything else.
    async fn expect_packet(&mut self, what: &str, pred: impl Fn(&Packet) -> bool) -> Packet {
        timeout(WAIT, async {
            loop {
                let (len, _) = self.relay.recv_from(&mut self.buf).await.expect("recv");
                if let Ok(packet) = Packet::decode(&self.buf[..len]) {
                    if pred(&packet) {
                        return packet;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    async fn expect_event(&mut self, what: &str) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("events channel closed")
    }

    /// Drive a full admission and return (client_id, token, config seq).
    async fn connect(&mut self, name: &str) -> (u8, [u8; RECONNECT_TOKEN_LEN], u16) {
        self.send(
            Payload::ConnectRequest {
                client_version: PROTOCOL_VERSION,
                player_name: name.to_string(),
                target_session_id: 12345,
                game_id: 0,
            },
            0,
            HOST_ID,
        )
        .await;

        let accept = self
            .expect_packet("connect accept", |p| {
                matches!(p.payload, Payload::ConnectAccept { client_id, .. } if client_id != HOST_ID)
            })
            .await;
        let Payload::ConnectAccept { client_id, .. } = accept.payload else {
            unreachable!();
        };

        let grant = self
            .expect_packet("token grant", |p| {
                matches!(p.payload, Payload::ReconnectRequest { .. })
            })
            .await;
        let Payload::ReconnectRequest { token, .. } = grant.payload else {
            unreachable!();
        };

        let config = self
            .expect_packet("session config", |p| {
                matches!(p.payload, Payload::SessionConfig { .. })
            })
            .await;

        (client_id, token, config.header.sequence)
    }

    fn ack(&self, sequence: u16) -> Payload {
        Payload::Ack {
            sequences: vec![sequence],
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.host.ack_timeout_ms = 200;
    config.host.max_ack_retries = 2;
    config.host.reliability_delay_ms = 10;
    config.host.loop_sleep_ms = 5;
    config
}

#[tokio::test]
async fn registers_session_on_start() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;

    let registration = harness
        .expect_packet("registration", |p| {
            matches!(p.payload, Payload::ConnectAccept { client_id, session_id }
                if client_id == HOST_ID && session_id == 12345)
        })
        .await;
    assert_eq!(registration.header.sender_id, HOST_ID);
    assert_eq!(registration.header.destination_id, HOST_ID);
}

#[tokio::test]
async fn clean_handshake_assigns_id_two_and_drains_tracker_on_ack() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;

    let (client_id, _token, config_seq) = harness.connect("Alice").await;
    assert_eq!(client_id, 2);
    assert_eq!(
        harness.expect_event("connected event").await,
        Event::Connected(2, "Alice".to_string())
    );

    let ack = harness.ack(config_seq);
    harness.send(ack, client_id, HOST_ID).await;

    // An acked tracker must not retransmit. Give two full ack timeouts
    // for a straggler to show up.
    let quiet = timeout(Duration::from_millis(600), async {
        loop {
            let (len, _) = harness.relay.recv_from(&mut harness.buf).await.expect("recv");
            if let Ok(packet) = Packet::decode(&harness.buf[..len]) {
                if matches!(packet.payload, Payload::SessionConfig { .. }) {
                    return;
                }
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "session config was retransmitted after ack");
}

#[tokio::test]
async fn session_config_is_retried_then_reported_failed() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, _token, first_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;

    // Never ACK: two retries with the same sequence, then failure.
    for _ in 0..2 {
        let retry = harness
            .expect_packet("session config retry", |p| {
                matches!(p.payload, Payload::SessionConfig { .. })
            })
            .await;
        assert_eq!(retry.header.sequence, first_seq);
    }

    assert_eq!(
        harness.expect_event("delivery failure").await,
        Event::DeliveryFailed(client_id, first_seq)
    );
}

#[tokio::test]
async fn ping_is_answered_with_the_original_timestamp() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, _token, config_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;
    let ack = harness.ack(config_seq);
    harness.send(ack, client_id, HOST_ID).await;

    harness
        .send(Payload::Ping { timestamp: 777 }, client_id, HOST_ID)
        .await;
    let pong = harness
        .expect_packet("pong", |p| matches!(p.payload, Payload::Pong { .. }))
        .await;
    assert_eq!(
        pong.payload,
        Payload::Pong {
            original_timestamp: 777
        }
    );
    assert_eq!(pong.header.destination_id, client_id);
    assert_eq!(harness.expect_event("ping event").await, Event::Ping(client_id));
}

#[tokio::test]
async fn admission_denies_wrong_session_and_capacity() {
    let mut harness = Harness::start(fast_config(), |options| {
        options.max_clients = 1;
    })
    .await;

    harness
        .send(
            Payload::ConnectRequest {
                client_version: PROTOCOL_VERSION,
                player_name: "Mallory".to_string(),
                target_session_id: 999,
                game_id: 0,
            },
            0,
            HOST_ID,
        )
        .await;
    let deny = harness
        .expect_packet("wrong session deny", |p| {
            matches!(p.payload, Payload::ConnectDeny { .. })
        })
        .await;
    assert_eq!(
        deny.payload,
        Payload::ConnectDeny {
            reason: "wrong session".to_string()
        }
    );

    let (_, _, config_seq) = harness.connect("Alice").await;
    harness.expect_event("denied event").await; // Mallory's deny
    harness.expect_event("alice connected").await;
    let ack = harness.ack(config_seq);
    harness.send(ack, 2, HOST_ID).await;

    harness
        .send(
            Payload::ConnectRequest {
                client_version: PROTOCOL_VERSION,
                player_name: "Bob".to_string(),
                target_session_id: 12345,
                game_id: 0,
            },
            0,
            HOST_ID,
        )
        .await;
    let deny = harness
        .expect_packet("capacity deny", |p| {
            matches!(p.payload, Payload::ConnectDeny { .. })
        })
        .await;
    assert_eq!(
        deny.payload,
        Payload::ConnectDeny {
            reason: "full".to_string()
        }
    );
}

#[tokio::test]
async fn reconnect_with_valid_token_keeps_the_client_id() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, token, config_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;
    let ack = harness.ack(config_seq);
    harness.send(ack, client_id, HOST_ID).await;

    harness
        .send(Payload::DisconnectNotice, client_id, HOST_ID)
        .await;
    assert_eq!(
        harness.expect_event("disconnect event").await,
        Event::Disconnected(client_id)
    );

    harness
        .send(
            Payload::ReconnectRequest {
                previous_client_id: client_id,
                token,
            },
            client_id,
            HOST_ID,
        )
        .await;
    let accept = harness
        .expect_packet("reconnect accept", |p| {
            matches!(p.payload, Payload::ConnectAccept { client_id, .. } if client_id != HOST_ID)
        })
        .await;
    assert_eq!(
        accept.payload,
        Payload::ConnectAccept {
            client_id,
            session_id: 12345
        }
    );
}

#[tokio::test]
async fn reconnect_with_bad_token_is_admitted_as_a_new_client() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, _token, config_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;
    let ack = harness.ack(config_seq);
    harness.send(ack, client_id, HOST_ID).await;

    harness
        .send(
            Payload::ReconnectRequest {
                previous_client_id: client_id,
                token: [0u8; RECONNECT_TOKEN_LEN],
            },
            client_id,
            HOST_ID,
        )
        .await;
    let accept = harness
        .expect_packet("fresh accept", |p| {
            matches!(p.payload, Payload::ConnectAccept { client_id, .. } if client_id != HOST_ID)
        })
        .await;
    // Alice's original record is still live, so the fresh admission gets
    // the next id.
    assert_eq!(
        accept.payload,
        Payload::ConnectAccept {
            client_id: 3,
            session_id: 12345
        }
    );
}

#[tokio::test]
async fn duplicate_acks_are_harmless() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, _token, config_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;

    for _ in 0..3 {
        let ack = harness.ack(config_seq);
        harness.send(ack, client_id, HOST_ID).await;
    }

    // Still answering pings; nothing fell over.
    harness
        .send(Payload::Ping { timestamp: 1 }, client_id, HOST_ID)
        .await;
    harness
        .expect_packet("pong after duplicate acks", |p| {
            matches!(p.payload, Payload::Pong { .. })
        })
        .await;
}

#[tokio::test]
async fn graceful_stop_broadcasts_a_disconnect_notice() {
    let mut harness = Harness::start(fast_config(), |_| {}).await;
    let (client_id, _token, config_seq) = harness.connect("Alice").await;
    harness.expect_event("connected").await;
    let ack = harness.ack(config_seq);
    harness.send(ack, client_id, HOST_ID).await;

    harness.handle.stop();
    let notice = harness
        .expect_packet("broadcast disconnect", |p| {
            matches!(p.payload, Payload::DisconnectNotice)
        })
        .await;
    assert_eq!(notice.header.sender_id, HOST_ID);
    assert_eq!(notice.header.destination_id, 0);
}
