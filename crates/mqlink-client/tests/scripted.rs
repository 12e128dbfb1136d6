//! End-to-end scenarios against a scripted broker.
//!
//! Each test binds a real listener (or an in-memory duplex pipe), drives
//! the broker side of the conversation packet by packet, and asserts on
//! the engine's observable behavior: events, tokens, exit reasons, and the
//! exact packets that reach the wire.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use mqlink_core::{
    decode_packet, encode_packet, Connack, ConnackCode, Packet, Publish, QoS, Suback,
    SubscribeReturn,
};

use mqlink_client::events::{self, Event, EventKind};
use mqlink_client::transport::{Connected, Connector};
use mqlink_client::{
    BackoffConfig, ClientConfig, ClientError, ConnectionStatus, Handler, Message, MqttClient,
    NoopHandler, TransportError,
};

const STEP: Duration = Duration::from_secs(5);

/// The broker side of one connection: reads and writes typed packets.
struct Script<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Script<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn read_packet(&mut self) -> Packet {
        loop {
            if let Some((packet, consumed)) = decode_packet(&self.buf, 0).unwrap() {
                self.buf.advance(consumed);
                return packet;
            }
            let n = timeout(STEP, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a packet")
                .unwrap();
            assert!(n > 0, "connection closed while waiting for a packet");
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }
}

async fn accept(listener: &TcpListener) -> Script<TcpStream> {
    let (socket, _) = timeout(STEP, listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .unwrap();
    Script::new(socket)
}

fn config(addr: SocketAddr, client_id: &str) -> ClientConfig {
    ClientConfig::new(addr.to_string())
        .client_id(client_id)
        .keep_alive(0)
        .backoff(BackoffConfig {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(100),
        })
        .connect_timeout(STEP)
        .connack_timeout(STEP)
}

fn accepted(session_present: bool) -> Packet {
    Packet::Connack(Connack {
        session_present,
        code: ConnackCode::Accepted,
    })
}

fn publish(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.to_string(),
        packet_id,
        payload: bytes::Bytes::from_static(payload),
    })
}

#[tokio::test]
async fn connect_accepted_reports_up_and_hands_out_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut status = events::bus().subscribe(Some("t-accept"), EventKind::Status);
    let (client, eventloop) = MqttClient::tcp(config(addr, "t-accept"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    let connect = match broker.read_packet().await {
        Packet::Connect(connect) => connect,
        other => panic!("expected CONNECT, got {:?}", other),
    };
    assert_eq!(connect.client_id, "t-accept");
    assert!(connect.clean_session);
    broker.send(&accepted(false)).await;

    let event = timeout(STEP, status.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Event::Status {
            status: ConnectionStatus::Up,
            ..
        }
    ));

    let handle = client.connection(STEP).await.unwrap();
    assert!(!handle.peer().is_empty());

    client.disconnect().await.unwrap();
    assert!(matches!(broker.read_packet().await, Packet::Disconnect));
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn connack_refusal_is_fatal_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (_client, eventloop) = MqttClient::tcp(config(addr, "t-refused"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker
        .send(&Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::IdentifierRejected,
        }))
        .await;

    let err = engine.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Refused(ConnackCode::IdentifierRejected)
    ));

    // No reconnect follows an authoritative refusal
    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err(),
        "refused client must not reconnect"
    );
}

#[tokio::test]
async fn reconnect_requests_session_resumption() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, eventloop) =
        MqttClient::tcp(config(addr, "t-reconnect"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    let first = match broker.read_packet().await {
        Packet::Connect(connect) => connect,
        other => panic!("expected CONNECT, got {:?}", other),
    };
    assert!(first.clean_session);
    broker.send(&accepted(false)).await;
    drop(broker);

    // Second CONNECT asks for resumption regardless of the configured flag
    let mut broker = accept(&listener).await;
    let second = match broker.read_packet().await {
        Packet::Connect(connect) => connect,
        other => panic!("expected CONNECT, got {:?}", other),
    };
    assert!(!second.clean_session);
    broker.send(&accepted(true)).await;

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn successive_subscribes_accumulate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, eventloop) = MqttClient::tcp(config(addr, "t-subs"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    let requests = [
        ("foo", QoS::AtMostOnce),
        ("bar", QoS::AtLeastOnce),
        ("baz", QoS::ExactlyOnce),
    ];
    for (i, (filter, qos)) in requests.iter().enumerate() {
        let token = client.subscribe(&[(*filter, *qos)]).await.unwrap();

        let subscribe = match broker.read_packet().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        assert_eq!(subscribe.packet_id, (i + 1) as u16);
        assert_eq!(subscribe.filters, vec![(filter.to_string(), *qos)]);

        broker
            .send(&Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                returns: vec![SubscribeReturn::Granted(*qos)],
            }))
            .await;

        let granted = token.wait_timeout(STEP).await.unwrap();
        assert_eq!(granted, vec![SubscribeReturn::Granted(*qos)]);
    }

    let subscriptions = client.subscriptions().await.unwrap();
    assert_eq!(
        subscriptions,
        vec![
            ("foo".to_string(), QoS::AtMostOnce),
            ("bar".to_string(), QoS::AtLeastOnce),
            ("baz".to_string(), QoS::ExactlyOnce),
        ]
    );

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn publish_in_place_of_connack_is_a_protocol_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (_client, eventloop) =
        MqttClient::tcp(config(addr, "t-violation"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker
        .send(&publish("rogue", b"data", QoS::AtMostOnce, None))
        .await;

    let err = engine.await.unwrap().unwrap_err();
    match err {
        ClientError::ProtocolViolation { expected, got } => {
            assert_eq!(expected, "CONNACK");
            assert_eq!(got, "PUBLISH");
        }
        other => panic!("expected protocol violation, got {:?}", other),
    }
}

#[tokio::test]
async fn server_reboot_resumes_session_and_replays_with_dup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, eventloop) = MqttClient::tcp(config(addr, "t-reboot"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    // A QoS 1 publish the broker never acknowledges
    let token = client
        .publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let outbound = match broker.read_packet().await {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    assert_eq!(outbound.packet_id, Some(1));
    assert!(!outbound.dup);

    // Server goes away: connection drops, further connects are refused
    drop(broker);
    drop(listener);
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Server comes back on the same port
    let listener = TcpListener::bind(addr).await.unwrap();
    let mut broker = accept(&listener).await;
    let connect = match broker.read_packet().await {
        Packet::Connect(connect) => connect,
        other => panic!("expected CONNECT, got {:?}", other),
    };
    assert!(!connect.clean_session);
    broker.send(&accepted(true)).await;

    // The unacked publish is re-emitted with DUP=1 and its original id
    let replayed = match broker.read_packet().await {
        Packet::Publish(publish) => publish,
        other => panic!("expected replayed PUBLISH, got {:?}", other),
    };
    assert_eq!(replayed.packet_id, Some(1));
    assert!(replayed.dup);
    assert_eq!(replayed.payload.as_ref(), b"21.5");

    broker.send(&Packet::Puback { packet_id: 1 }).await;
    token.wait_timeout(STEP).await.unwrap();

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn qos2_outbound_runs_the_full_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, eventloop) = MqttClient::tcp(config(addr, "t-qos2-out"), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    let token = client
        .publish("exact/once", "payload", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let outbound = match broker.read_packet().await {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    let packet_id = outbound.packet_id.unwrap();

    broker.send(&Packet::Pubrec { packet_id }).await;
    assert_eq!(broker.read_packet().await, Packet::Pubrel { packet_id });
    broker.send(&Packet::Pubcomp { packet_id }).await;

    token.wait_timeout(STEP).await.unwrap();

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

/// Records delivered messages on a std channel for assertions.
struct Recorder(std::sync::mpsc::Sender<Message>);

impl Handler for Recorder {
    fn on_message(&mut self, message: Message) {
        let _ = self.0.send(message);
    }
}

#[tokio::test]
async fn qos2_inbound_is_delivered_exactly_once_on_pubrel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (delivered_tx, delivered) = std::sync::mpsc::channel();
    let (client, eventloop) =
        MqttClient::tcp(config(addr, "t-qos2-in"), Recorder(delivered_tx)).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    broker
        .send(&publish("exact/in", b"once", QoS::ExactlyOnce, Some(5)))
        .await;
    assert_eq!(broker.read_packet().await, Packet::Pubrec { packet_id: 5 });

    // Broker retransmits the same publish before releasing it
    let duplicate = Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "exact/in".to_string(),
        packet_id: Some(5),
        payload: bytes::Bytes::from_static(b"once"),
    };
    broker.send(&Packet::Publish(duplicate)).await;
    assert_eq!(broker.read_packet().await, Packet::Pubrec { packet_id: 5 });

    // Nothing is delivered until the PUBREL
    assert!(delivered.try_recv().is_err());

    broker.send(&Packet::Pubrel { packet_id: 5 }).await;
    assert_eq!(broker.read_packet().await, Packet::Pubcomp { packet_id: 5 });

    let message = delivered.recv_timeout(STEP).unwrap();
    assert_eq!(message.topic, "exact/in");
    assert_eq!(message.payload.as_ref(), b"once");
    assert!(delivered.try_recv().is_err(), "delivered more than once");

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn keepalive_pings_and_publishes_rtt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut pings = events::bus().subscribe(Some("t-ping"), EventKind::PingResponse);
    let cfg = config(addr, "t-ping").keep_alive(1);
    let (client, eventloop) = MqttClient::tcp(cfg, NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = accept(&listener).await;
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    // Nothing else is written, so a PINGREQ arrives after ~1s
    assert!(matches!(broker.read_packet().await, Packet::Pingreq));
    broker.send(&Packet::Pingresp).await;

    let event = timeout(STEP, pings.recv()).await.unwrap().unwrap();
    match event {
        Event::PingResponse { client_id, rtt } => {
            assert_eq!(client_id, "t-ping");
            assert!(rtt < Duration::from_secs(1));
        }
        other => panic!("expected ping response event, got {:?}", other),
    }

    client.disconnect().await.unwrap();
    engine.await.unwrap().unwrap();
}

/// A scripted in-memory transport: hands out a pre-wired duplex stream
/// once, then refuses.
struct DuplexConnector(Mutex<Option<DuplexStream>>);

#[async_trait::async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<Connected, TransportError> {
        match self.0.lock().unwrap().take() {
            Some(stream) => Ok(Connected {
                stream: Box::new(stream),
                peer: "in-memory".to_string(),
            }),
            None => Err(TransportError::Refused),
        }
    }
}

#[tokio::test]
async fn injected_transport_speaks_the_same_protocol() {
    let (client_side, broker_side) = tokio::io::duplex(4096);
    let connector = DuplexConnector(Mutex::new(Some(client_side)));

    let cfg = config("127.0.0.1:1".parse().unwrap(), "t-duplex");
    let (client, eventloop) =
        MqttClient::with_connector(cfg, Box::new(connector), NoopHandler).unwrap();
    let engine = tokio::spawn(eventloop.run());

    let mut broker = Script::new(broker_side);
    assert!(matches!(broker.read_packet().await, Packet::Connect(_)));
    broker.send(&accepted(false)).await;

    let handle = client.connection(STEP).await.unwrap();
    assert_eq!(handle.peer(), "in-memory");

    client.disconnect().await.unwrap();
    assert!(matches!(broker.read_packet().await, Packet::Disconnect));
    engine.await.unwrap().unwrap();
}
