//! The connection engine: state machine, keep-alive, reconnection.
//!
//! Two tasks per connection: a reader that owns the transport's read half
//! and frames packets in wire order, and a writer that serializes all
//! outbound bytes. The engine itself runs the connection state machine
//!
//! ```text
//! initial -> connecting -> awaiting_connack -> connected
//!                ^                |  |            |
//!                '---- backoff <--'  '-- refused (terminal)
//!                                     graceful disconnect -> shutdown
//! ```
//!
//! and is the single owner of session state, so every state transition is
//! serialized through its select loop.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mqlink_core::{
    decode_packet, encode_packet, validate_topic_filter, validate_topic_name, Connack,
    ConnackCode, Connect, Packet, ProtocolError, Publish, QoS, Subscribe, SubscribeReturn,
    Unsubscribe,
};

use crate::client::{
    Command, ConnectionHandle, PublishToken, SubscribeToken, UnsubscribeToken,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result, TransportError};
use crate::events::{self, Event};
use crate::handler::{ConnectionStatus, Handler, Message, SubscriptionStatus};
use crate::packet_id::PacketIdPool;
use crate::registry;
use crate::session::{PubcompOutcome, Session};
use crate::transport::{Connector, TransportStream};

const READ_BUFFER_SIZE: usize = 8192;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// What the reader task forwards to the engine.
enum ReaderEvent {
    /// A complete packet, in wire order.
    Packet(Packet),
    /// The inbound byte stream is malformed; fatal.
    Error(ProtocolError),
    /// The socket closed or failed; drives the reconnect loop.
    Closed(TransportError),
}

/// Outbound writer operations.
#[derive(Debug)]
pub(crate) enum WriteOp {
    Data(Bytes),
    /// Flush and shut the transport down, then exit.
    Shutdown,
}

/// Owns the read half: buffers partial reads, frames complete packets,
/// never forwards a partial one.
async fn reader_task(
    mut read_half: ReadHalf<Box<dyn TransportStream>>,
    tx: mpsc::UnboundedSender<ReaderEvent>,
    max_packet_size: usize,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match decode_packet(&buf, max_packet_size) {
                Ok(Some((packet, consumed))) => {
                    let _ = buf.split_to(consumed);
                    if tx.send(ReaderEvent::Packet(packet)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(ReaderEvent::Error(e));
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ReaderEvent::Closed(TransportError::Closed));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(ReaderEvent::Closed(TransportError::from_io(&e)));
                return;
            }
        }
    }
}

/// Owns the write half: the send gate all outbound bytes pass through.
async fn writer_task(
    mut write_half: WriteHalf<Box<dyn TransportStream>>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    return;
                }
                if write_half.flush().await.is_err() {
                    return;
                }
            }
            WriteOp::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

struct PingState {
    sent_at: Instant,
    deadline: Instant,
}

/// A live connection: channels to its reader/writer tasks plus keep-alive
/// bookkeeping.
struct Active {
    reader_rx: mpsc::UnboundedReceiver<ReaderEvent>,
    writer_tx: mpsc::UnboundedSender<WriteOp>,
    reader_handle: JoinHandle<()>,
    writer_handle: Option<JoinHandle<()>>,
    peer: String,
    last_write: Instant,
    ping: Option<PingState>,
}

impl Active {
    fn send_packet(&mut self, packet: &Packet) -> bool {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf);
        self.last_write = Instant::now();
        self.writer_tx.send(WriteOp::Data(Bytes::from(buf))).is_ok()
    }

    fn abort(&mut self) {
        self.reader_handle.abort();
        if let Some(writer) = self.writer_handle.take() {
            writer.abort();
        }
    }
}

struct PendingSubscribe {
    filters: Vec<(String, QoS)>,
    resp: Option<oneshot::Sender<Result<Vec<SubscribeReturn>>>>,
}

struct PendingUnsubscribe {
    topics: Vec<String>,
    resp: Option<oneshot::Sender<Result<()>>>,
}

enum Flow {
    /// Connection lost; go through backoff and reconnect.
    Reconnect,
    /// Graceful shutdown requested; the engine exits cleanly.
    Shutdown,
}

enum EstablishError {
    Fatal(ClientError),
    Transient(ClientError),
}

/// The engine driving one client's connection.
///
/// Created by [`crate::MqttClient::with_connector`]; does nothing until
/// [`run`](Self::run) is polled, usually via `tokio::spawn`.
pub struct EventLoop {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    handler: Box<dyn Handler>,
    commands: mpsc::Receiver<Command>,
    session: Session,
    id_pool: PacketIdPool,
    pending_publishes: HashMap<u16, oneshot::Sender<Result<()>>>,
    pending_subscribes: HashMap<u16, PendingSubscribe>,
    pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,
    connection_waiters: Vec<oneshot::Sender<ConnectionHandle>>,
    current_handle: Option<ConnectionHandle>,
    /// Consecutive failed connect attempts, drives the backoff schedule.
    failures: u32,
    /// True until the first accepted CONNACK.
    first_connect: bool,
}

impl EventLoop {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        handler: Box<dyn Handler>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            config,
            connector,
            handler,
            commands,
            session: Session::new(),
            id_pool: PacketIdPool::new(),
            pending_publishes: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            connection_waiters: Vec::new(),
            current_handle: None,
            failures: 0,
            first_connect: true,
        }
    }

    /// Drive the connection until a graceful disconnect (`Ok`) or a fatal
    /// error: a CONNACK refusal, a protocol violation, or a TLS
    /// certificate-trust failure. Transient transport errors never end the
    /// loop; they drive reconnection with backoff.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_inner().await;
        registry::deregister(&self.config.client_id);
        self.fail_all_pending();
        match &result {
            Ok(()) => self.handler.on_terminate(None),
            Err(e) => self.handler.on_terminate(Some(e)),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        if !self.config.first_connect_delay.is_zero() {
            if let Flow::Shutdown = self.wait_offline(self.config.first_connect_delay).await {
                return Ok(());
            }
        }

        loop {
            match self.establish().await {
                Ok(mut active) => {
                    self.failures = 0;
                    let flow = self.run_connected(&mut active).await;
                    active.abort();
                    match flow? {
                        Flow::Reconnect => {}
                        Flow::Shutdown => return Ok(()),
                    }
                }
                Err(EstablishError::Fatal(e)) => return Err(e),
                Err(EstablishError::Transient(e)) => {
                    log::warn!(
                        "client {:?}: connect attempt failed: {}",
                        self.config.client_id,
                        e
                    );
                }
            }

            let delay = self.config.backoff.delay(self.failures);
            self.failures = self.failures.saturating_add(1);
            log::debug!(
                "client {:?}: reconnecting in {:?}",
                self.config.client_id,
                delay
            );
            if let Flow::Shutdown = self.wait_offline(delay).await {
                return Ok(());
            }
        }
    }

    /// Transport connect, CONNECT, CONNACK: the `connecting` and
    /// `awaiting_connack` states.
    async fn establish(&mut self) -> std::result::Result<Active, EstablishError> {
        let clean_session = if self.first_connect {
            self.config.clean_session
        } else {
            self.config.always_clean_session
        };

        // A clean reconnect discards all session state before CONNECT
        if clean_session && !self.first_connect {
            self.session.clear();
            self.id_pool.reset();
            self.fail_all_pending();
        }

        let connected = self.connector.connect().await.map_err(|e| {
            if e.is_fatal() {
                EstablishError::Fatal(e.into())
            } else {
                EstablishError::Transient(e.into())
            }
        })?;

        let (read_half, write_half) = tokio::io::split(connected.stream);
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let mut active = Active {
            reader_rx,
            writer_tx,
            reader_handle: tokio::spawn(reader_task(
                read_half,
                reader_tx,
                self.config.max_packet_size,
            )),
            writer_handle: Some(tokio::spawn(writer_task(write_half, writer_rx))),
            peer: connected.peer,
            last_write: Instant::now(),
            ping: None,
        };

        let connect = Connect {
            clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: self.config.will.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        active.send_packet(&Packet::Connect(connect));

        let connack = match self.await_connack(&mut active).await {
            Ok(connack) => connack,
            Err(e) => {
                active.abort();
                return Err(e);
            }
        };

        if connack.code != ConnackCode::Accepted {
            active.abort();
            return Err(EstablishError::Fatal(ClientError::Refused(connack.code)));
        }
        if clean_session && connack.session_present {
            active.abort();
            return Err(EstablishError::Fatal(ClientError::ProtocolViolation {
                expected: "session_present=0 after clean session connect",
                got: "session_present=1",
            }));
        }

        log::debug!(
            "client {:?}: connected to {} (session_present={})",
            self.config.client_id,
            active.peer,
            connack.session_present
        );
        self.first_connect = false;
        self.on_connected(&mut active);
        Ok(active)
    }

    async fn await_connack(
        &mut self,
        active: &mut Active,
    ) -> std::result::Result<Connack, EstablishError> {
        let event =
            match tokio::time::timeout(self.config.connack_timeout, active.reader_rx.recv()).await
            {
                Err(_) => return Err(EstablishError::Transient(ClientError::Timeout)),
                Ok(event) => event,
            };

        match event {
            None => Err(EstablishError::Transient(TransportError::Closed.into())),
            Some(ReaderEvent::Closed(e)) => Err(EstablishError::Transient(e.into())),
            Some(ReaderEvent::Error(e)) => Err(EstablishError::Fatal(e.into())),
            Some(ReaderEvent::Packet(Packet::Connack(connack))) => Ok(connack),
            Some(ReaderEvent::Packet(other)) => Err(EstablishError::Fatal(
                ClientError::violation("CONNACK", other.packet_type()),
            )),
        }
    }

    /// Entering `connected`: events, waiters, replay, resubscription.
    fn on_connected(&mut self, active: &mut Active) {
        let handle = ConnectionHandle::new(active.peer.clone(), active.writer_tx.clone());
        self.current_handle = Some(handle.clone());
        for waiter in self.connection_waiters.drain(..) {
            let _ = waiter.send(handle.clone());
        }

        let client_id = self.config.client_id.clone();
        events::bus().publish(Event::Status {
            client_id: client_id.clone(),
            status: ConnectionStatus::Up,
        });
        events::bus().publish(Event::Connection { client_id, handle });
        self.handler.on_connection(ConnectionStatus::Up);

        // Configured subscriptions go out right after the CONNACK
        if !self.config.subscriptions.is_empty() {
            let filters = self.config.subscriptions.clone();
            if let Err(e) = self.send_subscribe(filters, None, Some(&mut *active)) {
                log::error!(
                    "client {:?}: configured subscribe failed: {}",
                    self.config.client_id,
                    e
                );
            }
        }

        // Replay in-flight QoS 1/2 publishes in original submission order
        for packet in self.session.replay() {
            active.send_packet(&packet);
        }

        // Re-send subscription exchanges that never got their ack
        for (packet_id, pending) in &self.pending_subscribes {
            active.send_packet(&Packet::Subscribe(Subscribe {
                packet_id: *packet_id,
                filters: pending.filters.clone(),
            }));
        }
        for (packet_id, pending) in &self.pending_unsubscribes {
            active.send_packet(&Packet::Unsubscribe(Unsubscribe {
                packet_id: *packet_id,
                topics: pending.topics.clone(),
            }));
        }

        // QoS 0 publishes accepted while disconnected
        for publish in self.session.drain_qos0() {
            active.send_packet(&Packet::Publish(publish));
        }
    }

    /// The `connected` state: serve commands, route inbound packets, keep
    /// the connection alive.
    async fn run_connected(&mut self, active: &mut Active) -> Result<Flow> {
        enum Step {
            Command(Option<Command>),
            Reader(Option<ReaderEvent>),
            PingDeadline,
        }

        loop {
            let keep_alive_enabled = self.config.keep_alive > 0;
            let keep_alive = Duration::from_secs(self.config.keep_alive as u64);
            let deadline = match &active.ping {
                Some(ping) => ping.deadline,
                None => active.last_write + keep_alive,
            };

            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                event = active.reader_rx.recv() => Step::Reader(event),
                _ = tokio::time::sleep_until(deadline), if keep_alive_enabled => Step::PingDeadline,
            };

            match step {
                Step::Command(None) => {
                    // Every client handle is gone: shut down gracefully
                    self.graceful_shutdown(active).await;
                    return Ok(Flow::Shutdown);
                }
                Step::Command(Some(Command::Disconnect { resp })) => {
                    self.graceful_shutdown(active).await;
                    let _ = resp.send(());
                    return Ok(Flow::Shutdown);
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd, Some(&mut *active)),
                Step::Reader(None) => {
                    self.note_down();
                    return Ok(Flow::Reconnect);
                }
                Step::Reader(Some(ReaderEvent::Closed(e))) => {
                    log::warn!(
                        "client {:?}: connection lost: {}",
                        self.config.client_id,
                        e
                    );
                    self.note_down();
                    return Ok(Flow::Reconnect);
                }
                Step::Reader(Some(ReaderEvent::Error(e))) => {
                    self.note_down();
                    return Err(e.into());
                }
                Step::Reader(Some(ReaderEvent::Packet(packet))) => {
                    if let Err(e) = self.handle_packet(packet, active) {
                        self.note_down();
                        return Err(e);
                    }
                }
                Step::PingDeadline => {
                    if active.ping.is_some() {
                        log::warn!(
                            "client {:?}: no PINGRESP within keep-alive window",
                            self.config.client_id
                        );
                        self.note_down();
                        return Ok(Flow::Reconnect);
                    }
                    if active.last_write.elapsed() >= keep_alive {
                        active.send_packet(&Packet::Pingreq);
                        let now = Instant::now();
                        active.ping = Some(PingState {
                            sent_at: now,
                            deadline: now + keep_alive,
                        });
                    }
                    // Otherwise something was written since the timer was
                    // armed; the next loop iteration re-arms it.
                }
            }
        }
    }

    /// Serve one user command. `active` is `None` while disconnected:
    /// operations are then suspended, not rejected.
    fn handle_command(&mut self, cmd: Command, active: Option<&mut Active>) {
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => {
                let result = self.do_publish(topic, payload, qos, retain, active);
                let _ = resp.send(result);
            }
            Command::Subscribe { filters, resp } => {
                let (tx, rx) = oneshot::channel();
                match self.send_subscribe(filters, Some(tx), active) {
                    Ok(()) => {
                        let _ = resp.send(Ok(SubscribeToken::new(rx)));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::Unsubscribe { topics, resp } => {
                let (tx, rx) = oneshot::channel();
                match self.send_unsubscribe(topics, Some(tx), active) {
                    Ok(()) => {
                        let _ = resp.send(Ok(UnsubscribeToken::new(rx)));
                    }
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::Subscriptions { resp } => {
                let _ = resp.send(self.session.subscriptions().to_vec());
            }
            Command::Connection { resp } => match &self.current_handle {
                Some(handle) => {
                    let _ = resp.send(handle.clone());
                }
                None => self.connection_waiters.push(resp),
            },
            Command::Disconnect { resp } => {
                // Intercepted by the state loops before reaching here
                let _ = resp.send(());
            }
        }
    }

    fn do_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        active: Option<&mut Active>,
    ) -> Result<PublishToken> {
        validate_topic_name(&topic)?;

        if qos == QoS::AtMostOnce {
            let publish = Publish {
                dup: false,
                qos,
                retain,
                topic,
                packet_id: None,
                payload,
            };
            match active {
                Some(active) => {
                    active.send_packet(&Packet::Publish(publish));
                }
                None => self.session.queue_qos0(publish),
            }
            return Ok(PublishToken::resolved());
        }

        let packet_id = self.id_pool.take()?;
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: Some(packet_id),
            payload,
        };
        self.session.push_outbound(packet_id, publish.clone());

        let (tx, rx) = oneshot::channel();
        self.pending_publishes.insert(packet_id, tx);

        if let Some(active) = active {
            active.send_packet(&Packet::Publish(publish));
            self.session.mark_sent(packet_id);
        }
        Ok(PublishToken::pending(rx))
    }

    fn send_subscribe(
        &mut self,
        filters: Vec<(String, QoS)>,
        resp: Option<oneshot::Sender<Result<Vec<SubscribeReturn>>>>,
        active: Option<&mut Active>,
    ) -> Result<()> {
        if filters.is_empty() {
            return Err(ProtocolError::InvalidSubscriptionPayload("empty filter list".into()).into());
        }
        for (filter, _) in &filters {
            validate_topic_filter(filter)?;
        }

        let packet_id = self.id_pool.take()?;

        if let Some(active) = active {
            active.send_packet(&Packet::Subscribe(Subscribe {
                packet_id,
                filters: filters.clone(),
            }));
        }
        self.pending_subscribes
            .insert(packet_id, PendingSubscribe { filters, resp });
        Ok(())
    }

    fn send_unsubscribe(
        &mut self,
        topics: Vec<String>,
        resp: Option<oneshot::Sender<Result<()>>>,
        active: Option<&mut Active>,
    ) -> Result<()> {
        if topics.is_empty() {
            return Err(ProtocolError::InvalidUnsubscriptionPayload.into());
        }
        for topic in &topics {
            validate_topic_filter(topic)?;
        }

        let packet_id = self.id_pool.take()?;

        if let Some(active) = active {
            active.send_packet(&Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topics: topics.clone(),
            }));
        }
        self.pending_unsubscribes
            .insert(packet_id, PendingUnsubscribe { topics, resp });
        Ok(())
    }

    /// Route one inbound packet. Errors are protocol violations and fatal.
    fn handle_packet(&mut self, packet: Packet, active: &mut Active) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.handle_inbound_publish(publish, active),
            Packet::Puback { packet_id } => {
                if self.session.complete_qos1(packet_id).is_some() {
                    self.id_pool.release(packet_id);
                    self.resolve_publish(packet_id);
                } else {
                    log::warn!(
                        "client {:?}: PUBACK for unknown packet id {}",
                        self.config.client_id,
                        packet_id
                    );
                }
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                if self.session.apply_pubrec(packet_id) {
                    active.send_packet(&Packet::Pubrel { packet_id });
                } else {
                    log::warn!(
                        "client {:?}: PUBREC for unknown packet id {}",
                        self.config.client_id,
                        packet_id
                    );
                }
                Ok(())
            }
            Packet::Pubrel { packet_id } => {
                let released = self.session.release_inbound(packet_id);
                active.send_packet(&Packet::Pubcomp { packet_id });
                // Exactly-once: the held message is delivered only now
                if let Some(publish) = released {
                    self.deliver(publish);
                }
                Ok(())
            }
            Packet::Pubcomp { packet_id } => match self.session.apply_pubcomp(packet_id) {
                PubcompOutcome::Completed => {
                    self.id_pool.release(packet_id);
                    self.resolve_publish(packet_id);
                    Ok(())
                }
                PubcompOutcome::NotPreceded => Err(ClientError::ProtocolViolation {
                    expected: "PUBREC before PUBCOMP",
                    got: "PUBCOMP",
                }),
            },
            Packet::Suback(suback) => self.handle_suback(suback),
            Packet::Unsuback { packet_id } => {
                if let Some(pending) = self.pending_unsubscribes.remove(&packet_id) {
                    self.id_pool.release(packet_id);
                    for topic in &pending.topics {
                        self.session.remove_subscription(topic);
                        self.handler
                            .on_subscription(topic, SubscriptionStatus::Removed);
                    }
                    if let Some(resp) = pending.resp {
                        let _ = resp.send(Ok(()));
                    }
                } else {
                    log::warn!(
                        "client {:?}: UNSUBACK for unknown packet id {}",
                        self.config.client_id,
                        packet_id
                    );
                }
                Ok(())
            }
            Packet::Pingresp => {
                if let Some(ping) = active.ping.take() {
                    let rtt = ping.sent_at.elapsed();
                    events::bus().publish(Event::PingResponse {
                        client_id: self.config.client_id.clone(),
                        rtt,
                    });
                }
                Ok(())
            }
            other => Err(ClientError::violation(
                "publish or acknowledgement",
                other.packet_type(),
            )),
        }
    }

    fn handle_inbound_publish(&mut self, publish: Publish, active: &mut Active) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ProtocolError::MalformedPacket(
                        "QoS 1 PUBLISH without packet id".into(),
                    )
                    .into());
                };
                // Deliver before acking, so a handler failure prevents the
                // PUBACK and the broker redelivers
                self.deliver(publish);
                active.send_packet(&Packet::Puback { packet_id });
                Ok(())
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ProtocolError::MalformedPacket(
                        "QoS 2 PUBLISH without packet id".into(),
                    )
                    .into());
                };
                // Held until PUBREL; a duplicate id is not redelivered
                self.session.hold_inbound(packet_id, publish);
                active.send_packet(&Packet::Pubrec { packet_id });
                Ok(())
            }
        }
    }

    fn handle_suback(&mut self, suback: mqlink_core::Suback) -> Result<()> {
        let Some(pending) = self.pending_subscribes.remove(&suback.packet_id) else {
            log::warn!(
                "client {:?}: SUBACK for unknown packet id {}",
                self.config.client_id,
                suback.packet_id
            );
            return Ok(());
        };
        self.id_pool.release(suback.packet_id);

        if suback.returns.len() != pending.filters.len() {
            return Err(ClientError::ProtocolViolation {
                expected: "one SUBACK return code per filter",
                got: "SUBACK",
            });
        }

        for ((filter, _), ret) in pending.filters.iter().zip(&suback.returns) {
            match ret {
                SubscribeReturn::Granted(qos) => {
                    self.session.add_subscription(filter.clone(), *qos);
                    self.handler
                        .on_subscription(filter, SubscriptionStatus::Granted(*qos));
                }
                SubscribeReturn::Failure => {
                    self.handler
                        .on_subscription(filter, SubscriptionStatus::Refused);
                }
            }
        }

        if let Some(resp) = pending.resp {
            let _ = resp.send(Ok(suback.returns));
        }
        Ok(())
    }

    fn deliver(&mut self, publish: Publish) {
        self.handler.on_message(Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        });
    }

    fn resolve_publish(&mut self, packet_id: u16) {
        if let Some(resp) = self.pending_publishes.remove(&packet_id) {
            let _ = resp.send(Ok(()));
        }
    }

    /// The connection went down: events, handler hook, handle invalidation.
    fn note_down(&mut self) {
        self.current_handle = None;
        events::bus().publish(Event::Status {
            client_id: self.config.client_id.clone(),
            status: ConnectionStatus::Down,
        });
        self.handler.on_connection(ConnectionStatus::Down);
    }

    /// User-initiated disconnect: DISCONNECT packet, drain the writer,
    /// close the transport.
    async fn graceful_shutdown(&mut self, active: &mut Active) {
        active.send_packet(&Packet::Disconnect);
        let _ = active.writer_tx.send(WriteOp::Shutdown);
        if let Some(writer) = active.writer_handle.take() {
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
        }
        self.note_down();
        log::debug!("client {:?}: disconnected", self.config.client_id);
    }

    /// Serve commands while waiting out a backoff (or first-connect) delay.
    async fn wait_offline(&mut self, delay: Duration) -> Flow {
        let deadline = Instant::now() + delay;
        loop {
            let step = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => None,
                cmd = self.commands.recv() => Some(cmd),
            };
            match step {
                None => return Flow::Reconnect,
                Some(None) => return Flow::Shutdown,
                Some(Some(Command::Disconnect { resp })) => {
                    let _ = resp.send(());
                    return Flow::Shutdown;
                }
                Some(Some(cmd)) => self.handle_command(cmd, None),
            }
        }
    }

    /// Resolve every suspended acknowledgement waiter with a terminal
    /// error. Connection waiters are left alone: on a clean reconnect they
    /// are still waiting for the next connection, and on engine exit they
    /// resolve to `UnknownConnection` when their senders drop.
    fn fail_all_pending(&mut self) {
        for (_, resp) in self.pending_publishes.drain() {
            let _ = resp.send(Err(ClientError::ConnectionClosed));
        }
        for (_, pending) in self.pending_subscribes.drain() {
            if let Some(resp) = pending.resp {
                let _ = resp.send(Err(ClientError::ConnectionClosed));
            }
        }
        for (_, pending) in self.pending_unsubscribes.drain() {
            if let Some(resp) = pending.resp {
                let _ = resp.send(Err(ClientError::ConnectionClosed));
            }
        }
    }
}
