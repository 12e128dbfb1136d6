//! User-facing client handle.
//!
//! Split architecture: [`MqttClient`] (cloneable handle) + [`EventLoop`]
//! (owns the transport and all session state). Commands travel over a
//! channel and are serialized through the engine, so concurrent callers
//! never interleave on the wire.
//!
//! ```ignore
//! let config = ClientConfig::new("localhost:1883").client_id("sensor-1");
//! let (client, eventloop) = MqttClient::tcp(config, NoopHandler)?;
//! tokio::spawn(eventloop.run());
//!
//! let token = client.publish("sensors/temp", b"21.5", QoS::AtLeastOnce, false).await?;
//! token.wait().await?;
//! ```

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use mqlink_core::{QoS, SubscribeReturn};

use crate::config::{ClientConfig, TlsOptions};
use crate::error::{ClientError, Result};
use crate::eventloop::{EventLoop, WriteOp};
use crate::handler::Handler;
use crate::registry;
use crate::transport::{Connector, TcpConnector, TlsTransportConnector};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Commands sent from MqttClient handles to the EventLoop.
pub(crate) enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<Result<PublishToken>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        resp: oneshot::Sender<Result<SubscribeToken>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        resp: oneshot::Sender<Result<UnsubscribeToken>>,
    },
    Subscriptions {
        resp: oneshot::Sender<Vec<(String, QoS)>>,
    },
    Connection {
        resp: oneshot::Sender<ConnectionHandle>,
    },
    Disconnect {
        resp: oneshot::Sender<()>,
    },
}

/// Resolves when an outbound publish reaches its terminal acknowledgement
/// (PUBACK for QoS 1, PUBCOMP for QoS 2). QoS 0 tokens are born resolved.
#[derive(Debug)]
pub struct PublishToken {
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl PublishToken {
    pub(crate) fn resolved() -> Self {
        Self { rx: None }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Wait for the terminal acknowledgement.
    pub async fn wait(self) -> Result<()> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| ClientError::ConnectionClosed)?,
        }
    }

    /// Wait with a deadline. On timeout the caller gets
    /// [`ClientError::Timeout`], but the exchange itself is not cancelled:
    /// the tracker still completes it and reclaims the packet identifier.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Resolves with the granted-QoS list when the SUBACK arrives.
#[derive(Debug)]
pub struct SubscribeToken {
    rx: oneshot::Receiver<Result<Vec<SubscribeReturn>>>,
}

impl SubscribeToken {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Vec<SubscribeReturn>>>) -> Self {
        Self { rx }
    }

    /// Wait for the SUBACK. One return per requested filter, in order.
    pub async fn wait(self) -> Result<Vec<SubscribeReturn>> {
        self.rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Wait with a deadline; the exchange is not cancelled on timeout.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Vec<SubscribeReturn>> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Resolves when the UNSUBACK arrives.
#[derive(Debug)]
pub struct UnsubscribeToken {
    rx: oneshot::Receiver<Result<()>>,
}

impl UnsubscribeToken {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    /// Wait for the UNSUBACK.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Wait with a deadline; the exchange is not cancelled on timeout.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// Handle to a live connection, handed out by [`MqttClient::connection`]
/// and on the event bus.
///
/// The transport is owned by the engine's tasks, so the socket itself
/// cannot be lent out; instead the handle carries the peer description and
/// a raw-byte sender that goes through the connection's serialized writer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: String,
    raw_tx: mpsc::UnboundedSender<WriteOp>,
}

impl ConnectionHandle {
    pub(crate) fn new(peer: String, raw_tx: mpsc::UnboundedSender<WriteOp>) -> Self {
        Self { peer, raw_tx }
    }

    /// Endpoint description of the live connection, e.g. `127.0.0.1:1883`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Enqueue raw bytes on the connection's writer. The bytes must form
    /// complete MQTT packets; they are interleaved packet-wise, never
    /// byte-wise, with the engine's own traffic.
    pub fn send_raw(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.raw_tx
            .send(WriteOp::Data(bytes.into()))
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

/// Cloneable MQTT client handle.
#[derive(Clone)]
pub struct MqttClient {
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) client_id: String,
}

impl MqttClient {
    /// Create a client/engine pair using the given transport connector.
    ///
    /// The connection is registered under its client id; a second live
    /// connection with the same id in this process is refused. The engine
    /// does nothing until [`EventLoop::run`] is polled (usually via
    /// `tokio::spawn`).
    pub fn with_connector(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        handler: impl Handler,
    ) -> Result<(MqttClient, EventLoop)> {
        if config.client_id.is_empty() {
            return Err(ClientError::Protocol(
                mqlink_core::ProtocolError::MalformedPacket(
                    "Client id must not be empty".into(),
                ),
            ));
        }
        if config.client_id.len() > 23 {
            // Permitted, but strict v3.1.1 servers may reject it
            log::warn!(
                "client id {:?} exceeds 23 bytes; some brokers will reject it",
                config.client_id
            );
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        registry::register(&config.client_id, tx.clone())?;

        let client = MqttClient {
            tx,
            client_id: config.client_id.clone(),
        };
        let eventloop = EventLoop::new(config, connector, Box::new(handler), rx);
        Ok((client, eventloop))
    }

    /// Create a client/engine pair over plain TCP, connecting to
    /// `config.address`.
    pub fn tcp(config: ClientConfig, handler: impl Handler) -> Result<(MqttClient, EventLoop)> {
        let connector = TcpConnector::new(config.address.clone(), config.connect_timeout);
        Self::with_connector(config, Box::new(connector), handler)
    }

    /// Create a client/engine pair over TLS, connecting to
    /// `config.address`.
    pub fn tls(
        config: ClientConfig,
        options: TlsOptions,
        handler: impl Handler,
    ) -> Result<(MqttClient, EventLoop)> {
        let connector =
            TlsTransportConnector::new(config.address.clone(), config.connect_timeout, options)?;
        Self::with_connector(config, Box::new(connector), handler)
    }

    /// Create the pair and spawn the engine on the current runtime.
    /// A fatal exit reason is logged; use [`Self::with_connector`] and run
    /// the loop yourself to observe it.
    pub fn spawn(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        handler: impl Handler,
    ) -> Result<MqttClient> {
        let (client, eventloop) = Self::with_connector(config, connector, handler)?;
        let client_id = client.client_id.clone();
        tokio::spawn(async move {
            if let Err(e) = eventloop.run().await {
                log::error!("mqtt engine for {:?} exited: {}", client_id, e);
            }
        });
        Ok(client)
    }

    /// The client identifier this handle belongs to.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish a message.
    ///
    /// Returns once the engine has accepted the publish (inline errors:
    /// invalid topic, packet-id pool exhausted). The returned token
    /// resolves when the terminal ack arrives; for QoS 0 it is already
    /// resolved. Submitting while disconnected is allowed: the message is
    /// queued and goes out after the next connect.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishToken> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe to topic filters. The token resolves with one
    /// [`SubscribeReturn`] per filter when the SUBACK arrives.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<SubscribeToken> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            filters: filters
                .iter()
                .map(|(f, qos)| (f.to_string(), *qos))
                .collect(),
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Unsubscribe from topic filters.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<UnsubscribeToken> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            resp,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// The current granted subscription set, authoritative after SUBACK.
    pub async fn subscriptions(&self) -> Result<Vec<(String, QoS)>> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Subscriptions { resp }).await?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Wait up to `timeout` for a live connection and return its handle.
    ///
    /// Errors with [`ClientError::Timeout`] when the engine does not come
    /// up in time, or [`ClientError::UnknownConnection`] when it has
    /// already exited.
    pub async fn connection(&self, timeout: Duration) -> Result<ConnectionHandle> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Connection { resp })
            .await
            .map_err(|_| ClientError::UnknownConnection)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(_)) => Err(ClientError::UnknownConnection),
            Ok(Ok(handle)) => Ok(handle),
        }
    }

    /// Gracefully disconnect: DISCONNECT packet, transport shutdown,
    /// engine exit. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(Command::Disconnect { resp }).await.is_err() {
            // Engine already gone
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
