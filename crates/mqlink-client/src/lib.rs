//! mqlink-client - Reconnecting MQTT 3.1.1 client session engine.
//!
//! A long-lived client: it connects, keeps the connection alive, reconnects
//! with exponential backoff, and maintains QoS 1/2 delivery state across
//! reconnects within the process. Broker-originated messages are dispatched
//! to a user-supplied [`Handler`]; lifecycle changes are also published on a
//! process-wide [event bus](events).
//!
//! ```ignore
//! use mqlink_client::{ClientConfig, MqttClient, NoopHandler, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("localhost:1883").client_id("sensor-1");
//!     let (client, eventloop) = MqttClient::tcp(config, NoopHandler)?;
//!     tokio::spawn(eventloop.run());
//!
//!     client.subscribe(&[("commands/#", QoS::AtLeastOnce)]).await?.wait().await?;
//!     let token = client.publish("status", "online", QoS::AtLeastOnce, true).await?;
//!     token.wait().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod eventloop;
pub mod events;
mod handler;
mod packet_id;
mod registry;
mod session;
pub mod transport;

pub use client::{
    ConnectionHandle, MqttClient, PublishToken, SubscribeToken, UnsubscribeToken,
};
pub use config::{BackoffConfig, ClientConfig, TlsOptions};
pub use error::{ClientError, Result, TransportError};
pub use eventloop::EventLoop;
pub use handler::{ConnectionStatus, Handler, Message, NoopHandler, SubscriptionStatus};
pub use registry::{client as client_for, connection as connection_for};

// Re-export useful types from core
pub use mqlink_core::{ConnackCode, QoS, SubscribeReturn, Will};
