//! Handler-based example.
//!
//! Run with: cargo run -p mqlink-client --example callback
//!
//! All broker traffic is dispatched to an implementation of the `Handler`
//! trait; the configured subscriptions are re-established automatically on
//! every reconnect.

use std::time::Duration;

use mqlink_client::{
    ClientConfig, ConnectionStatus, Handler, Message, MqttClient, QoS, SubscriptionStatus,
};

struct PrintHandler;

impl Handler for PrintHandler {
    fn on_connection(&mut self, status: ConnectionStatus) {
        println!("Connection: {:?}", status);
    }

    fn on_message(&mut self, message: Message) {
        println!(
            "[{}] {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    }

    fn on_subscription(&mut self, filter: &str, status: SubscriptionStatus) {
        println!("Subscription {}: {:?}", filter, status);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ClientConfig::new("localhost:1883")
        .client_id("callback-example")
        .keep_alive(30)
        .subscriptions([
            ("example/sensors/#".to_string(), QoS::AtLeastOnce),
            ("example/commands/#".to_string(), QoS::ExactlyOnce),
        ]);

    let (client, eventloop) = MqttClient::tcp(config, PrintHandler)?;
    tokio::spawn(eventloop.run());

    // Produce some traffic for ourselves
    for i in 0..30 {
        client
            .publish(
                "example/sensors/temp",
                format!("{:.1}", 20.0 + (i as f64) / 10.0),
                QoS::AtMostOnce,
                false,
            )
            .await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await?;
    Ok(())
}
