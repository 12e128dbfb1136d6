//! Token-based API example.
//!
//! Run with: cargo run -p mqlink-client --example telemetry
//!
//! Publishes a reading every second and waits for each acknowledgement.
//! Kill and restart your broker while this runs: unacknowledged readings
//! are replayed with DUP=1 once the connection is back.

use std::time::Duration;

use mqlink_client::{ClientConfig, MqttClient, NoopHandler, QoS};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ClientConfig::new("localhost:1883")
        .client_id("telemetry-example")
        .keep_alive(30);

    let (client, eventloop) = MqttClient::tcp(config, NoopHandler)?;
    tokio::spawn(eventloop.run());

    let connection = client.connection(Duration::from_secs(10)).await?;
    println!("Connected to {}", connection.peer());

    let granted = client
        .subscribe(&[("example/echo/#", QoS::AtLeastOnce)])
        .await?
        .wait()
        .await?;
    println!("Subscribed, granted: {:?}", granted);

    for i in 0..10 {
        let token = client
            .publish(
                "example/telemetry/reading",
                format!("reading {}", i),
                QoS::AtLeastOnce,
                false,
            )
            .await?;
        token.wait_timeout(Duration::from_secs(30)).await?;
        println!("Published reading {}", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await?;
    Ok(())
}
