//! Broker outages against the in-process broker. Run with `RUST_LOG=info` to see the
//! reconnection attempts.

use anyhow::Result;
use log::info;
use std::time::Duration;
use steadyq_client::{DeliveredMessage, MemoryBroker, QueueClient, ReconnectPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    steadyq_client::setup_logger();

    let broker = MemoryBroker::new();
    let policy = ReconnectPolicy::default()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_millis(800));
    let client = QueueClient::with_policy("demo", "amqp://localhost:5672", broker.clone(), policy);

    let supervisor = client.clone();
    let consumer = client.clone();

    let keep_alive = tokio::spawn(async move {
        supervisor
            .connect_and_keep_alive(move |generation| {
                let consumer = consumer.clone();
                let id = generation.id();

                tokio::spawn(async move {
                    consumer
                        .consume_messages(move |m: DeliveredMessage| info!("Generation {} got {}", id, m.text()))
                        .await
                });
            })
            .await
    });

    for round in 1..=3 {
        client.wait_connected().await?;

        for i in 1..=3 {
            client.send_message(&format!("round {round} message {i}")).await?;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        info!("Broker goes away");

        broker.set_reachable(false);
        broker.drop_connections();

        tokio::time::sleep(Duration::from_secs(1)).await;

        info!("Broker is back");

        broker.set_reachable(true);
    }

    client.wait_connected().await?;
    client.close().await;
    keep_alive.await?;

    info!("{} connection attempts", broker.dial_attempts().len());

    Ok(())
}
