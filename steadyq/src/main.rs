mod config;

use anyhow::Result;
use config::Command;
use log::{error, info, warn};
use steadyq_client::{setup_logger, AmqpConnector, DeliveredMessage, Generation, QueueClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;

type Client = QueueClient<AmqpConnector>;

/// Runs the keep alive loop until the client is shut down.
fn supervise<F>(client: &Client, on_connect: F) -> JoinHandle<()>
where
    F: FnMut(Generation) + Send + 'static,
{
    let supervisor = client.clone();

    tokio::spawn(async move { supervisor.connect_and_keep_alive(on_connect).await })
}

async fn read_stdin_lines() -> Result<Vec<String>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut messages = vec![];

    while let Some(line) = lines.next_line().await? {
        messages.push(line);
    }

    Ok(messages)
}

async fn publish(client: Client, messages: Vec<String>) -> Result<()> {
    let messages = if messages.is_empty() {
        read_stdin_lines().await?
    } else {
        messages
    };

    let supervisor = supervise(&client, |_| {});
    let retry_delay = client.reconnect_policy().initial_delay;

    for message in &messages {
        loop {
            client.wait_connected().await?;

            match client.send_message(message).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Failed to publish, retrying in {:?}: {:#}", retry_delay, e);

                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    info!("Published {} message(s) to {}", messages.len(), client.name());

    client.close().await;
    supervisor.await?;

    Ok(())
}

async fn consume(client: Client) -> Result<()> {
    let consumer = client.clone();

    let supervisor = supervise(&client, move |generation: Generation| {
        let consumer = consumer.clone();

        tokio::spawn(async move {
            let result = consumer
                .consume_messages(|m: DeliveredMessage| println!("{}", m.text()))
                .await;

            if let Err(e) = result {
                error!("Consumer of generation {} stopped: {:#}", generation.id(), e);
            }
        });
    });

    supervisor.await?;

    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_logger();

    let cli = config::cli();
    let config = config::load(&cli)?;

    let client = QueueClient::with_policy(
        &config.broker.queue,
        &config.broker.url,
        AmqpConnector::new(),
        config.reconnect_policy(),
    );

    let interrupted = client.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");

            interrupted.shutdown();
        }
    });

    match cli.command {
        Command::Publish { messages } => publish(client, messages).await,
        Command::Consume => consume(client).await,
    }
}
