use super::helper::{self, QUEUE};
use std::time::Duration;
use steadyq_client::{MemoryBroker, QueueClient, ReconnectPolicy};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn failed_attempts_back_off_exponentially() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(3);

    let client = helper::client(&broker);
    let start = Instant::now();
    let (_supervisor, mut generations) = helper::supervise(&client);

    let generation = generations.recv().await.unwrap();

    assert_eq!(generation.id(), 1);
    helper::assert_attempts_at(&broker.dial_attempts(), start, &[0, 1, 3, 7]);
    assert!(client.is_connected());
    assert!(generations.try_recv().is_err());

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn delay_stops_growing_at_the_maximum() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(7);

    let client = helper::client(&broker);
    let start = Instant::now();
    let (_supervisor, mut generations) = helper::supervise(&client);

    generations.recv().await.unwrap();

    helper::assert_attempts_at(&broker.dial_attempts(), start, &[0, 1, 3, 7, 15, 31, 47, 63]);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn custom_policy_is_used() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(4);

    let policy = ReconnectPolicy::default()
        .initial_delay(Duration::from_secs(2))
        .max_delay(Duration::from_secs(5));
    let client = QueueClient::with_policy(QUEUE, helper::URL, broker.clone(), policy);
    let start = Instant::now();
    let (_supervisor, mut generations) = helper::supervise(&client);

    generations.recv().await.unwrap();

    helper::assert_attempts_at(&broker.dial_attempts(), start, &[0, 2, 6, 11, 16]);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_starts_over_after_a_successful_connection() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);
    let (_supervisor, mut generations) = helper::supervise(&client);

    generations.recv().await.unwrap();

    // First outage, three attempts fail.
    let outage = Instant::now();
    let before = broker.dial_attempts().len();

    broker.set_reachable(false);
    assert_eq!(broker.drop_connections(), 1);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    broker.set_reachable(true);

    let second = generations.recv().await.unwrap();

    assert_eq!(second.id(), 2);
    helper::assert_attempts_at(&broker.dial_attempts()[before..], outage, &[0, 1, 3, 7]);

    // Second outage, the delays start from the initial one again.
    let outage = Instant::now();
    let before = broker.dial_attempts().len();

    broker.set_reachable(false);
    broker.drop_connections();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    broker.set_reachable(true);

    let third = generations.recv().await.unwrap();

    assert_eq!(third.id(), 3);
    helper::assert_attempts_at(&broker.dial_attempts()[before..], outage, &[0, 1, 3]);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn on_connect_is_called_once_per_connection() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);
    let (_supervisor, mut generations) = helper::supervise(&client);

    let first = generations.recv().await.unwrap();

    assert_eq!(client.generation(), Some(1));
    assert!(!first.is_retired());

    broker.drop_connections();

    let second = generations.recv().await.unwrap();

    assert_eq!(second.id(), 2);
    assert!(first.is_retired());
    assert!(!second.is_retired());
    assert_eq!(client.generation(), Some(2));

    broker.drop_connections();

    let third = generations.recv().await.unwrap();

    assert_eq!(third.id(), 3);
    assert!(second.is_retired());

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(generations.try_recv().is_err());
    assert_eq!(broker.dial_attempts().len(), 3);
    assert_eq!(broker.open_connections(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn one_close_means_one_reconnect() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);
    let (_supervisor, mut generations, mut messages, mut ended) = helper::supervise_with_consumer(&client);

    generations.recv().await.unwrap();

    for i in 0..5 {
        client.send_message(&format!("message {i}")).await.unwrap();
    }

    for i in 0..5 {
        assert_eq!(messages.recv().await.unwrap(), (1, format!("message {i}")));
    }

    broker.drop_connections();

    assert!(ended.recv().await.unwrap().is_ok());
    assert_eq!(generations.recv().await.unwrap().id(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(generations.try_recv().is_err());
    assert_eq!(broker.dial_attempts().len(), 2);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn consumer_of_a_lost_connection_stops() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);
    let (_supervisor, mut generations, mut messages, mut ended) = helper::supervise_with_consumer(&client);

    generations.recv().await.unwrap();
    client.send_message("before").await.unwrap();

    assert_eq!(messages.recv().await.unwrap(), (1, "before".to_owned()));

    broker.drop_connections();

    assert!(ended.recv().await.unwrap().is_ok());
    assert_eq!(generations.recv().await.unwrap().id(), 2);

    client.send_message("after").await.unwrap();

    assert_eq!(messages.recv().await.unwrap(), (2, "after".to_owned()));
    assert_eq!(broker.consumer_count(QUEUE), 1);

    client.close().await;

    assert!(ended.recv().await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn replaced_connection_is_taken_over() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);
    let (_supervisor, mut generations) = helper::supervise(&client);

    let first = generations.recv().await.unwrap();

    assert!(client.connect().await);

    let second = generations.recv().await.unwrap();

    assert_eq!(second.id(), 2);
    assert!(first.is_retired());
    assert_eq!(broker.dial_attempts().len(), 2);
    assert_eq!(broker.open_connections(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn wait_connected_returns_once_connected() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(2);

    let client = helper::client(&broker);
    let start = Instant::now();
    let (_supervisor, _generations) = helper::supervise(&client);

    client.wait_connected().await.unwrap();

    assert_eq!(start.elapsed().as_secs(), 3);
    assert_eq!(client.generation(), Some(1));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn zero_delay_policy_still_waits_between_attempts() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(3);

    let policy = ReconnectPolicy::default()
        .initial_delay(Duration::ZERO)
        .max_delay(Duration::ZERO);
    let client = QueueClient::with_policy(QUEUE, helper::URL, broker.clone(), policy);
    let start = Instant::now();
    let (_supervisor, mut generations) = helper::supervise(&client);

    generations.recv().await.unwrap();

    let attempts = broker.dial_attempts();

    assert_eq!(attempts.len(), 4);

    for pair in attempts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(1));
    }

    assert!(start.elapsed() < Duration::from_millis(50));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn direct_connect_during_backoff_is_taken_over() {
    let broker = MemoryBroker::new();

    broker.set_reachable(false);

    let client = helper::client(&broker);
    let start = Instant::now();
    let (_supervisor, mut generations) = helper::supervise(&client);

    // Attempts at 0 and 1 second fail, the next one would be at 3.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    broker.set_reachable(true);

    assert!(client.connect().await);

    let generation = generations.recv().await.unwrap();

    assert_eq!(generation.id(), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(client.generation(), Some(1));
    assert_eq!(broker.dial_attempts().len(), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(generations.try_recv().is_err());
    assert!(!generation.is_retired());
    assert_eq!(client.generation(), Some(1));
    assert_eq!(broker.dial_attempts().len(), 3);
    assert_eq!(broker.open_connections(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn connection_opened_before_the_loop_is_taken_over() {
    let broker = MemoryBroker::new();
    let client = helper::client(&broker);

    assert!(client.connect().await);

    let (_supervisor, mut generations) = helper::supervise(&client);

    assert_eq!(generations.recv().await.unwrap().id(), 1);
    assert_eq!(broker.dial_attempts().len(), 1);

    broker.drop_connections();

    assert_eq!(generations.recv().await.unwrap().id(), 2);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn each_failed_attempt_is_logged_once() {
    let broker = MemoryBroker::new();

    broker.fail_next_dials(2);
    helper::record_logs();

    let client = QueueClient::new("flaky", helper::URL, broker.clone());
    let (_supervisor, mut generations) = helper::supervise(&client);

    generations.recv().await.unwrap();

    let warnings: Vec<String> = helper::recorded_logs("[flaky]")
        .into_iter()
        .filter(|(level, _)| *level == log::Level::Warn)
        .map(|(_, line)| line)
        .collect();

    assert_eq!(warnings.len(), 2, "{warnings:?}");
    assert!(warnings[0].contains("Connection refused"));
    assert!(warnings[0].contains("Retrying in 1s"));
    assert!(warnings[1].contains("Retrying in 2s"));

    client.close().await;
}
