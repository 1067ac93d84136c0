//! Integration tests for peek-lock settlement
//!
//! These tests verify:
//! - Exactly one of several concurrent settlements succeeds
//! - Abandoned and expired messages are redelivered
//! - Messages past the delivery limit are dead-lettered

mod common;

use common::{connect, QUEUE};
use servicebus_client::{ClientError, EntityName, EntityRef, InMemoryBrokerConfig};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn queue() -> EntityRef {
    EntityRef::Queue(EntityName::new(QUEUE).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_complete_and_abandon_settle_once() {
    let broker = common::broker();
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = Arc::new(connection.create_queue_receiver(QUEUE).await.unwrap());

    sender.send("contended").await.unwrap();
    let message = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();

    let complete = {
        let receiver = receiver.clone();
        let token = message.lock_token.clone();
        tokio::spawn(async move { receiver.complete(&token).await })
    };
    let abandon = {
        let receiver = receiver.clone();
        let token = message.lock_token.clone();
        tokio::spawn(async move { receiver.abandon(&token).await })
    };

    let results = [complete.await.unwrap(), abandon.await.unwrap()];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ClientError::LockLost { .. }))));
    assert_eq!(receiver.held_locks(), 0);
}

#[tokio::test]
async fn test_abandoned_message_is_redelivered() {
    let broker = common::broker();
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = connection.create_queue_receiver(QUEUE).await.unwrap();

    sender.send("retry me").await.unwrap();
    let first = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();
    receiver.abandon(&first.lock_token).await.unwrap();

    let second = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();

    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert_ne!(second.lock_token, first.lock_token);
    assert!(matches!(
        receiver.complete(&first.lock_token).await,
        Err(ClientError::LockLost { .. })
    ));
    receiver.complete(&second.lock_token).await.unwrap();
    assert_eq!(broker.active_message_count(&queue()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_redelivers_and_rejects_stale_token() {
    let broker = common::broker_with(InMemoryBrokerConfig {
        lock_duration: Duration::from_secs(1),
        ..InMemoryBrokerConfig::default()
    });
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = connection.create_queue_receiver(QUEUE).await.unwrap();

    sender.send("slow consumer").await.unwrap();
    let first = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();

    // Blocks until the lock lapses and the broker makes the message available again
    let second = receiver
        .get_message(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("message should be redelivered");

    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert!(matches!(
        receiver.complete(&first.lock_token).await,
        Err(ClientError::LockLost { .. })
    ));
    receiver.complete(&second.lock_token).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_batch_receive_returns_before_short_locks_lapse() {
    let broker = common::broker_with(InMemoryBrokerConfig {
        lock_duration: Duration::from_secs(1),
        ..InMemoryBrokerConfig::default()
    });
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = connection.create_queue_receiver(QUEUE).await.unwrap();

    sender.send_batch(["a", "b", "c"]).await.unwrap();
    let received = receiver
        .get_messages(5, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|m| m.delivery_count == 1));
    for message in &received {
        receiver.complete(&message.lock_token).await.unwrap();
    }
    assert_eq!(broker.active_message_count(&queue()), 0);
}

#[tokio::test]
async fn test_message_is_dead_lettered_after_max_deliveries() {
    let broker = common::broker_with(InMemoryBrokerConfig {
        max_delivery_count: 2,
        ..InMemoryBrokerConfig::default()
    });
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = connection.create_queue_receiver(QUEUE).await.unwrap();

    sender.send("poison").await.unwrap();
    for _ in 0..2 {
        let message = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();
        receiver.abandon(&message.lock_token).await.unwrap();
    }

    assert!(receiver
        .get_message(Some(Duration::from_millis(50)))
        .await
        .unwrap()
        .is_none());
    let dead = broker.dead_letter_messages(&queue());
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body_as_string(), "poison");
}

#[tokio::test]
async fn test_closing_receiver_leaves_unsettled_messages_locked() {
    let broker = common::broker();
    let connection = connect(&broker).await;
    let sender = connection.create_sender(QUEUE).await.unwrap();
    let receiver = connection.create_queue_receiver(QUEUE).await.unwrap();

    sender.send("held").await.unwrap();
    let message = receiver.get_message(Some(WAIT)).await.unwrap().unwrap();

    receiver.close().await.unwrap();

    assert_eq!(receiver.held_locks(), 0);
    assert!(matches!(
        receiver.complete(&message.lock_token).await,
        Err(ClientError::Closed { .. })
    ));
    assert_eq!(broker.active_message_count(&queue()), 1);
}
