//! Common test utilities for servicebus-client integration tests
//!
//! This module provides:
//! - One-time tracing setup, filtered through `RUST_LOG`
//! - An in-memory broker pre-populated with the entities the scenarios use
//! - Connection helpers with short retry delays

use servicebus_client::{
    ClientConfig, Connection, InMemoryBroker, InMemoryBrokerConfig, RetryConfig,
};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const CONNECTION_STRING: &str =
    "Endpoint=sb://localhost;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=SAS_KEY_VALUE";

pub const QUEUE: &str = "orders";
pub const TOPIC: &str = "events";
pub const SUBSCRIPTION: &str = "audit";
pub const SECOND_SUBSCRIPTION: &str = "billing";

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Client configuration used by every scenario
pub fn client_config() -> ClientConfig {
    ClientConfig::new(CONNECTION_STRING)
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            backoff_multiplier: 2.0,
            use_jitter: false,
        })
}

/// Broker with a queue, a topic and two subscriptions on it
#[allow(dead_code)]
pub fn broker() -> InMemoryBroker {
    broker_with(InMemoryBrokerConfig::default())
}

#[allow(dead_code)]
pub fn broker_with(config: InMemoryBrokerConfig) -> InMemoryBroker {
    init_tracing();
    let broker = InMemoryBroker::new(config);
    broker.create_queue(QUEUE).expect("queue");
    broker.create_topic(TOPIC).expect("topic");
    broker
        .create_subscription(TOPIC, SUBSCRIPTION)
        .expect("subscription");
    broker
        .create_subscription(TOPIC, SECOND_SUBSCRIPTION)
        .expect("second subscription");
    broker
}

#[allow(dead_code)]
pub async fn connect(broker: &InMemoryBroker) -> Connection {
    connect_with(broker, client_config()).await
}

#[allow(dead_code)]
pub async fn connect_with(broker: &InMemoryBroker, config: ClientConfig) -> Connection {
    Connection::open(config, Arc::new(broker.clone()))
        .await
        .expect("connection should open")
}
