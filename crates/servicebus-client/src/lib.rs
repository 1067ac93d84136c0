//! # Service Bus Client
//!
//! Asynchronous client for a brokered messaging service with queues, topics
//! and subscriptions.
//!
//! This library provides:
//! - Connections that share one transport channel between many senders and
//!   receivers
//! - Single and atomic batch sends, checked against broker limits up front
//! - Peek-lock receives with bounded waits, and complete/abandon settlement
//! - Retry with exponential backoff for transient transport failures
//! - An in-memory broker for development and tests
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all client operations
//! - [`config`] - Client configuration and connection strings
//! - [`message`] - Message envelopes, identifiers and batches
//! - [`connection`], [`sender`], [`receiver`] - The client surface
//! - [`transport`] - Boundary to the wire protocol
//! - [`providers`] - Transport implementations
//!
//! ## Example
//!
//! ```rust
//! use servicebus_client::{ClientConfig, Connection, InMemoryBroker, Message};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::default();
//! broker.create_queue("orders")?;
//!
//! let config = ClientConfig::new(
//!     "Endpoint=sb://localhost;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=SAS_KEY_VALUE",
//! );
//! let connection = Connection::open(config, Arc::new(broker)).await?;
//!
//! let sender = connection.create_sender("orders").await?;
//! sender.send(Message::text("hello").with_property("Type", "Greeting")).await?;
//!
//! let receiver = connection.create_queue_receiver("orders").await?;
//! if let Some(message) = receiver.get_message(Some(Duration::from_secs(1))).await? {
//!     assert_eq!(message.body_as_string(), "hello");
//!     receiver.complete(&message.lock_token).await?;
//! }
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod providers;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod settlement;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{ClientConfig, ConnectionString, RetryConfig, DEFAULT_TIMEOUT};
pub use connection::Connection;
pub use error::{
    ClientError, ConfigurationError, ConnectionFailure, SerializationError, ValidationError,
};
pub use message::{
    EntityName, EntityRef, LockToken, Message, MessageBatch, MessageBody, MessageId,
    MessageState, PropertyValue, ReceivedMessage, SubscriptionName, Timestamp,
};
pub use providers::{InMemoryBroker, InMemoryBrokerConfig};
pub use receiver::Receiver;
pub use retry::RetryPolicy;
pub use sender::Sender;
pub use settlement::LockState;
pub use transport::{Channel, LinkLimits, SettleOutcome, Transport, TransportError};
