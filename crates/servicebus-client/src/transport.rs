//! Boundary to the wire transport.
//!
//! The client never speaks the broker protocol itself. It drives a [`Transport`]
//! to obtain a [`Channel`] and then only issues send, receive, settle and close
//! calls against that channel. Implementations must be safe to share between
//! tasks: one channel backs every sender and receiver of a connection.
//!
//! [`crate::providers::InMemoryBroker`] is the in-process implementation used
//! for development and tests.

use crate::config::ConnectionString;
use crate::message::{EntityName, EntityRef, LockToken, MessageId, MessageState, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Size and count limits a broker advertises for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLimits {
    /// Largest encoded size of a single message
    pub max_message_size: usize,
    /// Largest combined encoded size of one batch
    pub max_batch_size: usize,
    /// Most messages allowed in one batch
    pub max_batch_count: usize,
}

impl Default for LinkLimits {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            max_batch_size: 256 * 1024,
            max_batch_count: 100,
        }
    }
}

/// Everything a transport needs to open a channel
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connection_string: ConnectionString,
    pub insecure_skip_verify: bool,
    pub operation_timeout: Duration,
}

/// How a peek-locked delivery is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Remove the message from the entity
    Complete,
    /// Release the lock so the message is redelivered
    Abandon,
}

/// One message handed out by the broker under peek-lock
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Encoded envelope as produced by [`crate::Message::encode`]
    pub payload: Bytes,
    pub message_id: MessageId,
    pub lock_token: LockToken,
    pub delivery_count: u32,
    pub sequence_number: i64,
    pub enqueued_time: Timestamp,
    /// How long the lock is held from the moment of delivery
    pub lock_duration: Duration,
    pub expires_at: Option<Timestamp>,
    pub state: MessageState,
}

/// Broker acknowledgement for an accepted send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    /// IDs of the accepted messages, in send order
    pub message_ids: Vec<MessageId>,
}

/// Failures reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Authorization failed: {0}")]
    Unauthorized(String),

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Message rejected: {reason}")]
    Rejected {
        /// Position within the batch, when the broker reports it
        index: Option<usize>,
        reason: String,
    },

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Channel closed")]
    Closed,

    #[error("I/O failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Unauthorized(_) => false,
            Self::Tls(_) => false,
            Self::EntityNotFound(_) => false,
            Self::Rejected { .. } => false,
            Self::LockLost(_) => false,
            Self::Closed => false,
            Self::Io(_) => true,
        }
    }
}

/// Opens channels to a broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a channel; may perform network I/O
    async fn open(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Channel>, TransportError>;
}

/// An open, shareable channel to the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Limits the broker advertised when the channel was opened
    fn limits(&self) -> LinkLimits;

    /// Send encoded messages to a queue or topic as one atomic unit
    async fn send(&self, entity: &EntityName, payload: Vec<Bytes>) -> Result<SendAck, TransportError>;

    /// Receive up to `max_count` messages under peek-lock.
    ///
    /// Waits until at least one message is available or `deadline` passes; an
    /// empty result means the deadline passed.
    async fn receive(
        &self,
        source: &EntityRef,
        max_count: u32,
        deadline: Instant,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Settle a delivery identified by its lock token
    async fn settle(&self, lock_token: &LockToken, outcome: SettleOutcome) -> Result<(), TransportError>;

    /// Close the channel. Locks held through it are released by the broker.
    async fn close(&self) -> Result<(), TransportError>;
}
