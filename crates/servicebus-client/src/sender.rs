//! Sending messages to a queue or topic.

use crate::connection::ConnectionInner;
use crate::error::{ClientError, ValidationError};
use crate::message::{EntityName, Message, MessageBatch, MessageId};
use crate::retry::run_with_retry;
use crate::transport::{Channel, TransportError};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Sends messages to one queue or topic for its whole lifetime
pub struct Sender {
    entity: EntityName,
    connection: Arc<ConnectionInner>,
    closed: AtomicBool,
}

impl Sender {
    pub(crate) fn new(entity: EntityName, connection: Arc<ConnectionInner>) -> Self {
        Self {
            entity,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    /// The queue or topic this sender targets
    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    /// Send exactly one message.
    ///
    /// Waits until the broker acknowledges the message or the configured
    /// timeout elapses.
    pub async fn send(&self, message: impl Into<Message>) -> Result<MessageId, ClientError> {
        let channel = self.channel().await?;
        let payload = message.into().encode()?;

        let max_size = channel.limits().max_message_size;
        if payload.len() > max_size {
            return Err(ClientError::MessageTooLarge {
                size: payload.len(),
                max_size,
            });
        }

        let mut ids = self.send_payloads(channel.as_ref(), vec![payload]).await?;
        ids.pop().ok_or_else(|| ClientError::SendFailed {
            entity: self.entity.to_string(),
            message_index: None,
            reason: "broker acknowledged no message".to_string(),
        })
    }

    /// Send an ordered, non-empty sequence of messages as one atomic unit.
    ///
    /// The whole sequence is checked against the broker's limits before
    /// anything is sent; on failure every offending index is reported.
    pub async fn send_batch<I>(&self, messages: I) -> Result<Vec<MessageId>, ClientError>
    where
        I: IntoIterator,
        I::Item: Into<Message>,
    {
        let messages: Vec<Message> = messages.into_iter().map(Into::into).collect();
        if messages.is_empty() {
            return Err(ValidationError::Required {
                field: "messages".to_string(),
            }
            .into());
        }

        let channel = self.channel().await?;
        let batch = MessageBatch::from_messages(&messages, channel.limits())?;
        self.send_payloads(channel.as_ref(), batch.into_payloads())
            .await
    }

    /// Start an empty batch sized to the broker's advertised limits
    pub async fn create_batch(&self) -> Result<MessageBatch, ClientError> {
        let channel = self.channel().await?;
        Ok(MessageBatch::new(channel.limits()))
    }

    /// Send a batch built with [`Sender::create_batch`]
    pub async fn send_message_batch(&self, batch: MessageBatch) -> Result<Vec<MessageId>, ClientError> {
        if batch.is_empty() {
            return Err(ValidationError::Required {
                field: "batch".to_string(),
            }
            .into());
        }

        let channel = self.channel().await?;
        self.send_payloads(channel.as_ref(), batch.into_payloads())
            .await
    }

    /// Close the sender; later calls are no-ops
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(entity = %self.entity, "Sender closed");
        }
        Ok(())
    }

    /// Check whether [`Sender::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn resource(&self) -> String {
        format!("sender for '{}'", self.entity)
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::closed(self.resource()));
        }
        self.connection.channel(&self.resource()).await
    }

    /// Send encoded payloads, retrying transient failures.
    ///
    /// A retry always re-sends the complete set; the broker accepts or rejects
    /// a send as a whole.
    async fn send_payloads(
        &self,
        channel: &dyn Channel,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<MessageId>, ClientError> {
        let timeout = self.connection.timeout();
        let deadline = Instant::now() + timeout;
        let count = payloads.len();

        let sent = tokio::time::timeout_at(
            deadline,
            run_with_retry(self.connection.retry(), "send", Some(deadline), || {
                channel.send(&self.entity, payloads.clone())
            }),
        )
        .await;

        match sent {
            Ok(Ok(ack)) => {
                debug!(entity = %self.entity, count = count, "Messages sent");
                Ok(ack.message_ids)
            }
            Ok(Err(e)) => Err(self.send_error(e)),
            Err(_) => Err(ClientError::Timeout {
                operation: format!("send to '{}'", self.entity),
                duration: timeout,
            }),
        }
    }

    fn send_error(&self, error: TransportError) -> ClientError {
        match error {
            TransportError::Closed => ClientError::closed(self.resource()),
            TransportError::Rejected { index, reason } => ClientError::SendFailed {
                entity: self.entity.to_string(),
                message_index: index,
                reason,
            },
            other => ClientError::SendFailed {
                entity: self.entity.to_string(),
                message_index: None,
                reason: other.to_string(),
            },
        }
    }
}
