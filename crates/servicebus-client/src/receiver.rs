//! Receiving and settling messages from a queue or subscription.
//!
//! Messages are received under peek-lock: they stay on the broker, hidden from
//! other receivers, until completed, abandoned, or the lock expires. A receiver
//! keeps a record of each lock it holds so that settling an unknown, expired
//! or already-settled token fails fast with [`ClientError::LockLost`].

use crate::connection::ConnectionInner;
use crate::error::{ClientError, SerializationError};
use crate::message::{EntityRef, LockToken, Message, ReceivedMessage, Timestamp};
use crate::retry::run_with_retry;
use crate::settlement::{LockRecord, LockTracker};
use crate::transport::{Channel, Delivery, SettleOutcome, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Receives from one queue or subscription for its whole lifetime
pub struct Receiver {
    source: EntityRef,
    connection: Arc<ConnectionInner>,
    locks: LockTracker,
    closed: AtomicBool,
}

impl Receiver {
    pub(crate) fn new(source: EntityRef, connection: Arc<ConnectionInner>) -> Self {
        Self {
            source,
            connection,
            locks: LockTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The queue or subscription this receiver reads from
    pub fn source(&self) -> &EntityRef {
        &self.source
    }

    /// Number of locks held by this receiver that have not expired
    pub fn held_locks(&self) -> usize {
        self.locks.held(Instant::now())
    }

    /// Receive at most one message.
    ///
    /// Returns `None` if nothing arrives within `timeout`, which defaults to
    /// the connection's operation timeout.
    pub async fn get_message(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReceivedMessage>, ClientError> {
        Ok(self.get_messages(1, timeout).await?.into_iter().next())
    }

    /// Receive up to `max_count` messages.
    ///
    /// Waits up to `timeout` for the first message. Once anything has arrived,
    /// whatever else is already available is collected without waiting and the
    /// batch is returned, so locks on gathered messages cannot lapse while the
    /// call is still running. Nothing arriving in time yields an empty vector.
    /// If the transport fails after some messages were received, those
    /// messages are returned and the failure is logged.
    pub async fn get_messages(
        &self,
        max_count: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, ClientError> {
        let channel = self.channel().await?;
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let timeout = timeout.unwrap_or_else(|| self.connection.timeout());
        let deadline = Instant::now() + timeout;
        self.locks.purge_expired(Instant::now());

        let mut messages: Vec<ReceivedMessage> = Vec::new();
        let mut decode_error = None;
        let mut wait_until = deadline;
        let mut drained = false;

        loop {
            let remaining = max_count - messages.len() as u32;

            let received = tokio::time::timeout_at(
                deadline,
                run_with_retry(self.connection.retry(), "receive", Some(wait_until), || {
                    channel.receive(&self.source, remaining, wait_until)
                }),
            )
            .await;

            let deliveries = match received {
                Ok(Ok(deliveries)) => deliveries,
                Ok(Err(e)) if messages.is_empty() => return Err(self.receive_error(e)),
                Ok(Err(e)) => {
                    warn!(
                        entity = %self.source,
                        received = messages.len(),
                        error = %e,
                        "Receive failed; returning messages received so far"
                    );
                    break;
                }
                Err(_) => break,
            };

            if deliveries.is_empty() {
                break;
            }

            for delivery in deliveries {
                let lock_token = delivery.lock_token.clone();
                match self.accept(delivery) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        warn!(
                            entity = %self.source,
                            lock_token = %lock_token,
                            error = %e,
                            "Undecodable message; abandoning"
                        );
                        if let Err(e) = channel.settle(&lock_token, SettleOutcome::Abandon).await {
                            warn!(lock_token = %lock_token, error = %e, "Abandon failed");
                        }
                        decode_error = Some(e);
                    }
                }
            }

            if drained || decode_error.is_some() || messages.len() >= max_count as usize {
                break;
            }

            // One more pass for messages that are already available
            drained = true;
            wait_until = Instant::now();
        }

        if messages.is_empty() {
            if let Some(e) = decode_error {
                return Err(e.into());
            }
        }

        debug!(entity = %self.source, count = messages.len(), "Messages received");
        Ok(messages)
    }

    /// Remove a received message from the broker.
    ///
    /// Fails with [`ClientError::LockLost`] if the token is unknown, expired or
    /// already settled. A transient failure while the lock is still valid
    /// leaves the lock held and fails with [`ClientError::SettleFailed`] or
    /// [`ClientError::Timeout`]; the call may be repeated with the same token.
    pub async fn complete(&self, lock_token: &LockToken) -> Result<(), ClientError> {
        self.settle(lock_token, SettleOutcome::Complete).await
    }

    /// Release a received message for immediate redelivery.
    ///
    /// Fails with [`ClientError::LockLost`] under the same conditions as
    /// [`Receiver::complete`].
    pub async fn abandon(&self, lock_token: &LockToken) -> Result<(), ClientError> {
        self.settle(lock_token, SettleOutcome::Abandon).await
    }

    /// Close the receiver; later calls are no-ops.
    ///
    /// Unsettled messages are not abandoned here. Their locks lapse on the
    /// broker, or are released when the connection closes.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let held = self.locks.held(Instant::now());
            self.locks.clear();
            debug!(entity = %self.source, unsettled = held, "Receiver closed");
        }
        Ok(())
    }

    /// Check whether [`Receiver::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn resource(&self) -> String {
        format!("receiver for '{}'", self.source)
    }

    async fn channel(&self) -> Result<Arc<dyn Channel>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::closed(self.resource()));
        }
        self.connection.channel(&self.resource()).await
    }

    /// Decode a delivery and start tracking its lock
    fn accept(&self, delivery: Delivery) -> Result<ReceivedMessage, SerializationError> {
        let message = Message::decode(&delivery.payload)?;

        let now = Instant::now();
        self.locks.track(
            delivery.lock_token.clone(),
            LockRecord {
                entity: self.source.clone(),
                message_id: delivery.message_id.clone(),
                acquired_at: now,
                deadline: now + delivery.lock_duration,
            },
        );

        Ok(ReceivedMessage {
            message_id: delivery.message_id,
            body: message.body,
            application_properties: message.application_properties,
            content_type: message.content_type,
            subject: message.subject,
            correlation_id: message.correlation_id,
            partition_key: message.partition_key,
            session_id: message.session_id,
            to: message.to,
            reply_to: message.reply_to,
            time_to_live: message.time_to_live,
            delivery_count: delivery.delivery_count,
            lock_token: delivery.lock_token,
            enqueued_time: delivery.enqueued_time,
            sequence_number: delivery.sequence_number,
            locked_until: Timestamp::after(delivery.lock_duration),
            expires_at: delivery.expires_at,
            state: delivery.state,
        })
    }

    async fn settle(&self, lock_token: &LockToken, outcome: SettleOutcome) -> Result<(), ClientError> {
        let channel = self.channel().await?;
        let lock_lost = || ClientError::LockLost {
            lock_token: lock_token.to_string(),
        };

        // Claiming removes the record, so a concurrent settlement of the same
        // token fails here
        let Some(record) = self.locks.claim(lock_token, Instant::now()) else {
            warn!(entity = %self.source, lock_token = %lock_token, "Settlement of unknown or expired lock");
            return Err(lock_lost());
        };

        let operation = match outcome {
            SettleOutcome::Complete => "complete",
            SettleOutcome::Abandon => "abandon",
        };
        let timeout = self.connection.timeout();
        let deadline = record.deadline.min(Instant::now() + timeout);

        let settled = tokio::time::timeout_at(
            deadline,
            run_with_retry(self.connection.retry(), operation, Some(deadline), || {
                channel.settle(lock_token, outcome)
            }),
        )
        .await;

        match settled {
            Ok(Ok(())) => {
                debug!(
                    entity = %record.entity,
                    message_id = %record.message_id,
                    outcome = operation,
                    held_ms = record.acquired_at.elapsed().as_millis() as u64,
                    "Message settled"
                );
                Ok(())
            }
            Ok(Err(TransportError::Closed)) => Err(ClientError::closed(self.resource())),
            Ok(Err(e)) if e.is_transient() && Instant::now() < record.deadline => {
                warn!(
                    entity = %record.entity,
                    lock_token = %lock_token,
                    error = %e,
                    "Settlement failed; lock still held"
                );
                self.locks.track(lock_token.clone(), record);
                Err(ClientError::SettleFailed {
                    lock_token: lock_token.to_string(),
                    message: e.to_string(),
                })
            }
            Ok(Err(e)) => {
                warn!(
                    entity = %record.entity,
                    lock_token = %lock_token,
                    error = %e,
                    "Settlement failed; lock lost"
                );
                Err(lock_lost())
            }
            Err(_) if Instant::now() >= record.deadline => {
                warn!(entity = %record.entity, lock_token = %lock_token, "Lock expired during settlement");
                Err(lock_lost())
            }
            Err(_) => {
                self.locks.track(lock_token.clone(), record);
                Err(ClientError::Timeout {
                    operation: format!("{} on '{}'", operation, self.source),
                    duration: timeout,
                })
            }
        }
    }

    fn receive_error(&self, error: TransportError) -> ClientError {
        match error {
            TransportError::Closed => ClientError::closed(self.resource()),
            other => ClientError::ReceiveFailed {
                entity: self.source.address(),
                message: other.to_string(),
            },
        }
    }
}
