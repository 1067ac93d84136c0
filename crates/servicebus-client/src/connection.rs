//! Connection lifecycle.
//!
//! A [`Connection`] owns one transport channel. Every [`Sender`] and
//! [`Receiver`] created from it shares that channel; operations take a
//! snapshot of the handle, so closing the connection makes all of them fail
//! with [`ClientError::Closed`].

use crate::config::{ClientConfig, ConnectionString};
use crate::error::{ClientError, ConfigurationError, ConnectionFailure};
use crate::message::{EntityName, EntityRef, SubscriptionName};
use crate::receiver::Receiver;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::sender::Sender;
use crate::transport::{Channel, ConnectionSettings, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// State shared by a connection and everything created from it
pub(crate) struct ConnectionInner {
    config: ClientConfig,
    endpoint: String,
    retry: RetryPolicy,
    channel: RwLock<Option<Arc<dyn Channel>>>,
}

impl ConnectionInner {
    /// Snapshot of the open channel, or `Closed` naming `resource`
    pub(crate) async fn channel(&self, resource: &str) -> Result<Arc<dyn Channel>, ClientError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| ClientError::closed(resource))
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// An open connection to a broker namespace
///
/// Cloning is cheap; clones share the same channel and closing any of them
/// closes all.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection.
    ///
    /// The connection string is parsed before any network I/O. Transient
    /// failures while opening the channel are retried according to the
    /// configured retry policy, bounded by the operation timeout.
    pub async fn open(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ClientError> {
        let connection_string: ConnectionString =
            config
                .connection_string
                .parse()
                .map_err(|e: ConfigurationError| ClientError::ConnectionFailed {
                    reason: ConnectionFailure::InvalidConnectionString,
                    message: e.to_string(),
                })?;
        config.retry.validate()?;

        let endpoint = connection_string.host().to_string();
        if config.insecure_skip_verify {
            warn!(
                endpoint = %endpoint,
                "Certificate validation is disabled; use only against non-production endpoints"
            );
        }

        let timeout = config.timeout();
        let settings = ConnectionSettings {
            connection_string,
            insecure_skip_verify: config.insecure_skip_verify,
            operation_timeout: timeout,
        };
        let retry = RetryPolicy::from_config(&config.retry);

        let deadline = Instant::now() + timeout;
        let opened = tokio::time::timeout_at(
            deadline,
            run_with_retry(&retry, "open", Some(deadline), || transport.open(&settings)),
        )
        .await;

        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(open_error(e)),
            Err(_) => {
                return Err(ClientError::ConnectionFailed {
                    reason: ConnectionFailure::Unreachable,
                    message: format!("no response from {} within {:?}", endpoint, timeout),
                })
            }
        };

        info!(endpoint = %endpoint, "Connection opened");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                endpoint,
                retry,
                channel: RwLock::new(Some(channel)),
            }),
        })
    }

    /// Host the connection targets
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Configuration the connection was opened with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Create a sender bound to a queue or topic
    pub async fn create_sender(&self, entity: &str) -> Result<Sender, ClientError> {
        let entity = EntityName::new(entity)?;
        self.ensure_open().await?;
        Ok(Sender::new(entity, self.inner.clone()))
    }

    /// Create a receiver bound to a queue
    pub async fn create_queue_receiver(&self, queue: &str) -> Result<Receiver, ClientError> {
        let source = EntityRef::Queue(EntityName::new(queue)?);
        self.ensure_open().await?;
        Ok(Receiver::new(source, self.inner.clone()))
    }

    /// Create a receiver bound to a topic subscription
    pub async fn create_subscription_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Receiver, ClientError> {
        let source = EntityRef::Subscription {
            topic: EntityName::new(topic)?,
            subscription: SubscriptionName::new(subscription)?,
        };
        self.ensure_open().await?;
        Ok(Receiver::new(source, self.inner.clone()))
    }

    /// Close the connection; later calls are no-ops.
    ///
    /// Failures while closing the channel are logged, not returned. Locks
    /// still held by receivers are released by the broker.
    pub async fn close(&self) -> Result<(), ClientError> {
        let Some(channel) = self.inner.channel.write().await.take() else {
            return Ok(());
        };

        if let Err(e) = channel.close().await {
            warn!(endpoint = %self.inner.endpoint, error = %e, "Error while closing channel");
        }

        info!(endpoint = %self.inner.endpoint, "Connection closed");
        Ok(())
    }

    /// Check whether [`Connection::close`] has been called
    pub async fn is_closed(&self) -> bool {
        self.inner.channel.read().await.is_none()
    }

    async fn ensure_open(&self) -> Result<(), ClientError> {
        let resource = format!("connection to {}", self.inner.endpoint);
        self.inner.channel(&resource).await.map(|_| ())
    }
}

fn open_error(error: TransportError) -> ClientError {
    let reason = match error {
        TransportError::Unauthorized(_) => ConnectionFailure::Unauthorized,
        TransportError::Tls(_) => ConnectionFailure::Tls,
        _ => ConnectionFailure::Unreachable,
    };

    ClientError::ConnectionFailed {
        reason,
        message: error.to_string(),
    }
}
