//! Message envelope model: entity identifiers, outbound and received messages,
//! application properties and the batch container.

use crate::error::{ClientError, SerializationError, ValidationError};
use crate::transport::LinkLimits;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

fn validate_name(
    field: &str,
    name: &str,
    max_len: usize,
    allow_slash: bool,
) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > max_len {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be 1-{} characters", max_len),
        });
    }

    if !name.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || (allow_slash && c == '/')
    }) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "only ASCII alphanumeric, hyphens, underscores, periods and slashes allowed"
                .to_string(),
        });
    }

    let first = name.chars().next();
    let last = name.chars().last();
    if !first.is_some_and(|c| c.is_ascii_alphanumeric())
        || !last.is_some_and(|c| c.is_ascii_alphanumeric())
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "must start and end with a letter or number".to_string(),
        });
    }

    Ok(())
}

/// Validated queue or topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("entity_name", &name, 260, true)?;
        Ok(Self(name))
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validated subscription name within a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionName(String);

impl SubscriptionName {
    /// Create new subscription name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("subscription_name", &name, 50, false)?;
        Ok(Self(name))
    }

    /// Get subscription name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The broker-side source a receiver pulls from.
///
/// Fixed for the lifetime of the receiver it was created for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// Point-to-point queue
    Queue(EntityName),
    /// Subscription attached to a topic
    Subscription {
        topic: EntityName,
        subscription: SubscriptionName,
    },
}

impl EntityRef {
    /// Broker address in `<queue>` or `<topic>/Subscriptions/<subscription>` form
    pub fn address(&self) -> String {
        match self {
            Self::Queue(queue) => queue.to_string(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{}/Subscriptions/{}", topic, subscription),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        if s.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "message_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque handle identifying one delivery attempt of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh lock token
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a token handed out by the broker
    pub fn from_raw(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get token as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Timestamp `duration` after now, saturating on overflow
    pub fn after(duration: Duration) -> Self {
        let now = Utc::now();
        let dt = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Properties and Body
// ============================================================================

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

/// Application property value.
///
/// A closed set of scalar types so that encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Binary(#[serde(with = "bytes_serde")] Bytes),
}

impl PropertyValue {
    /// Borrow the value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Long(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

/// Message body; the caller picks exactly one representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageBody {
    Text(String),
    Binary(#[serde(with = "bytes_serde")] Bytes),
}

impl MessageBody {
    /// Raw body bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Body as text, replacing invalid UTF-8 sequences
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// Body as text, failing on invalid UTF-8
    pub fn as_str(&self) -> Result<&str, SerializationError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| SerializationError::InvalidUtf8)
            }
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub application_properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: None,
            body,
            application_properties: BTreeMap::new(),
            content_type: None,
            subject: None,
            correlation_id: None,
            partition_key: None,
            session_id: None,
            to: None,
            reply_to: None,
            time_to_live: None,
        }
    }

    /// Create message with a text body
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(body.into()))
    }

    /// Create message with a binary body
    pub fn binary(body: impl Into<Bytes>) -> Self {
        Self::new(MessageBody::Binary(body.into()))
    }

    /// Set message ID used by the broker for duplicate detection
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Add application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Set content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set subject (label)
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set partition key
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Set session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set destination address
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Set reply address
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_as_string(&self) -> Cow<'_, str> {
        self.body.to_string_lossy()
    }

    /// Encode into the payload handed to the transport.
    ///
    /// Properties are kept in a sorted map, so equal messages always encode to
    /// identical bytes.
    ///
    /// Fails on NaN or infinite `Double` properties, which JSON cannot carry.
    pub fn encode(&self) -> Result<Bytes, SerializationError> {
        if let Some(key) = self
            .application_properties
            .iter()
            .find(|(_, value)| matches!(value, PropertyValue::Double(d) if !d.is_finite()))
            .map(|(key, _)| key)
        {
            return Err(SerializationError::NonFiniteProperty { key: key.clone() });
        }

        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a payload produced by [`Message::encode`]
    pub fn decode(payload: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Self::text(body)
    }
}

impl From<String> for Message {
    fn from(body: String) -> Self {
        Self::text(body)
    }
}

impl From<Bytes> for Message {
    fn from(body: Bytes) -> Self {
        Self::binary(body)
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Self::binary(body)
    }
}

/// Where a received message sits in the broker's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageState {
    /// Available for normal delivery
    #[default]
    Active,
    /// Set aside by a receiver and only retrievable by sequence number
    Deferred,
    /// Enqueued for delivery at a later time
    Scheduled,
}

/// A message received under peek-lock, with broker metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: MessageBody,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    pub session_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub time_to_live: Option<Duration>,
    /// Number of times this message has been delivered, starting at 1
    pub delivery_count: u32,
    /// Required to complete or abandon this delivery
    pub lock_token: LockToken,
    pub enqueued_time: Timestamp,
    pub sequence_number: i64,
    pub locked_until: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub state: MessageState,
}

impl ReceivedMessage {
    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_as_string(&self) -> Cow<'_, str> {
        self.body.to_string_lossy()
    }

    /// Raw body bytes
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Convert back to Message (for forwarding/replaying)
    pub fn message(&self) -> Message {
        Message {
            message_id: Some(self.message_id.clone()),
            body: self.body.clone(),
            application_properties: self.application_properties.clone(),
            content_type: self.content_type.clone(),
            subject: self.subject.clone(),
            correlation_id: self.correlation_id.clone(),
            partition_key: self.partition_key.clone(),
            session_id: self.session_id.clone(),
            to: self.to.clone(),
            reply_to: self.reply_to.clone(),
            time_to_live: self.time_to_live,
        }
    }

    /// Check if message has exceeded maximum delivery count
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }
}

// ============================================================================
// Batches
// ============================================================================

/// An ordered set of encoded messages that fits the link limits advertised by
/// the broker.
///
/// Created through [`crate::Sender::create_batch`].
#[derive(Debug, Clone)]
pub struct MessageBatch {
    limits: LinkLimits,
    payloads: Vec<Bytes>,
    size_in_bytes: usize,
}

impl MessageBatch {
    pub(crate) fn new(limits: LinkLimits) -> Self {
        Self {
            limits,
            payloads: Vec::new(),
            size_in_bytes: 0,
        }
    }

    /// Encode a whole sequence at once, reporting every index that does not fit.
    ///
    /// Messages are accumulated in order. Once the running size passes the
    /// batch limit every later index is reported as well, since an ordered
    /// batch cannot skip an element.
    pub(crate) fn from_messages(
        messages: &[Message],
        limits: LinkLimits,
    ) -> Result<Self, ClientError> {
        let mut batch = Self::new(limits);
        let mut rejected_indices = Vec::new();
        let mut total_size = 0;

        for (index, message) in messages.iter().enumerate() {
            let payload = message.encode()?;
            total_size += payload.len();

            if index >= limits.max_batch_count
                || payload.len() > limits.max_message_size
                || total_size > limits.max_batch_size
            {
                rejected_indices.push(index);
                continue;
            }

            batch.size_in_bytes = total_size;
            batch.payloads.push(payload);
        }

        if !rejected_indices.is_empty() {
            return Err(ClientError::BatchTooLarge {
                size: total_size,
                max_size: limits.max_batch_size,
                rejected_indices,
            });
        }

        Ok(batch)
    }

    /// Add a message to the end of the batch.
    ///
    /// Fails without modifying the batch when the message would push it past
    /// the advertised size or count limit.
    pub fn try_add_message(&mut self, message: impl Into<Message>) -> Result<(), ClientError> {
        let payload = message.into().encode()?;
        let index = self.payloads.len();

        if payload.len() > self.limits.max_message_size {
            return Err(ClientError::MessageTooLarge {
                size: payload.len(),
                max_size: self.limits.max_message_size,
            });
        }

        let new_size = self.size_in_bytes + payload.len();
        if index >= self.limits.max_batch_count || new_size > self.limits.max_batch_size {
            return Err(ClientError::BatchTooLarge {
                size: new_size,
                max_size: self.limits.max_batch_size,
                rejected_indices: vec![index],
            });
        }

        self.size_in_bytes = new_size;
        self.payloads.push(payload);
        Ok(())
    }

    /// Number of messages in the batch
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Check if the batch holds no messages
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Encoded size of all messages
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Largest encoded size the broker accepts for one batch
    pub fn max_size_in_bytes(&self) -> usize {
        self.limits.max_batch_size
    }

    pub(crate) fn into_payloads(self) -> Vec<Bytes> {
        self.payloads
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
