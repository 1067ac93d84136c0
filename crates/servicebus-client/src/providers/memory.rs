//! In-memory broker for testing and development.
//!
//! [`InMemoryBroker`] implements [`Transport`] with the broker behaviour the
//! client depends on:
//! - queues, and topics whose subscriptions each keep their own ordered copy
//! - peek-lock with a configurable lock duration and lazy lock expiry
//! - redelivery on abandon or expiry, dead-lettering at the max delivery count
//! - message time-to-live and duplicate detection by message ID
//! - advertised link limits
//!
//! Credentials, self-signed certificates and transport faults can be
//! simulated to drive the client's failure paths.

use crate::error::{ClientError, ValidationError};
use crate::message::{
    EntityName, EntityRef, LockToken, Message, MessageId, MessageState, SubscriptionName,
    Timestamp,
};
use crate::transport::{
    Channel, ConnectionSettings, Delivery, LinkLimits, SendAck, SettleOutcome, Transport,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Broker-side behaviour of an [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// How long a delivered message stays locked
    pub lock_duration: Duration,
    /// Deliveries after which an unsettled message is dead-lettered
    pub max_delivery_count: u32,
    /// Limits advertised to every channel
    pub limits: LinkLimits,
    /// Drop messages whose ID was already sent to the same entity
    pub duplicate_detection: bool,
    /// How long a message ID is remembered for duplicate detection
    pub duplicate_detection_window: Duration,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            limits: LinkLimits::default(),
            duplicate_detection: false,
            duplicate_detection_window: Duration::from_secs(10 * 60),
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in an entity with broker metadata
#[derive(Clone)]
struct StoredMessage {
    payload: Bytes,
    message_id: MessageId,
    sequence_number: i64,
    enqueued_time: Timestamp,
    delivery_count: u32,
    expires_at: Option<(Instant, Timestamp)>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at
            .as_ref()
            .is_some_and(|(deadline, _)| now >= *deadline)
    }
}

/// A message currently handed out under peek-lock
struct LockedMessage {
    message: StoredMessage,
    deadline: Instant,
    owner: u64,
}

/// Messages of one queue or one subscription
#[derive(Default)]
struct EntityStore {
    /// Keyed by sequence number so redelivered messages keep their place
    available: BTreeMap<i64, StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    dead_letter: Vec<StoredMessage>,
}

impl EntityStore {
    fn enqueue(&mut self, message: StoredMessage) {
        self.available.insert(message.sequence_number, message);
    }

    /// Make a message available again, or dead-letter it once it has been
    /// delivered `max_delivery_count` times
    fn release(&mut self, message: StoredMessage, max_delivery_count: u32) {
        if message.delivery_count >= max_delivery_count {
            debug!(
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                "Moving message to dead letter"
            );
            self.dead_letter.push(message);
        } else {
            self.enqueue(message);
        }
    }

    fn release_where(
        &mut self,
        max_delivery_count: u32,
        predicate: impl Fn(&LockedMessage) -> bool,
    ) -> Vec<LockToken> {
        let tokens: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| predicate(locked))
            .map(|(token, _)| token.clone())
            .collect();

        for token in &tokens {
            if let Some(locked) = self.locked.remove(token) {
                self.release(locked.message, max_delivery_count);
            }
        }
        tokens
    }

    fn earliest_lock_deadline(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.deadline).min()
    }

    fn lock_next(
        &mut self,
        max_count: usize,
        now: Instant,
        lock_duration: Duration,
        owner: u64,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        while deliveries.len() < max_count {
            let Some((_, mut message)) = self.available.pop_first() else {
                break;
            };

            if message.is_expired(now) {
                debug!(message_id = %message.message_id, "Dropping expired message");
                continue;
            }

            message.delivery_count += 1;
            let lock_token = LockToken::new();

            deliveries.push(Delivery {
                payload: message.payload.clone(),
                message_id: message.message_id.clone(),
                lock_token: lock_token.clone(),
                delivery_count: message.delivery_count,
                sequence_number: message.sequence_number,
                enqueued_time: message.enqueued_time.clone(),
                lock_duration,
                expires_at: message.expires_at.as_ref().map(|(_, at)| at.clone()),
                state: MessageState::Active,
            });

            self.locked.insert(
                lock_token,
                LockedMessage {
                    message,
                    deadline: now + lock_duration,
                    owner,
                },
            );
        }

        deliveries
    }

    fn active_count(&self, now: Instant) -> usize {
        let available = self
            .available
            .values()
            .filter(|message| !message.is_expired(now))
            .count();
        available + self.locked.len()
    }
}

#[derive(Default)]
struct Topic {
    subscriptions: BTreeMap<SubscriptionName, EntityStore>,
}

#[derive(Default)]
struct Faults {
    opens: u32,
    sends: u32,
    receives: u32,
    settles: u32,
}

fn take_fault(remaining: &mut u32) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

struct Credentials {
    key_name: String,
    key: String,
}

struct BrokerState {
    queues: HashMap<EntityName, EntityStore>,
    topics: HashMap<EntityName, Topic>,
    /// Where each outstanding lock lives and which channel holds it
    lock_index: HashMap<LockToken, (EntityRef, u64)>,
    /// Message IDs per entity with the time they were first accepted
    seen_ids: HashMap<EntityName, HashMap<MessageId, Instant>>,
    next_sequence: i64,
    credentials: Option<Credentials>,
    self_signed_certificate: bool,
    faults: Faults,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            topics: HashMap::new(),
            lock_index: HashMap::new(),
            seen_ids: HashMap::new(),
            next_sequence: 1,
            credentials: None,
            self_signed_certificate: false,
            faults: Faults::default(),
        }
    }

    fn store(&self, source: &EntityRef) -> Option<&EntityStore> {
        match source {
            EntityRef::Queue(name) => self.queues.get(name),
            EntityRef::Subscription {
                topic,
                subscription,
            } => self
                .topics
                .get(topic)
                .and_then(|t| t.subscriptions.get(subscription)),
        }
    }

    fn store_mut(&mut self, source: &EntityRef) -> Result<&mut EntityStore, TransportError> {
        match source {
            EntityRef::Queue(name) => self.queues.get_mut(name),
            EntityRef::Subscription {
                topic,
                subscription,
            } => self
                .topics
                .get_mut(topic)
                .and_then(|t| t.subscriptions.get_mut(subscription)),
        }
        .ok_or_else(|| TransportError::EntityNotFound(source.address()))
    }

    fn stores_mut(&mut self) -> impl Iterator<Item = &mut EntityStore> {
        self.queues.values_mut().chain(
            self.topics
                .values_mut()
                .flat_map(|topic| topic.subscriptions.values_mut()),
        )
    }

    fn release_locks_where(
        &mut self,
        max_delivery_count: u32,
        predicate: impl Fn(&LockedMessage) -> bool,
    ) {
        let released: Vec<LockToken> = self
            .stores_mut()
            .flat_map(|store| store.release_where(max_delivery_count, &predicate))
            .collect();

        for token in released {
            self.lock_index.remove(&token);
        }
    }

    fn expire_locks(&mut self, now: Instant, max_delivery_count: u32) {
        self.release_locks_where(max_delivery_count, |locked| now >= locked.deadline);
    }

    fn entity_exists(&self, name: &EntityName) -> bool {
        self.queues.contains_key(name) || self.topics.contains_key(name)
    }

    /// Validate, decode and enqueue one send as an atomic unit
    fn accept(
        &mut self,
        entity: &EntityName,
        payloads: Vec<Bytes>,
        config: &InMemoryBrokerConfig,
    ) -> Result<SendAck, TransportError> {
        let limits = config.limits;

        if payloads.len() > limits.max_batch_count {
            return Err(TransportError::Rejected {
                index: Some(limits.max_batch_count),
                reason: format!(
                    "batch holds {} messages; limit is {}",
                    payloads.len(),
                    limits.max_batch_count
                ),
            });
        }

        let mut total = 0;
        for (index, payload) in payloads.iter().enumerate() {
            if payload.len() > limits.max_message_size {
                return Err(TransportError::Rejected {
                    index: Some(index),
                    reason: format!(
                        "message of {} bytes exceeds limit of {} bytes",
                        payload.len(),
                        limits.max_message_size
                    ),
                });
            }

            total += payload.len();
            if total > limits.max_batch_size {
                return Err(TransportError::Rejected {
                    index: Some(index),
                    reason: format!("batch exceeds {} bytes", limits.max_batch_size),
                });
            }
        }

        let messages = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                Message::decode(payload).map_err(|e| TransportError::Rejected {
                    index: Some(index),
                    reason: format!("malformed payload: {}", e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !self.entity_exists(entity) {
            return Err(TransportError::EntityNotFound(entity.to_string()));
        }

        let now = Instant::now();
        let mut message_ids = Vec::with_capacity(payloads.len());
        let mut accepted = Vec::with_capacity(payloads.len());

        if config.duplicate_detection {
            let window = config.duplicate_detection_window;
            self.seen_ids
                .entry(entity.clone())
                .or_default()
                .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        }

        for (payload, message) in payloads.into_iter().zip(messages) {
            let message_id = message.message_id.clone().unwrap_or_default();
            message_ids.push(message_id.clone());

            if config.duplicate_detection {
                let seen = self.seen_ids.entry(entity.clone()).or_default();
                if seen.contains_key(&message_id) {
                    debug!(entity = %entity, message_id = %message_id, "Dropping duplicate message");
                    continue;
                }
                seen.insert(message_id.clone(), now);
            }

            let sequence_number = self.next_sequence;
            self.next_sequence += 1;

            let expires_at = message
                .time_to_live
                .and_then(|ttl| now.checked_add(ttl).map(|at| (at, Timestamp::after(ttl))));

            accepted.push(StoredMessage {
                payload,
                message_id,
                sequence_number,
                enqueued_time: Timestamp::now(),
                delivery_count: 0,
                expires_at,
            });
        }

        if let Some(queue) = self.queues.get_mut(entity) {
            for message in accepted {
                queue.enqueue(message);
            }
        } else if let Some(topic) = self.topics.get_mut(entity) {
            for store in topic.subscriptions.values_mut() {
                for message in &accepted {
                    store.enqueue(message.clone());
                }
            }
        }

        Ok(SendAck { message_ids })
    }
}

struct BrokerShared {
    config: InMemoryBrokerConfig,
    state: Mutex<BrokerState>,
    notify: Notify,
    next_channel_id: AtomicU64,
}

impl BrokerShared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-process broker; clones share the same entities
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                config,
                state: Mutex::new(BrokerState::new()),
                notify: Notify::new(),
                next_channel_id: AtomicU64::new(1),
            }),
        }
    }

    /// Require these shared access credentials when opening a channel
    pub fn with_credentials(self, key_name: impl Into<String>, key: impl Into<String>) -> Self {
        self.shared.state().credentials = Some(Credentials {
            key_name: key_name.into(),
            key: key.into(),
        });
        self
    }

    /// Present a certificate that only validates with verification disabled,
    /// as the local emulator does
    pub fn with_self_signed_certificate(self) -> Self {
        self.shared.state().self_signed_certificate = true;
        self
    }

    /// Broker configuration
    pub fn config(&self) -> &InMemoryBrokerConfig {
        &self.shared.config
    }

    /// Create a queue if it does not exist yet
    pub fn create_queue(&self, name: &str) -> Result<EntityName, ClientError> {
        let name = EntityName::new(name)?;
        let mut state = self.shared.state();

        if state.topics.contains_key(&name) {
            return Err(already_exists(&name));
        }

        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    /// Create a topic if it does not exist yet
    pub fn create_topic(&self, name: &str) -> Result<EntityName, ClientError> {
        let name = EntityName::new(name)?;
        let mut state = self.shared.state();

        if state.queues.contains_key(&name) {
            return Err(already_exists(&name));
        }

        state.topics.entry(name.clone()).or_default();
        Ok(name)
    }

    /// Create a subscription on an existing topic.
    ///
    /// The subscription only sees messages sent after it was created.
    pub fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<EntityRef, ClientError> {
        let topic = EntityName::new(topic)?;
        let subscription = SubscriptionName::new(subscription)?;
        let mut state = self.shared.state();

        let entry = state
            .topics
            .get_mut(&topic)
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: format!("topic '{}' does not exist", topic),
            })?;
        entry.subscriptions.entry(subscription.clone()).or_default();

        Ok(EntityRef::Subscription {
            topic,
            subscription,
        })
    }

    /// Fail the next `count` channel opens as unreachable
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.state().faults.opens = count;
    }

    /// Fail the next `count` sends with an I/O error
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.state().faults.sends = count;
    }

    /// Fail the next `count` receives with an I/O error
    pub fn fail_next_receives(&self, count: u32) {
        self.shared.state().faults.receives = count;
    }

    /// Fail the next `count` settlements with an I/O error
    pub fn fail_next_settles(&self, count: u32) {
        self.shared.state().faults.settles = count;
    }

    /// Messages still owned by the entity, locked or not
    pub fn active_message_count(&self, source: &EntityRef) -> usize {
        let now = Instant::now();
        self.shared
            .state()
            .store(source)
            .map_or(0, |store| store.active_count(now))
    }

    /// Messages dead-lettered from the entity, oldest first
    pub fn dead_letter_messages(&self, source: &EntityRef) -> Vec<Message> {
        self.shared.state().store(source).map_or_else(Vec::new, |store| {
            store
                .dead_letter
                .iter()
                .filter_map(|stored| Message::decode(&stored.payload).ok())
                .collect()
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

fn already_exists(name: &EntityName) -> ClientError {
    ValidationError::InvalidFormat {
        field: "entity_name".to_string(),
        message: format!("an entity named '{}' already exists", name),
    }
    .into()
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Channel>, TransportError> {
        let host = settings.connection_string.host();

        {
            let mut state = self.shared.state();

            if take_fault(&mut state.faults.opens) {
                return Err(TransportError::Unreachable(format!(
                    "{} did not respond",
                    host
                )));
            }

            if let Some(expected) = &state.credentials {
                let key_name = settings.connection_string.shared_access_key_name();
                let key = settings.connection_string.shared_access_key();
                if key_name != Some(expected.key_name.as_str()) || key != Some(expected.key.as_str())
                {
                    return Err(TransportError::Unauthorized(
                        "invalid shared access key".to_string(),
                    ));
                }
            }

            if state.self_signed_certificate && !settings.insecure_skip_verify {
                return Err(TransportError::Tls(format!(
                    "certificate for {} is signed by an unknown authority",
                    host
                )));
            }
        }

        let id = self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed);
        debug!(channel = id, host = host, "Opened in-memory channel");

        Ok(Arc::new(InMemoryChannel {
            id,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// InMemoryChannel
// ============================================================================

/// Channel handed out by [`InMemoryBroker`]
pub struct InMemoryChannel {
    id: u64,
    shared: Arc<BrokerShared>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn limits(&self) -> LinkLimits {
        self.shared.config.limits
    }

    async fn send(&self, entity: &EntityName, payload: Vec<Bytes>) -> Result<SendAck, TransportError> {
        self.ensure_open()?;

        let ack = {
            let mut state = self.shared.state();
            if take_fault(&mut state.faults.sends) {
                return Err(TransportError::Io("injected send failure".to_string()));
            }
            state.accept(entity, payload, &self.shared.config)?
        };

        self.shared.notify.notify_waiters();
        Ok(ack)
    }

    async fn receive(
        &self,
        source: &EntityRef,
        max_count: u32,
        deadline: Instant,
    ) -> Result<Vec<Delivery>, TransportError> {
        let max_count = usize::try_from(max_count).unwrap_or(usize::MAX);
        let config = &self.shared.config;

        loop {
            // Register for wake-ups before inspecting state so a send that
            // lands in between is not missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                self.ensure_open()?;
                let mut state = self.shared.state();

                if take_fault(&mut state.faults.receives) {
                    return Err(TransportError::Io("injected receive failure".to_string()));
                }

                let now = Instant::now();
                state.expire_locks(now, config.max_delivery_count);

                let store = state.store_mut(source)?;
                let deliveries = store.lock_next(max_count, now, config.lock_duration, self.id);
                let next_expiry = store.earliest_lock_deadline();

                if !deliveries.is_empty() || max_count == 0 {
                    for delivery in &deliveries {
                        state
                            .lock_index
                            .insert(delivery.lock_token.clone(), (source.clone(), self.id));
                    }
                    return Ok(deliveries);
                }

                if now >= deadline {
                    return Ok(Vec::new());
                }

                next_expiry.map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn settle(&self, lock_token: &LockToken, outcome: SettleOutcome) -> Result<(), TransportError> {
        self.ensure_open()?;
        let config = &self.shared.config;

        {
            let mut state = self.shared.state();

            if take_fault(&mut state.faults.settles) {
                return Err(TransportError::Io("injected settle failure".to_string()));
            }

            state.expire_locks(Instant::now(), config.max_delivery_count);

            let lock_lost = || TransportError::LockLost(lock_token.to_string());
            let (source, owner) = state.lock_index.get(lock_token).cloned().ok_or_else(lock_lost)?;
            if owner != self.id {
                return Err(lock_lost());
            }
            state.lock_index.remove(lock_token);

            let store = state.store_mut(&source)?;
            let locked = store.locked.remove(lock_token).ok_or_else(lock_lost)?;

            match outcome {
                SettleOutcome::Complete => {
                    debug!(entity = %source, message_id = %locked.message.message_id, "Message completed");
                }
                SettleOutcome::Abandon => {
                    store.release(locked.message, config.max_delivery_count);
                }
            }
        }

        if outcome == SettleOutcome::Abandon {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared
            .state()
            .release_locks_where(self.shared.config.max_delivery_count, |locked| {
                locked.owner == self.id
            });

        debug!(channel = self.id, "Closed in-memory channel");
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
