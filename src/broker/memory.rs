//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Broker` trait. It is intended primarily for testing, local execution,
//! and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the broker
//! layer. All other implementations are expected to approximate this
//! behavior as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! - Every published payload is appended to the group's retained history
//!   under the next offset.
//! - Every open session on a group receives every payload published while
//!   it is open (fan-out per consumer identity, like Kafka consumer groups).
//! - The hub remembers, per consumer identity, the offset after the last
//!   payload a session actually took off its stream. A session reopened
//!   under a known identity resumes there; payloads that were queued for a
//!   dropped session but never received are delivered again.
//! - A session opened under an unknown identity starts at the configured
//!   [`StartPosition`]: `Earliest` replays the retained history in publish
//!   order, `Latest` waits for new payloads.
//! - At most `retention` payloads are kept per group; older ones are
//!   discarded. A live session that falls behind the window resumes at the
//!   oldest retained payload. A detached identity whose position fell out of
//!   the window is forgotten, and its next session starts at the
//!   `StartPosition` again, the way Kafka treats expired group offsets.
//! - A group is dropped from the hub once it has no retained payloads, no
//!   known consumers and no open sessions.
//!
//! ## Fault injection
//!
//! [`MemoryHub`] can simulate an unreachable broker, a slow connect, a
//! broker-side connection drop and an I/O failure on live sessions, so the
//! subscription loop's recovery paths can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_info,
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    ConsumerId,
    GroupName,
    PubSubError,
    Result,
    Session,
    SessionPtr,
    StartPosition,
};

/// Payloads retained per group by [`MemoryHub::new`].
pub const DEFAULT_MEMORY_RETENTION: usize = 10_000;

/// What a memory session can receive.
enum Delivery {
    Message { offset: u64, payload: Bytes },
    Fault(String),
}

struct ConsumerSlot {
    consumer: ConsumerId,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct GroupState {
    retained: VecDeque<Bytes>,
    /// Offset of `retained[0]`.
    first_offset: u64,
    /// Next offset to deliver, per consumer identity.
    cursors: HashMap<ConsumerId, u64>,
    consumers: Vec<ConsumerSlot>,
}

impl GroupState {
    fn next_offset(&self) -> u64 {
        self.first_offset + self.retained.len() as u64
    }

    fn is_idle(&self) -> bool {
        self.retained.is_empty() && self.cursors.is_empty() && self.consumers.is_empty()
    }

    /// Enforce the retention window and forget detached consumers that
    /// fell out of it.
    fn trim(&mut self, retention: usize) {
        // ---
        while self.retained.len() > retention {
            self.retained.pop_front();
            self.first_offset += 1;
        }

        let first_offset = self.first_offset;
        let consumers = &self.consumers;
        self.cursors.retain(|consumer, offset| {
            *offset >= first_offset || consumers.iter().any(|slot| &slot.consumer == consumer)
        });
    }
}

/// Shared message bus for the in-memory broker.
///
/// Simulates a message broker within a single process. All memory brokers
/// that share a `MemoryHub` see each other's messages, exactly as nodes
/// connected to a real broker would.
///
/// For tests that run in parallel, construct a hub per test and hand it to
/// [`create_memory_broker_with_hub`] or
/// [`ProviderBuilder::memory_hub`](crate::ProviderBuilder::memory_hub):
///
/// ```
/// # use mom_pubsub::{MemoryHub, ProviderBuilder};
/// let hub = MemoryHub::with_retention(100);
/// let provider = ProviderBuilder::new()
///     .memory_hub(hub.clone())
///     .build()
///     .unwrap();
/// ```
pub struct MemoryHub {
    // ---
    groups: Mutex<HashMap<GroupName, GroupState>>,
    retention: usize,
    reachable: AtomicBool,
    connect_delay: Mutex<Duration>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryHub {
    /// Create a new, empty hub keeping [`DEFAULT_MEMORY_RETENTION`]
    /// payloads per group.
    pub fn new() -> Arc<Self> {
        // ---
        Self::with_retention(DEFAULT_MEMORY_RETENTION)
    }

    /// Create a new, empty hub keeping at most `retention` payloads per
    /// group.
    pub fn with_retention(retention: usize) -> Arc<Self> {
        // ---
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
            retention,
            reachable: AtomicBool::new(true),
            connect_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Make the hub accept (`true`) or refuse (`false`) new connections.
    ///
    /// While unreachable, publishes fail with a connection error and new
    /// sessions cannot be opened. Sessions already open are left alone; use
    /// [`drop_sessions`](Self::drop_sessions) to sever them.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every connection attempt (publish and session open) by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock_ignore_poison(&self.connect_delay) = delay;
    }

    /// Broker-side drop of every open session on `group`.
    ///
    /// The sessions drain what was already queued for them and then see
    /// their stream end, as if the broker closed the connection. Returns the
    /// number of sessions dropped.
    pub fn drop_sessions(&self, group: &GroupName) -> usize {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        match groups.get_mut(group) {
            Some(state) => {
                let dropped = state.consumers.len();
                state.consumers.clear();
                dropped
            }
            None => 0,
        }
    }

    /// Fail every open session on `group` with an I/O error.
    ///
    /// Returns the number of sessions failed.
    pub fn fail_sessions(&self, group: &GroupName, reason: &str) -> usize {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        match groups.get_mut(group) {
            Some(state) => {
                let failed = state.consumers.len();
                for slot in state.consumers.drain(..) {
                    let _ = slot.tx.send(Delivery::Fault(reason.to_string()));
                }
                failed
            }
            None => 0,
        }
    }

    /// Number of sessions currently open on `group`.
    pub fn session_count(&self, group: &GroupName) -> usize {
        // ---
        let groups = lock_ignore_poison(&self.groups);
        groups
            .get(group)
            .map(|state| state.consumers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of payloads retained for `group`.
    pub fn retained_count(&self, group: &GroupName) -> usize {
        let groups = lock_ignore_poison(&self.groups);
        groups.get(group).map(|state| state.retained.len()).unwrap_or(0)
    }

    /// Number of groups the hub currently keeps state for.
    pub fn group_count(&self) -> usize {
        lock_ignore_poison(&self.groups).len()
    }

    async fn connect(&self, broker_id: &str) -> Result<()> {
        // ---
        let delay = *lock_ignore_poison(&self.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(PubSubError::Connection(format!(
                "{broker_id}: memory hub is unreachable"
            )));
        }
        Ok(())
    }

    fn publish(&self, group: &GroupName, payload: Bytes) {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        let state = groups.entry(group.clone()).or_default();

        let offset = state.next_offset();
        state.retained.push_back(payload.clone());

        // A closed channel indicates a session that went away without
        // calling close(); prune it.
        state.consumers.retain(|slot| {
            let delivery = Delivery::Message {
                offset,
                payload: payload.clone(),
            };
            slot.tx.send(delivery).is_ok()
        });

        state.trim(self.retention);
    }

    fn attach(
        &self,
        group: &GroupName,
        consumer: &ConsumerId,
        start: StartPosition,
    ) -> mpsc::UnboundedReceiver<Delivery> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();

        let mut groups = lock_ignore_poison(&self.groups);
        let state = groups.entry(group.clone()).or_default();

        let from = match state.cursors.get(consumer) {
            Some(&cursor) => cursor.max(state.first_offset),
            None => match start {
                StartPosition::Earliest => state.first_offset,
                StartPosition::Latest => state.next_offset(),
            },
        };
        state.cursors.insert(consumer.clone(), from);

        let skip = usize::try_from(from - state.first_offset).unwrap_or(usize::MAX);
        for (index, payload) in state.retained.iter().enumerate().skip(skip) {
            let _ = tx.send(Delivery::Message {
                offset: state.first_offset + index as u64,
                payload: payload.clone(),
            });
        }

        // One live session per consumer identity.
        state.consumers.retain(|slot| &slot.consumer != consumer);
        state.consumers.push(ConsumerSlot {
            consumer: consumer.clone(),
            tx,
        });
        rx
    }

    /// Record that `consumer` received the payload at `offset`.
    fn commit(&self, group: &GroupName, consumer: &ConsumerId, offset: u64) {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        if let Some(state) = groups.get_mut(group) {
            let cursor = state.cursors.entry(consumer.clone()).or_insert(0);
            *cursor = (*cursor).max(offset + 1);
        }
    }

    fn forget(&self, group: &GroupName, consumer: &ConsumerId) {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        if let Some(state) = groups.get_mut(group) {
            state.cursors.remove(consumer);
            state.consumers.retain(|slot| &slot.consumer != consumer);
            if state.is_idle() {
                groups.remove(group);
            }
        }
    }

    /// Drop slots whose session closed its receiver.
    fn detach(&self, group: &GroupName) {
        // ---
        let mut groups = lock_ignore_poison(&self.groups);
        if let Some(state) = groups.get_mut(group) {
            state.consumers.retain(|slot| !slot.tx.is_closed());
            if state.is_idle() {
                groups.remove(group);
            }
        }
    }
}

/// Process-global hub used by [`create_memory_broker`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory broker.
///
/// Routes payloads through a shared [`MemoryHub`].
struct MemoryBroker {
    // ---
    base: BrokerBase,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn publish(&self, group: &GroupName, payload: Bytes) -> Result<()> {
        // ---
        self.hub.connect(self.broker_id()).await?;

        log_debug!("[{}] publish {} bytes to {group}", self.broker_id(), payload.len());
        self.hub.publish(group, payload);
        Ok(())
    }

    async fn open_session(&self, group: &GroupName, consumer: &ConsumerId) -> Result<SessionPtr> {
        // ---
        self.hub.connect(self.broker_id()).await?;

        let rx = self.hub.attach(group, consumer, self.start_position());
        log_debug!("[{}] session {consumer} attached to {group}", self.broker_id());

        Ok(Box::new(MemorySession {
            group: group.clone(),
            consumer: consumer.clone(),
            hub: Arc::clone(&self.hub),
            rx,
        }))
    }

    async fn forget_consumer(&self, group: &GroupName, consumer: &ConsumerId) {
        // ---
        self.hub.forget(group, consumer);
        log_debug!("[{}] forgot consumer {consumer} on {group}", self.broker_id());
    }
}

struct MemorySession {
    group: GroupName,
    consumer: ConsumerId,
    hub: Arc<MemoryHub>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        // ---
        match self.rx.recv().await {
            Some(Delivery::Message { offset, payload }) => {
                self.hub.commit(&self.group, &self.consumer, offset);
                Ok(Some(payload))
            }
            Some(Delivery::Fault(reason)) => Err(PubSubError::Session(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        // ---
        self.rx.close();
        self.hub.detach(&self.group);
    }
}

/// Create a new in-memory broker on the process-global hub.
///
/// All brokers created with this function share a single message bus,
/// matching the semantics of nodes connected to a real broker.
///
/// # Errors
///
/// Currently infallible - always returns `Ok`.
pub fn create_memory_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---
    create_memory_broker_with_hub(config, global_hub())
}

/// Create a new in-memory broker on the provided hub.
///
/// # Errors
///
/// Currently infallible - always returns `Ok`.
pub fn create_memory_broker_with_hub(config: BrokerConfig, hub: Arc<MemoryHub>) -> Result<BrokerPtr> {
    // ---
    log_info!("[{}] create memory broker", config.broker_id);

    Ok(Arc::new(MemoryBroker {
        base: BrokerBase::from(&config),
        hub,
    }))
}
