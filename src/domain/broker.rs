// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the contract every backing broker implements. It
//! intentionally avoids any reference to concrete protocols or client
//! libraries; those live under `src/broker/`.
//!
//! A broker knows two things only:
//!
//! - how to deliver one opaque payload to a group through a transient,
//!   scoped session (`publish`), and
//! - how to open a consume session for a group under a given consumer
//!   identity (`open_session`).
//!
//! Typed messages, the encoding policy, and the reconnect loop are handled
//! one layer up by [`Provider`](crate::Provider).
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::{ConsumerId, GroupName, Result};

/// Where a fresh consume session starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Replay the retained history the broker still holds, then follow new
    /// messages. Prevents silently skipping work enqueued before the first
    /// connect.
    #[default]
    Earliest,

    /// Only messages published after the session is established.
    Latest,
}

/// Configuration for creating a broker instance.
///
/// Passed to broker factory functions (`create_*_broker()`). Immutable once
/// the broker is built.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Broker endpoint (e.g. `"amqp://localhost:5672/%2f"`, `"localhost:9092"`).
    pub uri: String,
    /// Identifier used as a prefix in log output.
    pub broker_id: String,
    /// Read position for newly opened consume sessions.
    pub start_position: StartPosition,
    /// Broker-specific connection/auth parameters, passed through untouched.
    pub options: BTreeMap<String, String>,
}

impl BrokerConfig {
    /// Create a configuration for the given endpoint with default settings.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            broker_id: "mom-pubsub".to_string(),
            start_position: StartPosition::default(),
            options: BTreeMap::new(),
        }
    }
}

/// Shared base state for all broker implementations.
///
/// Each concrete broker embeds this as a field named `base`:
///
/// ```ignore
/// struct KafkaBroker {
///     base: BrokerBase,
///     // ... kafka specific fields
/// }
///
/// impl Broker for KafkaBroker {
///     fn base(&self) -> &BrokerBase { &self.base }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct BrokerBase {
    /// Identifier of this broker instance, for logging.
    pub broker_id: String,
    /// Read position for newly opened consume sessions.
    pub start_position: StartPosition,
}

impl From<&BrokerConfig> for BrokerBase {
    fn from(config: &BrokerConfig) -> Self {
        // ---
        Self {
            broker_id: config.broker_id.clone(),
            start_position: config.start_position,
        }
    }
}

/// One live consume session.
///
/// A session owns its broker connection exclusively. It is created by
/// [`Broker::open_session`], driven by exactly one subscription loop, and
/// closed when the loop reconnects or stops.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Wait for the next payload.
    ///
    /// - `Ok(Some(bytes))` - a message arrived
    /// - `Ok(None)` - the broker ended the session (connection dropped,
    ///   consumer cancelled)
    /// - `Err(_)` - I/O or protocol failure
    ///
    /// Must be cancel safe: the loop may drop the future when it is asked
    /// to stop.
    async fn next_message(&mut self) -> Result<Option<Bytes>>;

    /// Release the session's broker resources. Best effort, never fails.
    async fn close(&mut self);
}

/// Owned session pointer handed to the subscription loop.
pub type SessionPtr = Box<dyn Session>;

/// Broker abstraction.
///
/// Implementations must ensure that:
/// - `publish()` acquires its connection per call and releases it on every
///   exit path, including failure;
/// - `open_session()` creates a brand-new connection per call, never shared
///   with publishes or other sessions;
/// - group names are passed to the native addressing unchanged.
///
/// The in-memory broker serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &BrokerBase;

    /// Returns the broker_id of the broker.
    fn broker_id(&self) -> &str {
        &self.base().broker_id
    }

    /// Returns the configured read position for new sessions.
    fn start_position(&self) -> StartPosition {
        self.base().start_position
    }

    /// Publish one payload to the group through a transient session.
    async fn publish(&self, group: &GroupName, payload: Bytes) -> Result<()>;

    /// Open a fresh consume session bound to `group` under `consumer`.
    ///
    /// A subscription reuses its consumer identity for every session it
    /// opens, so brokers that track read positions per consumer resume
    /// where the previous session stopped.
    async fn open_session(&self, group: &GroupName, consumer: &ConsumerId) -> Result<SessionPtr>;

    /// Forget any per-consumer state kept for `consumer` on `group`.
    ///
    /// Called once when a subscription stops for good. The default does
    /// nothing; brokers that keep their own consumer state broker-side
    /// (Kafka committed offsets) leave it to the broker's expiry.
    async fn forget_consumer(&self, _group: &GroupName, _consumer: &ConsumerId) {}
}

/// Shared broker pointer.
///
/// This is an `Arc<dyn Broker>`: cloning only bumps a reference count, and
/// the broker configuration it holds is read-only, so one pointer is safely
/// shared by every send and every subscription of a provider.
pub type BrokerPtr = Arc<dyn Broker>;
