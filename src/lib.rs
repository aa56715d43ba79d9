//! Broker-agnostic publish/subscribe with self-healing subscriptions.
//!
//! This library lets application code send and receive typed messages
//! without depending on a specific broker client. It handles the
//! text-versus-serialized encoding decision, runs one background loop per
//! subscription that reconnects after connection loss, and dispatches every
//! inbound message to the handler on its own task.
//!
//! Brokers:
//! - in-memory (always available, also used for tests)
//! - AMQP 0-9-1 via `lapin` (feature `broker_lapin`)
//! - Kafka via `rdkafka` (feature `broker_kafka`)
//! - Redis Pub/Sub via `redis` (feature `broker_redis`)
//!

// Import all sub modules once...
mod broker;
mod domain;
mod encoding;
mod subscription;

mod provider;
mod provider_builder;

mod error;
mod identity;
mod macros;
mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use provider::{Provider, UnsubscribeMode};
pub use provider_builder::ProviderBuilder;

pub use encoding::{JsonSerializer, PayloadKind, TextSerializer};
pub use error::{PubSubError, Result};
pub use identity::{ConsumerId, SubscriptionId};
pub use retry::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use subscription::{LoopState, Subscription, SubscriptionStats};

pub use broker::{
    //
    create_kafka_broker,
    create_lapin_broker,
    create_memory_broker,
    create_memory_broker_with_hub,
    create_redis_broker,
    MemoryHub,
    DEFAULT_MEMORY_RETENTION,
};

// --- public re-exports
pub use domain::{
    //
    handler_fn,
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    GroupName,
    HandlerFn,
    MessageHandler,
    MessageRequest,
    Session,
    SessionPtr,
    StartPosition,
    SubscribeRequest,
};
