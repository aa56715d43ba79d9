//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Broker` trait. Network brokers are hidden behind feature flags and
//! exposed only through constructor functions; a disabled broker's
//! constructor returns `PubSubError::BrokerUnavailable`.
//!
//! Domain code must not depend on broker-specific types.

mod amqp;
mod kafka;
mod memory;
mod redis;

pub use amqp::create_lapin_broker;
pub use kafka::create_kafka_broker;
pub use memory::{create_memory_broker, create_memory_broker_with_hub, MemoryHub, DEFAULT_MEMORY_RETENTION};
pub use redis::create_redis_broker;
