//! Redis protocol brokers.
//!
//! This module contains broker implementations for Redis.
//! Currently supports:
//! - redis - Redis Pub/Sub via redis library (redis.rs)

#[cfg(feature = "broker_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "broker_redis")]
pub use self::redis::create_broker as create_redis_broker;

#[cfg(not(feature = "broker_redis"))]
pub fn create_redis_broker(_config: crate::BrokerConfig) -> crate::Result<crate::BrokerPtr> {
    Err(crate::PubSubError::BrokerUnavailable(
        "broker_redis feature is not enabled".into(),
    ))
}
