//! AMQP protocol brokers.
//!
//! This module contains broker implementations for AMQP-based brokers.
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

#[cfg(feature = "broker_lapin")]
mod lapin;

#[cfg(feature = "broker_lapin")]
pub use self::lapin::create_broker as create_lapin_broker;

#[cfg(not(feature = "broker_lapin"))]
pub fn create_lapin_broker(_config: crate::BrokerConfig) -> crate::Result<crate::BrokerPtr> {
    Err(crate::PubSubError::BrokerUnavailable(
        "broker_lapin feature is not enabled".into(),
    ))
}
