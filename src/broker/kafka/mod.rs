//! Kafka brokers.
//!
//! This module contains broker implementations for Apache Kafka.
//! Currently supports:
//! - rdkafka - librdkafka bindings

#[cfg(feature = "broker_kafka")]
mod rdkafka;

#[cfg(feature = "broker_kafka")]
pub use self::rdkafka::create_broker as create_kafka_broker;

#[cfg(not(feature = "broker_kafka"))]
pub fn create_kafka_broker(_config: crate::BrokerConfig) -> crate::Result<crate::BrokerPtr> {
    Err(crate::PubSubError::BrokerUnavailable(
        "broker_kafka feature is not enabled".into(),
    ))
}
