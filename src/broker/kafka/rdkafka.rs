//! Kafka broker implementation using `rdkafka`.
//!
//! The group name is the Kafka topic. Each publish builds its own
//! `FutureProducer`, waits for the delivery report and drops the producer
//! again. Each session builds its own `StreamConsumer` whose consumer-group
//! id is the subscription's consumer identity, so parallel subscriptions on
//! one topic all receive every record.
//!
//! The identity is stable across reconnects and offsets are auto-committed,
//! so a reopened session resumes at the group's committed offset.
//! `StartPosition` maps onto `auto.offset.reset` (`earliest` / `latest`) and
//! only decides where a subscription's first session starts.
//! Entries in [`BrokerConfig::options`] are copied into the librdkafka
//! client configuration as-is (e.g. `security.protocol`, `sasl.username`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rdkafka::{
    //
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
};

use crate::{
    //
    log_debug,
    log_error,
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

/// Default bootstrap servers when none are configured.
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Kafka implementation of the `Broker` trait.
pub struct KafkaBroker {
    // ---
    base: BrokerBase,
    bootstrap_servers: String,
    options: BTreeMap<String, String>,
}

impl KafkaBroker {
    fn client_config(&self) -> ClientConfig {
        // ---
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        for (key, value) in &self.options {
            config.set(key, value);
        }
        config
    }
}

#[async_trait::async_trait]
impl Broker for KafkaBroker {
    // ---
    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn publish(&self, group: &GroupName, payload: Bytes) -> Result<()> {
        // ---
        let producer: FutureProducer = self.client_config().create().map_err(|e| {
            PubSubError::Connection(format!(
                "[{}] kafka: producer creation failed: {e}",
                self.base.broker_id
            ))
        })?;

        let record = FutureRecord::<(), [u8]>::to(group.as_str()).payload(&payload[..]);

        match producer.send(record, DELIVERY_TIMEOUT).await {
            Ok(_) => {
                log_debug!("[{}] produced to topic {group}", self.base.broker_id);
                Ok(())
            }
            Err((e, _)) => {
                let msg = format!("[{}] kafka: produce to {group} failed: {e}", self.base.broker_id);
                log_error!("{msg}");
                Err(PubSubError::Publish(msg))
            }
        }
    }

    async fn open_session(&self, group: &GroupName, consumer: &ConsumerId) -> Result<SessionPtr> {
        // ---
        let offset_reset = match self.start_position() {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        };

        let stream: StreamConsumer = self
            .client_config()
            .set("group.id", consumer.as_str())
            .set("auto.offset.reset", offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| {
                PubSubError::Connection(format!(
                    "[{}] kafka: consumer creation failed: {e}",
                    self.base.broker_id
                ))
            })?;

        stream.subscribe(&[group.as_str()]).map_err(|e| {
            PubSubError::Connection(format!(
                "[{}] kafka: subscribe to {group} failed: {e}",
                self.base.broker_id
            ))
        })?;

        log_info!(
            "[{}] consuming topic {group} as group {consumer} from {offset_reset}",
            self.base.broker_id
        );

        Ok(Box::new(KafkaSession { consumer: stream }))
    }
}

struct KafkaSession {
    consumer: StreamConsumer,
}

#[async_trait::async_trait]
impl Session for KafkaSession {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        // ---
        match self.consumer.recv().await {
            Ok(message) => {
                let payload = message.payload().map(Bytes::copy_from_slice).unwrap_or_default();
                Ok(Some(payload))
            }
            Err(e) => Err(PubSubError::Session(format!("kafka: consume failed: {e}"))),
        }
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}

/// Creates an rdkafka-based broker from the given configuration.
///
/// An empty URI falls back to [`DEFAULT_BOOTSTRAP_SERVERS`]. No connection is
/// made here.
pub fn create_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---
    let bootstrap_servers = if config.uri.is_empty() {
        DEFAULT_BOOTSTRAP_SERVERS.to_string()
    } else {
        config.uri.clone()
    };

    log_info!("[{}] create kafka broker for {bootstrap_servers}", config.broker_id);

    Ok(Arc::new(KafkaBroker {
        base: BrokerBase::from(&config),
        bootstrap_servers,
        options: config.options.clone(),
    }))
}
