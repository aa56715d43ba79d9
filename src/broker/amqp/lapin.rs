//! AMQP broker implementation using `lapin`.
//!
//! This module provides an implementation of the `Broker` trait backed by an
//! AMQP 0-9-1 broker (RabbitMQ).
//!
//! ## Connection behavior
//!
//! Nothing is connected when the broker is created. Every `publish()` opens
//! its own connection and channel, publishes, and closes both again, whether
//! the publish succeeded or not. Every `open_session()` opens a dedicated
//! connection and channel that live exactly as long as the session.
//!
//! ## Queue semantics
//!
//! The group name is the queue name. Queues are declared on both the
//! publish and the consume path with:
//! - `durable: false` - messages not persisted to disk
//! - `exclusive: false` - multiple consumers allowed
//! - `auto_delete: false` - the queue outlives its consumers, so work
//!   enqueued while nobody listens is kept for the next session
//!
//! Publishes go through the default exchange with the queue name as routing
//! key. Consumers use auto-ack and a consumer tag derived from the session's
//! consumer identity.
//!
//! ## Deviations from the reference semantics
//!
//! - Sessions on the same queue are *competing* consumers: RabbitMQ
//!   round-robins messages between them instead of fanning out.
//! - The queue itself is the retained history; `StartPosition` has no
//!   further effect.

use futures_lite::stream::StreamExt;

use lapin::{
    //
    options::{
        //
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
};

use std::sync::Arc;

use bytes::Bytes;

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
};

/// Default AMQP endpoint when none is configured.
pub const DEFAULT_AMQP_URI: &str = "amqp://localhost:5672/%2f";

const REPLY_SUCCESS: u16 = 200;

/// AMQP implementation of the `Broker` trait.
pub struct AmqpBroker {
    // ---
    base: BrokerBase,
    uri: String,
}

impl AmqpBroker {
    /// Open a connection and a channel, closing the connection again if the
    /// channel cannot be created.
    async fn connect(&self) -> Result<(Connection, Channel)> {
        // ---
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                PubSubError::Connection(format!(
                    "[{}] amqp: connection to {} failed: {e}",
                    self.base.broker_id, self.uri
                ))
            })?;

        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel creation failed").await;
                Err(PubSubError::Connection(format!(
                    "[{}] amqp: channel creation failed: {e}",
                    self.base.broker_id
                )))
            }
        }
    }

    async fn publish_on(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
        // ---
        declare_queue(channel, queue).await?;

        let confirm = channel
            .basic_publish(
                "",    // default exchange
                queue, // routing key = queue name
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| PubSubError::Publish(format!("amqp: publish to {queue} failed: {e}")))?;

        confirm
            .await
            .map_err(|e| PubSubError::Publish(format!("amqp: publish to {queue} not confirmed: {e}")))?;

        Ok(())
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    // ---
    let queue_opts = QueueDeclareOptions {
        passive: false,
        durable: false,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    };

    channel
        .queue_declare(queue, queue_opts, FieldTable::default())
        .await
        .map_err(|e| PubSubError::Connection(format!("amqp: queue declare {queue} failed: {e}")))?;

    Ok(())
}

async fn close_quietly(channel: &Channel, connection: &Connection) {
    let _ = channel.close(REPLY_SUCCESS, "Normal shutdown").await;
    let _ = connection.close(REPLY_SUCCESS, "Normal shutdown").await;
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    // ---
    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn publish(&self, group: &GroupName, payload: Bytes) -> Result<()> {
        // ---
        let (connection, channel) = self.connect().await?;

        let result = Self::publish_on(&channel, group.as_str(), &payload).await;
        close_quietly(&channel, &connection).await;

        match &result {
            Ok(()) => {
                log_debug!("[{}] published to queue: {group}", self.base.broker_id);
            }
            Err(e) => {
                log_error!("[{}] {e}", self.base.broker_id);
            }
        }
        result
    }

    async fn open_session(&self, group: &GroupName, consumer: &ConsumerId) -> Result<SessionPtr> {
        // ---
        let (connection, channel) = self.connect().await?;

        let consumed = async {
            declare_queue(&channel, group.as_str()).await?;

            let options = BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            };

            channel
                .basic_consume(
                    group.as_str(),
                    consumer.as_str(),
                    options,
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PubSubError::Connection(format!("amqp: consume {group} failed: {e}")))
        }
        .await;

        match consumed {
            Ok(stream) => {
                log_info!(
                    "[{}] consuming queue {group} as {consumer}",
                    self.base.broker_id
                );
                Ok(Box::new(AmqpSession {
                    connection,
                    channel,
                    consumer: stream,
                }))
            }
            Err(e) => {
                close_quietly(&channel, &connection).await;
                Err(e)
            }
        }
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait::async_trait]
impl Session for AmqpSession {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        // ---
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Bytes::from(delivery.data))),
            Some(Err(e)) => Err(PubSubError::Session(format!("amqp: consumer error: {e}"))),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        close_quietly(&self.channel, &self.connection).await;
    }
}

/// Creates a lapin-based AMQP broker from the given configuration.
///
/// An empty URI falls back to [`DEFAULT_AMQP_URI`]. No connection is made
/// here; see the module docs.
pub fn create_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---
    let uri = if config.uri.is_empty() {
        DEFAULT_AMQP_URI.to_string()
    } else {
        config.uri.clone()
    };

    log_info!("[{}] create amqp broker for {uri}", config.broker_id);

    Ok(Arc::new(AmqpBroker {
        base: BrokerBase::from(&config),
        uri,
    }))
}
