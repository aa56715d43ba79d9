//! Redis Pub/Sub broker implementation using `redis`.
//!
//! The group name is the Redis channel.
//!
//! ## Two connections required
//!
//! Redis mandates a dedicated connection for Pub/Sub: a connection in
//! Pub/Sub mode cannot issue regular commands like `PUBLISH`. Publishes
//! therefore open a short-lived `MultiplexedConnection` per call, while each
//! session opens its own `aio::PubSub` connection, split into a sink (used
//! for `SUBSCRIBE`/`UNSUBSCRIBE`) and a stream (polled for data messages).
//!
//! In redis 1.0, `PubSubSink::subscribe()` resolves only after the broker
//! confirms the subscription, so a session is listening as soon as
//! `open_session()` returns.
//!
//! ## Deviations from the reference semantics
//!
//! Redis Pub/Sub keeps no history: messages published while no session is
//! subscribed are lost, and `StartPosition::Earliest` behaves like
//! `Latest`.

use futures_util::StreamExt;

use redis::aio::{PubSubSink, PubSubStream};

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
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

/// Default Redis endpoint when none is configured.
pub const DEFAULT_REDIS_URI: &str = "redis://127.0.0.1:6379/";

/// Redis Pub/Sub implementation of the `Broker` trait.
pub struct RedisBroker {
    // ---
    base: BrokerBase,
    client: redis::Client,
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    // ---
    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn publish(&self, group: &GroupName, payload: Bytes) -> Result<()> {
        // ---
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                PubSubError::Connection(format!(
                    "[{}] redis: failed to connect publish connection: {err}",
                    self.base.broker_id
                ))
            })?;

        redis::cmd("PUBLISH")
            .arg(group.as_str())
            .arg(&payload[..])
            .query_async::<i64>(&mut conn)
            .await
            .map(|_receivers| {
                log_debug!(
                    "[{}] published to channel {group} ({_receivers} receivers)",
                    self.base.broker_id
                );
            })
            .map_err(|err| {
                let msg = format!(
                    "[{}] redis: publish failed for channel {group}: {err}",
                    self.base.broker_id
                );
                log_error!("{msg}");
                PubSubError::Publish(msg)
            })
    }

    async fn open_session(&self, group: &GroupName, consumer: &ConsumerId) -> Result<SessionPtr> {
        // ---
        if self.start_position() == StartPosition::Earliest {
            log_debug!(
                "[{}] redis keeps no history, {group} starts at latest",
                self.base.broker_id
            );
        }

        let (mut sink, stream) = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| {
                PubSubError::Connection(format!(
                    "[{}] redis: failed to connect pubsub connection: {err}",
                    self.base.broker_id
                ))
            })?
            .split();

        sink.subscribe(group.as_str()).await.map_err(|err| {
            PubSubError::Connection(format!(
                "[{}] redis: failed to subscribe to channel {group}: {err}",
                self.base.broker_id
            ))
        })?;

        log_info!(
            "[{}] session {consumer} subscribed to channel {group}",
            self.base.broker_id
        );

        Ok(Box::new(RedisSession {
            group: group.clone(),
            sink,
            stream,
        }))
    }
}

struct RedisSession {
    group: GroupName,
    sink: PubSubSink,
    stream: PubSubStream,
}

#[async_trait::async_trait]
impl Session for RedisSession {
    async fn next_message(&mut self) -> Result<Option<Bytes>> {
        // ---
        // The stream only yields data messages; it ends when the
        // connection is lost.
        Ok(self
            .stream
            .next()
            .await
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes())))
    }

    async fn close(&mut self) {
        // ---
        if let Err(_err) = self.sink.unsubscribe(self.group.as_str()).await {
            log_warn!("redis: unsubscribe from {} failed: {_err}", self.group);
        }
    }
}

/// Creates a Redis Pub/Sub broker from the given configuration.
///
/// An empty URI falls back to [`DEFAULT_REDIS_URI`].
///
/// # Errors
///
/// Returns an error if the URI cannot be parsed. No connection is made here.
pub fn create_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---
    let uri = if config.uri.is_empty() {
        DEFAULT_REDIS_URI
    } else {
        config.uri.as_str()
    };

    let client = redis::Client::open(uri).map_err(|err| {
        let msg = format!("redis: failed to open client for URI {uri}: {err}");
        log_error!("{msg}");
        PubSubError::Connection(msg)
    })?;

    log_info!("[{}] create redis broker for {uri}", config.broker_id);

    Ok(Arc::new(RedisBroker {
        base: BrokerBase::from(&config),
        client,
    }))
}
