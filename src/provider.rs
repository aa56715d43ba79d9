//! Typed publish/subscribe provider.
//!
//! [`Provider`] is the front door of the crate. It turns typed messages into
//! wire payloads with the encoding policy, hands them to the broker, and runs
//! one background loop per subscription.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::encoding::{self, JsonSerializer, TextSerializer};
use crate::subscription::runner::SubscriptionLoop;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    BrokerPtr,
    ConsumerId,
    GroupName,
    LoopState,
    MessageHandler,
    MessageRequest,
    PubSubError,
    ReconnectPolicy,
    Result,
    SubscribeRequest,
    Subscription,
    SubscriptionId,
    SubscriptionStats,
};

/// What `unsubscribe` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsubscribeMode {
    /// `unsubscribe` always fails with [`PubSubError::Unsupported`] and the
    /// subscriptions keep running.
    #[default]
    Unsupported,

    /// `unsubscribe` cancels every loop the provider runs for the group.
    Cancel,
}

/// Live loops per group. Each entry is the subscription id and the token
/// that stops its loop.
type Registry = HashMap<GroupName, Vec<(SubscriptionId, CancellationToken)>>;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Broker-agnostic publish/subscribe provider.
///
/// Cloning is cheap; clones share the broker, the serializer and the
/// subscription registry.
///
/// # Example
///
/// ```no_run
/// use mom_pubsub::{handler_fn, MessageRequest, ProviderBuilder, SubscribeRequest};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let provider = ProviderBuilder::new().broker_type("memory").build()?;
///
/// provider
///     .subscribe(
///         SubscribeRequest::new("orders"),
///         handler_fn(|text: String| async move {
///             println!("received {text}");
///             Ok(())
///         }),
///     )
///     .await?;
///
/// provider.send(MessageRequest::new("orders", "hello")).await?;
/// # Ok(())
/// # }
/// ```
pub struct Provider<S = JsonSerializer> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    broker: BrokerPtr,
    serializer: Arc<S>,
    reconnect_policy: ReconnectPolicy,
    unsubscribe_mode: UnsubscribeMode,
    shutdown: CancellationToken,
    subscriptions: Mutex<Registry>,
}

impl<S> Clone for Provider<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TextSerializer> Provider<S> {
    /// Create a provider over a ready broker with default loop settings.
    pub fn new(broker: BrokerPtr, serializer: S) -> Self {
        Self::with_settings(
            broker,
            serializer,
            ReconnectPolicy::default(),
            UnsubscribeMode::default(),
        )
    }

    pub(crate) fn with_settings(
        broker: BrokerPtr,
        serializer: S,
        reconnect_policy: ReconnectPolicy,
        unsubscribe_mode: UnsubscribeMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                serializer: Arc::new(serializer),
                reconnect_policy,
                unsubscribe_mode,
                shutdown: CancellationToken::new(),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identifier of the underlying broker, as used in log output.
    pub fn broker_id(&self) -> &str {
        self.inner.broker.broker_id()
    }

    /// Publish one message.
    ///
    /// Text (`String`, `&'static str`) goes on the wire verbatim; any other
    /// type is serialized exactly once. The broker opens a transient session
    /// for this call only. Nothing is retried.
    ///
    /// Messages must be `'static`, so borrowed text with a shorter lifetime
    /// is sent as an owned `String`:
    ///
    /// ```
    /// use mom_pubsub::{MemoryHub, MessageRequest, ProviderBuilder};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> mom_pubsub::Result<()> {
    /// let provider = ProviderBuilder::new().memory_hub(MemoryHub::new()).build()?;
    ///
    /// let line = String::from("id=7;qty=2\n");
    /// let borrowed: &str = line.trim_end();
    ///
    /// provider
    ///     .send(MessageRequest::new("orders", borrowed.to_owned()))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// - [`PubSubError::EmptyGroupName`] for an empty group name
    /// - [`PubSubError::Encode`] if the message cannot be serialized
    /// - [`PubSubError::Connection`] / [`PubSubError::Publish`] from the broker
    pub async fn send<T>(&self, request: MessageRequest<T>) -> Result<()>
    where
        T: Serialize + Send + 'static,
    {
        // ---
        let MessageRequest {
            group_name,
            message,
        } = request;

        group_name.validate()?;

        let payload = encoding::encode(message, &*self.inner.serializer).inspect_err(|_err| {
            log_error!("[{}] {group_name}: {_err}", self.broker_id());
        })?;

        self.inner.broker.publish(&group_name, payload).await
    }

    /// Start consuming a group.
    ///
    /// Spawns the subscription loop and returns its handle without waiting
    /// for the first connection attempt. The loop reconnects on its own
    /// until it is cancelled by [`unsubscribe`](Self::unsubscribe) (cancel
    /// mode), by [`shutdown`](Self::shutdown), or until a bounded
    /// reconnect policy gives up.
    ///
    /// The subscription presents one [`ConsumerId`] to the broker for its
    /// whole lifetime. A reconnect resumes after the last message the
    /// previous session received; the configured start position only
    /// applies to the first session.
    ///
    /// Dropping the returned [`Subscription`] does not stop the loop.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::EmptyGroupName`] for an empty group name.
    pub async fn subscribe<T, H>(&self, request: SubscribeRequest, handler: H) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        // ---
        let group = request.group_name;
        group.validate()?;

        let id = SubscriptionId::generate();
        let consumer = ConsumerId::generate();
        let cancel = self.inner.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(LoopState::Connecting);
        let stats = Arc::new(SubscriptionStats::default());

        self.register(&group, &id, &cancel);

        let task = SubscriptionLoop::<T, H, S> {
            broker: Arc::clone(&self.inner.broker),
            group: group.clone(),
            consumer: consumer.clone(),
            handler: Arc::new(handler),
            serializer: Arc::clone(&self.inner.serializer),
            policy: self.inner.reconnect_policy.clone(),
            cancel,
            state: state_tx,
            stats: Arc::clone(&stats),
            _message: PhantomData,
        }
        .spawn();

        log_info!(
            "[{}] subscription {id} started for {group} as {consumer}",
            self.broker_id()
        );

        Ok(Subscription::new(id, group, consumer, state_rx, stats, task))
    }

    /// Stop consuming a group.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::Unsupported`] in [`UnsubscribeMode::Unsupported`]
    ///   (the default); the subscriptions keep running
    /// - [`PubSubError::NotSubscribed`] in [`UnsubscribeMode::Cancel`] when
    ///   no loop is running for the group
    pub fn unsubscribe(&self, request: &SubscribeRequest) -> Result<()> {
        // ---
        let group = &request.group_name;

        match self.inner.unsubscribe_mode {
            UnsubscribeMode::Unsupported => Err(PubSubError::Unsupported("unsubscribe")),
            UnsubscribeMode::Cancel => {
                let entries = lock_ignore_poison(&self.inner.subscriptions)
                    .remove(group)
                    .unwrap_or_default();

                let mut cancelled = 0usize;
                for (_id, token) in entries {
                    if !token.is_cancelled() {
                        token.cancel();
                        cancelled += 1;
                        log_debug!("[{}] cancelled subscription {_id}", self.broker_id());
                    }
                }

                if cancelled == 0 {
                    return Err(PubSubError::NotSubscribed(group.to_string()));
                }

                log_info!(
                    "[{}] unsubscribed {cancelled} loop(s) from {group}",
                    self.broker_id()
                );
                Ok(())
            }
        }
    }

    /// Number of loops still running for `group`.
    pub fn active_subscriptions(&self, group: &GroupName) -> usize {
        // ---
        let mut registry = lock_ignore_poison(&self.inner.subscriptions);
        prune(&mut registry);
        registry.get(group).map_or(0, Vec::len)
    }

    /// Cancel every subscription loop started by this provider or its clones.
    ///
    /// Sends are unaffected. Subscribing after shutdown returns a
    /// subscription that stops immediately.
    pub fn shutdown(&self) {
        // ---
        self.inner.shutdown.cancel();
        lock_ignore_poison(&self.inner.subscriptions).clear();

        log_info!("[{}] provider shut down", self.broker_id());
    }

    fn register(&self, group: &GroupName, id: &SubscriptionId, cancel: &CancellationToken) {
        // ---
        let mut registry = lock_ignore_poison(&self.inner.subscriptions);
        prune(&mut registry);
        registry
            .entry(group.clone())
            .or_default()
            .push((id.clone(), cancel.clone()));
    }
}

/// Drop entries whose loop has already stopped.
fn prune(registry: &mut Registry) {
    registry.retain(|_, entries| {
        entries.retain(|(_, token)| !token.is_cancelled());
        !entries.is_empty()
    });
}

impl<S> fmt::Debug for Provider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("broker_id", &self.inner.broker.broker_id())
            .field("reconnect_policy", &self.inner.reconnect_policy)
            .field("unsubscribe_mode", &self.inner.unsubscribe_mode)
            .finish()
    }
}
