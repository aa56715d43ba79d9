//! Subscription loop.
//!
//! This module drives one subscription: it keeps a consume session open
//! against the broker, turns every inbound payload into a dispatch task, and
//! reconnects whenever the session is lost.
//!
//! ## State machine
//!
//! ```text
//!   Connecting ──ok──▶ Listening ──end / error──▶ Disconnected
//!       │  ▲                                          │
//!       │  └─────────────── after backoff ────────────┘
//!       └──open failed──▶ Disconnected
//!
//!   any state ──cancelled──▶ Stopped
//! ```
//!
//! Each pass through `Connecting` opens a brand-new session. The
//! [`ConsumerId`] is fixed for the lifetime of the subscription, so brokers
//! that track read positions per consumer (Kafka consumer groups, the
//! in-memory hub) resume where the previous session left off instead of
//! replaying the group's history. Only the first session of a subscription
//! starts from the configured start position.
//!
//! ## Receive loop
//!
//! The loop never awaits a handler. Each payload is moved into its own
//! spawned task that decodes it and calls the handler, so a slow handler
//! cannot stall the broker-level receive cycle. Tasks are spawned in arrival
//! order; their completion order is up to the scheduler.
//!
//! ## Error handling
//!
//! Nothing escapes the loop. Connect failures and session failures are
//! logged at `error`, a clean end of stream at `warn`, and all of them are
//! counted in [`SubscriptionStats`]. Decode and handler failures stay inside
//! their dispatch task and are attributed to the message's sequence number
//! within the subscription.
//!
//! ## Cancellation
//!
//! The cancellation token is observed while connecting, while waiting for
//! the next message and during backoff. The loop closes its own session on
//! the way out.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LoopState, SubscriptionStats};
use crate::encoding::{self, TextSerializer};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerPtr,
    ConsumerId,
    GroupName,
    MessageHandler,
    PubSubError,
    ReconnectPolicy,
    SessionPtr,
};

/// How a listening phase ended.
enum ListenOutcome {
    Cancelled,
    Ended,
    Failed(PubSubError),
}

/// Everything one subscription loop owns.
pub(crate) struct SubscriptionLoop<T, H, S> {
    pub(crate) broker: BrokerPtr,
    pub(crate) group: GroupName,
    pub(crate) consumer: ConsumerId,
    pub(crate) handler: Arc<H>,
    pub(crate) serializer: Arc<S>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<LoopState>,
    pub(crate) stats: Arc<SubscriptionStats>,
    pub(crate) _message: PhantomData<fn() -> T>,
}

impl<T, H, S> SubscriptionLoop<T, H, S>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
    S: TextSerializer,
{
    /// Start the loop on its own task.
    ///
    /// Returns as soon as the task is spawned; the first connection attempt
    /// happens on the task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        // ---
        let mut failures: u32 = 0;
        let consumer = &self.consumer;

        log_debug!("{}/{consumer}: subscription loop started", self.group);

        loop {
            self.set_state(LoopState::Connecting);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.broker.open_session(&self.group, consumer) => opened,
            };

            match opened {
                Ok(mut session) => {
                    failures = 0;
                    SubscriptionStats::record(&self.stats.sessions_opened);
                    self.set_state(LoopState::Listening);
                    log_info!("{}/{consumer}: listening", self.group);

                    let outcome = self.listen(&mut session, consumer).await;
                    session.close().await;

                    match outcome {
                        ListenOutcome::Cancelled => break,
                        ListenOutcome::Ended => {
                            log_warn!("{}/{consumer}: session ended by broker", self.group);
                        }
                        ListenOutcome::Failed(_err) => {
                            log_error!("{}/{consumer}: session failed: {_err}", self.group);
                        }
                    }
                    SubscriptionStats::record(&self.stats.disconnects);
                }
                Err(_err) => {
                    SubscriptionStats::record(&self.stats.connect_failures);
                    log_error!("{}/{consumer}: connect failed: {_err}", self.group);
                }
            }

            self.set_state(LoopState::Disconnected);

            let delay = self.policy.delay_for(failures);
            failures = failures.saturating_add(1);

            if !self.policy.allows_attempt(failures) {
                log_error!(
                    "{}: giving up after {failures} consecutive failed attempts",
                    self.group
                );
                break;
            }

            log_debug!("{}: reconnecting in {delay:?}", self.group);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.broker.forget_consumer(&self.group, consumer).await;

        // Cancel before publishing Stopped so the provider's registry no
        // longer counts this loop once observers see the terminal state.
        self.cancel.cancel();
        self.set_state(LoopState::Stopped);

        log_info!("{}: subscription loop stopped", self.group);
    }

    async fn listen(&self, session: &mut SessionPtr, consumer: &ConsumerId) -> ListenOutcome {
        // ---
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return ListenOutcome::Cancelled,
                next = session.next_message() => next,
            };

            match next {
                Ok(Some(payload)) => self.dispatch(payload, consumer),
                Ok(None) => return ListenOutcome::Ended,
                Err(err) => return ListenOutcome::Failed(err),
            }
        }
    }

    /// Decode and handle one payload on its own task.
    fn dispatch(&self, payload: Bytes, consumer: &ConsumerId) {
        // ---
        let sequence = SubscriptionStats::record(&self.stats.received);

        let handler = Arc::clone(&self.handler);
        let serializer = Arc::clone(&self.serializer);
        let stats = Arc::clone(&self.stats);
        let group = self.group.clone();
        let consumer = consumer.clone();

        tokio::spawn(async move {
            // ---
            let message = match encoding::decode::<T, S>(&payload, &*serializer) {
                Ok(message) => message,
                Err(_err) => {
                    SubscriptionStats::record(&stats.decode_failures);
                    log_error!("{group}/{consumer}: message #{sequence} dropped: {_err}");
                    return;
                }
            };

            match handler.handle(message).await {
                Ok(()) => {
                    SubscriptionStats::record(&stats.handled);
                }
                Err(_err) => {
                    SubscriptionStats::record(&stats.handler_failures);
                    log_warn!("{group}/{consumer}: handler failed on message #{sequence}: {_err}");
                }
            }
        });
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }
}
