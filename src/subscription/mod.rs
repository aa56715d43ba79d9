//! Subscriptions.
//!
//! A subscription is one background task (see [`runner`]) plus the
//! [`Subscription`] handle returned to the caller. The handle is purely
//! observational: dropping it does not stop the task.

pub(crate) mod runner;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{ConsumerId, GroupName, PubSubError, Result, SubscriptionId};

/// Lifecycle state of a subscription loop.
///
/// `Connecting -> Listening -> Disconnected -> Connecting -> ...`, with
/// `Stopped` as the only terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Opening a fresh session under the subscription's consumer identity.
    Connecting,
    /// Session open, waiting for messages.
    Listening,
    /// Session lost or could not be opened; waiting out the backoff.
    Disconnected,
    /// Cancelled, or out of reconnect attempts. Terminal.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Connecting => "connecting",
            LoopState::Listening => "listening",
            LoopState::Disconnected => "disconnected",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters maintained by a subscription loop and its dispatch tasks.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    sessions_opened: AtomicU64,
    connect_failures: AtomicU64,
    disconnects: AtomicU64,
    received: AtomicU64,
    handled: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl SubscriptionStats {
    /// Sessions successfully opened, including the first one.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Attempts to open a session that failed.
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Open sessions that ended or failed while listening.
    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Payloads taken off the broker and dispatched.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages the handler completed successfully.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Payloads that could not be decoded into the handler's type.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Messages for which the handler returned an error.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    id: SubscriptionId,
    group: GroupName,
    consumer: ConsumerId,
    state: watch::Receiver<LoopState>,
    stats: Arc<SubscriptionStats>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        group: GroupName,
        consumer: ConsumerId,
        state: watch::Receiver<LoopState>,
        stats: Arc<SubscriptionStats>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            group,
            consumer,
            state,
            stats,
            task,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    /// Consumer identity presented to the broker by every session of this
    /// subscription.
    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the loop reports `target`.
    ///
    /// Returns immediately if the loop is already in `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotSubscribed`] if the loop exits without
    /// ever reaching `target`.
    pub async fn wait_for_state(&self, target: LoopState) -> Result<()> {
        // ---
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();

        if reached {
            Ok(())
        } else {
            Err(PubSubError::NotSubscribed(self.group.to_string()))
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("state", &self.state())
            .finish()
    }
}
