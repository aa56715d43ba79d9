// src/domain/handler.rs

//! Application-side message handlers.

use std::future::Future;
use std::marker::PhantomData;

use crate::Result;

/// Application callback invoked with each decoded message.
///
/// Handlers run on their own spawned task, one per message. A handler that
/// returns an error, or panics, only fails its own task; the subscription
/// keeps consuming.
#[async_trait::async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    /// Process one message.
    async fn handle(&self, message: T) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
///
/// Built with [`handler_fn`].
pub struct HandlerFn<F, T> {
    func: F,
    _phantom: PhantomData<fn(T)>,
}

/// Wrap an async closure as a message handler.
///
/// ```
/// # use mom_pubsub::{handler_fn, MessageHandler};
/// let handler = handler_fn(|text: String| async move {
///     println!("got {text}");
///     Ok(())
/// });
/// # fn assert_handler<H: MessageHandler<String>>(_: &H) {}
/// # assert_handler(&handler);
/// ```
pub fn handler_fn<F, Fut, T>(func: F) -> HandlerFn<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    HandlerFn {
        func,
        _phantom: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut, T> MessageHandler<T> for HandlerFn<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    async fn handle(&self, message: T) -> Result<()> {
        (self.func)(message).await
    }
}
