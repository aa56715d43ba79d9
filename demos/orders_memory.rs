//! Orders example over the in-memory broker.
//!
//! One provider publishes a plain-text note and a JSON order to the
//! `orders` group; two subscriptions receive them, one as raw text and one
//! decoded into `OrderDto`.
//!
//! Run with: cargo run --example orders_memory
//!
//! Set `RUST_LOG=mom_pubsub=debug` to watch the subscription loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use mom_pubsub::{
    // ---
    handler_fn,
    LoopState,
    MessageRequest,
    ProviderBuilder,
    Result,
    SubscribeRequest,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderDto {
    id: u32,
    item: String,
    quantity: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let provider = ProviderBuilder::new()
        .broker_id("orders-demo")
        .reconnect_delay(Duration::from_secs(1))
        .build()?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    // Raw text view of everything on the group.
    let audit_done = done_tx.clone();
    let audit = provider
        .subscribe(
            SubscribeRequest::new("orders"),
            handler_fn(move |text: String| {
                let done = audit_done.clone();
                async move {
                    println!("[audit] {text}");
                    let _ = done.send(());
                    Ok(())
                }
            }),
        )
        .await?;

    // Typed view; the text note fails to decode and is skipped.
    let fulfil = provider
        .subscribe(
            SubscribeRequest::new("orders"),
            handler_fn(move |order: OrderDto| {
                let done = done_tx.clone();
                async move {
                    println!(
                        "[fulfil] order #{}: {} x {}",
                        order.id, order.quantity, order.item
                    );
                    let _ = done.send(());
                    Ok(())
                }
            }),
        )
        .await?;

    audit.wait_for_state(LoopState::Listening).await?;
    fulfil.wait_for_state(LoopState::Listening).await?;

    provider
        .send(MessageRequest::new("orders", "store opens at 9"))
        .await?;

    provider
        .send(MessageRequest::new(
            "orders",
            OrderDto {
                id: 1,
                item: "widget".into(),
                quantity: 3,
            },
        ))
        .await?;

    // Two audit lines plus one fulfilment.
    for _ in 0..3 {
        if tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .is_err()
        {
            eprintln!("timed out waiting for deliveries");
            break;
        }
    }

    println!(
        "audit received {}, fulfil received {} (decode failures: {})",
        audit.stats().received(),
        fulfil.stats().received(),
        fulfil.stats().decode_failures(),
    );

    provider.shutdown();
    audit.wait_for_state(LoopState::Stopped).await?;
    fulfil.wait_for_state(LoopState::Stopped).await?;

    Ok(())
}
