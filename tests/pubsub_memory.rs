// tests/pubsub_memory.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use mom_pubsub::{
    // ---
    create_memory_broker_with_hub,
    handler_fn,
    BrokerConfig,
    BrokerPtr,
    ConsumerId,
    GroupName,
    JsonSerializer,
    LoopState,
    MemoryHub,
    MessageHandler,
    MessageRequest,
    Provider,
    ProviderBuilder,
    PubSubError,
    Result,
    StartPosition,
    SubscribeRequest,
    Subscription,
    TextSerializer,
    UnsubscribeMode,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderDto {
    id: u32,
}

/// JSON serializer that counts its calls.
#[derive(Clone, Default)]
struct CountingSerializer {
    encodes: Arc<AtomicUsize>,
    decodes: Arc<AtomicUsize>,
}

impl TextSerializer for CountingSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        JsonSerializer.serialize(value)
    }

    fn deserialize<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        JsonSerializer.deserialize(text)
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_provider(hub: &Arc<MemoryHub>) -> Provider {
    ProviderBuilder::new()
        .broker_id("pubsub-test")
        .memory_hub(Arc::clone(hub))
        .reconnect_delay(Duration::from_millis(20))
        .build()
        .expect("failed to build provider")
}

/// Handler that forwards every message into a channel.
fn forward<T: Send + 'static>(tx: mpsc::UnboundedSender<T>) -> impl MessageHandler<T> {
    handler_fn(move |message: T| {
        let tx = tx.clone();
        async move {
            tx.send(message)
                .map_err(|err| PubSubError::Handler(err.to_string()))
        }
    })
}

async fn listening(subscription: &Subscription) {
    timeout(WAIT, subscription.wait_for_state(LoopState::Listening))
        .await
        .expect("timed out waiting for listening state")
        .expect("loop stopped before listening");
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("handler channel closed unexpectedly")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn next_raw(broker: &BrokerPtr, group: &str) -> Vec<u8> {
    let mut session = broker
        .open_session(&GroupName::from(group), &ConsumerId::generate())
        .await
        .expect("failed to open raw session");

    let payload = timeout(WAIT, session.next_message())
        .await
        .expect("timed out waiting for raw payload")
        .expect("raw session failed")
        .expect("raw session ended");

    session.close().await;
    payload.to_vec()
}

#[tokio::test]
async fn hello_arrives_as_literal_text() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    // ---
    // Act
    // ---
    provider
        .send(MessageRequest::new("orders", "hello"))
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    assert_eq!(recv(&mut rx).await, "hello");
    eventually("handled counter", || subscription.stats().handled() == 1).await;
    assert_eq!(subscription.stats().received(), 1);
}

#[tokio::test]
async fn order_arrives_decoded() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx, mut rx) = mpsc::unbounded_channel::<OrderDto>();

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    // ---
    // Act
    // ---
    provider
        .send(MessageRequest::new("orders", OrderDto { id: 1 }))
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    let order = recv(&mut rx).await;
    assert_eq!(order.id, 1);
}

#[tokio::test]
async fn text_goes_on_the_wire_verbatim() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let broker = create_memory_broker_with_hub(BrokerConfig::new(""), Arc::clone(&hub))
        .expect("failed to create memory broker");
    let serializer = CountingSerializer::default();
    let provider = Provider::new(Arc::clone(&broker), serializer.clone());

    // Looks like JSON, must not be re-encoded.
    let text = r#"{"id":1} "quoted" ünïcode"#.to_string();

    // ---
    // Act
    // ---
    provider
        .send(MessageRequest::new("raw", text.clone()))
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    assert_eq!(next_raw(&broker, "raw").await, text.as_bytes());
    assert_eq!(serializer.encodes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn structs_are_serialized_exactly_once() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let broker = create_memory_broker_with_hub(BrokerConfig::new(""), Arc::clone(&hub))
        .expect("failed to create memory broker");
    let serializer = CountingSerializer::default();
    let provider = Provider::new(Arc::clone(&broker), serializer.clone());

    // ---
    // Act
    // ---
    provider
        .send(MessageRequest::new("raw", OrderDto { id: 7 }))
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    assert_eq!(next_raw(&broker, "raw").await, br#"{"id":7}"#);
    assert_eq!(serializer.encodes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn text_handlers_skip_the_serializer() {
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let serializer = CountingSerializer::default();
    let provider = ProviderBuilder::new()
        .memory_hub(Arc::clone(&hub))
        .serializer(serializer.clone())
        .build()
        .expect("failed to build provider");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    provider
        .send(MessageRequest::new("orders", OrderDto { id: 3 }))
        .await
        .expect("send failed");

    // A text handler sees the serialized form untouched.
    assert_eq!(recv(&mut rx).await, r#"{"id":3}"#);
    assert_eq!(serializer.encodes.load(Ordering::SeqCst), 1);
    assert_eq!(serializer.decodes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handlers_start_in_publish_order() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let started = Arc::new(Mutex::new(Vec::<u32>::new()));

    let recorder = Arc::clone(&started);
    let handler = handler_fn(move |n: u32| {
        // Recorded before the first await of the handler.
        recorder.lock().expect("recorder poisoned").push(n);
        async move {
            sleep(Duration::from_millis(u64::from(n % 3))).await;
            Ok::<(), PubSubError>(())
        }
    });

    let subscription = provider
        .subscribe(SubscribeRequest::new("sequenced"), handler)
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    // ---
    // Act
    // ---
    for n in 0..50u32 {
        provider
            .send(MessageRequest::new("sequenced", n))
            .await
            .expect("send failed");
    }

    // ---
    // Assert
    // ---
    eventually("all handlers", || subscription.stats().handled() == 50).await;

    let started = started.lock().expect("recorder poisoned").clone();
    assert_eq!(started, (0..50).collect::<Vec<u32>>());
    assert_eq!(subscription.stats().received(), 50);
}

#[tokio::test]
async fn failing_handler_does_not_block_next_message() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let handler = handler_fn(move |text: String| {
        let tx = tx.clone();
        async move {
            match text.as_str() {
                "boom" => Err(PubSubError::Handler("refusing boom".into())),
                "panic" => panic!("handler panicked on purpose"),
                _ => tx
                    .send(text)
                    .map_err(|err| PubSubError::Handler(err.to_string())),
            }
        }
    });

    let subscription = provider
        .subscribe(SubscribeRequest::new("jobs"), handler)
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    // ---
    // Act
    // ---
    for text in ["boom", "panic", "ok"] {
        provider
            .send(MessageRequest::new("jobs", text))
            .await
            .expect("send failed");
    }

    // ---
    // Assert
    // ---
    assert_eq!(recv(&mut rx).await, "ok");
    eventually("handler failure counter", || {
        subscription.stats().handler_failures() == 1
    })
    .await;
    assert_eq!(subscription.stats().received(), 3);
    assert_eq!(subscription.state(), LoopState::Listening);
}

#[tokio::test]
async fn undecodable_payload_is_skipped() {
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx, mut rx) = mpsc::unbounded_channel::<OrderDto>();

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    provider
        .send(MessageRequest::new("orders", "not json"))
        .await
        .expect("send failed");
    provider
        .send(MessageRequest::new("orders", OrderDto { id: 2 }))
        .await
        .expect("send failed");

    assert_eq!(recv(&mut rx).await, OrderDto { id: 2 });
    eventually("decode failure counter", || {
        subscription.stats().decode_failures() == 1
    })
    .await;
}

#[tokio::test]
async fn two_subscriptions_both_receive() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx_a, mut rx_a) = mpsc::unbounded_channel::<String>();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel::<String>();

    let a = provider
        .subscribe(SubscribeRequest::new("fanout"), forward(tx_a))
        .await
        .expect("subscribe failed");
    let b = provider
        .subscribe(SubscribeRequest::new("fanout"), forward(tx_b))
        .await
        .expect("subscribe failed");
    listening(&a).await;
    listening(&b).await;

    // ---
    // Act
    // ---
    provider
        .send(MessageRequest::new("fanout", "to everyone"))
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    assert_eq!(recv(&mut rx_a).await, "to everyone");
    assert_eq!(recv(&mut rx_b).await, "to everyone");
    assert_ne!(a.id(), b.id());
    assert_eq!(hub.session_count(&GroupName::from("fanout")), 2);
}

#[tokio::test]
async fn earliest_replays_history_and_latest_does_not() {
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let publisher = memory_provider(&hub);

    publisher
        .send(MessageRequest::new("history", "old"))
        .await
        .expect("send failed");

    let earliest = memory_provider(&hub);
    let latest = ProviderBuilder::new()
        .memory_hub(Arc::clone(&hub))
        .start_position(StartPosition::Latest)
        .build()
        .expect("failed to build provider");

    let (tx_e, mut rx_e) = mpsc::unbounded_channel::<String>();
    let (tx_l, mut rx_l) = mpsc::unbounded_channel::<String>();

    let e = earliest
        .subscribe(SubscribeRequest::new("history"), forward(tx_e))
        .await
        .expect("subscribe failed");
    let l = latest
        .subscribe(SubscribeRequest::new("history"), forward(tx_l))
        .await
        .expect("subscribe failed");
    listening(&e).await;
    listening(&l).await;

    publisher
        .send(MessageRequest::new("history", "new"))
        .await
        .expect("send failed");

    // Handlers run on their own tasks, so completion order is not fixed.
    let mut replayed = vec![recv(&mut rx_e).await, recv(&mut rx_e).await];
    replayed.sort();
    assert_eq!(replayed, ["new", "old"]);

    assert_eq!(recv(&mut rx_l).await, "new");
    assert_eq!(l.stats().received(), 1);
    assert_eq!(hub.retained_count(&GroupName::from("history")), 2);
}

#[tokio::test]
async fn minimal_unsubscribe_is_unsupported_and_keeps_delivering() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;

    // ---
    // Act
    // ---
    let result = provider.unsubscribe(&SubscribeRequest::new("orders"));

    // ---
    // Assert
    // ---
    assert!(matches!(result, Err(PubSubError::Unsupported(_))));

    provider
        .send(MessageRequest::new("orders", "still here"))
        .await
        .expect("send failed");

    assert_eq!(recv(&mut rx).await, "still here");
    assert_eq!(subscription.state(), LoopState::Listening);
    assert_eq!(provider.active_subscriptions(&GroupName::from("orders")), 1);
}

#[tokio::test]
async fn cancel_mode_unsubscribe_stops_the_loop() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let provider = ProviderBuilder::new()
        .memory_hub(Arc::clone(&hub))
        .unsubscribe_mode(UnsubscribeMode::Cancel)
        .build()
        .expect("failed to build provider");
    let (tx, _rx) = mpsc::unbounded_channel::<String>();
    let group = GroupName::from("orders");

    let subscription = provider
        .subscribe(SubscribeRequest::new("orders"), forward(tx))
        .await
        .expect("subscribe failed");
    listening(&subscription).await;
    assert_eq!(hub.session_count(&group), 1);

    // ---
    // Act
    // ---
    provider
        .unsubscribe(&SubscribeRequest::new("orders"))
        .expect("unsubscribe failed");

    // ---
    // Assert
    // ---
    timeout(WAIT, subscription.wait_for_state(LoopState::Stopped))
        .await
        .expect("timed out waiting for stop")
        .expect("state channel closed");

    assert_eq!(hub.session_count(&group), 0);
    eventually("task exit", || subscription.is_finished()).await;

    let again = provider.unsubscribe(&SubscribeRequest::new("orders"));
    assert!(matches!(again, Err(PubSubError::NotSubscribed(_))));
}

#[tokio::test]
async fn send_errors_propagate() {
    // ---
    let hub = MemoryHub::new();
    let provider = memory_provider(&hub);

    // JSON object keys must be strings.
    let mut unencodable = HashMap::new();
    unencodable.insert(vec![1u8], 1u8);
    let err = provider
        .send(MessageRequest::new("orders", unencodable))
        .await
        .expect_err("encode should fail");
    assert!(matches!(err, PubSubError::Encode { .. }));

    let err = provider
        .send(MessageRequest::new("", "hello"))
        .await
        .expect_err("empty group should fail");
    assert!(matches!(err, PubSubError::EmptyGroupName));

    hub.set_reachable(false);
    let err = provider
        .send(MessageRequest::new("orders", "hello"))
        .await
        .expect_err("unreachable hub should fail");
    assert!(matches!(err, PubSubError::Connection(_)));

    // Nothing reached the hub.
    assert_eq!(hub.retained_count(&GroupName::from("orders")), 0);
}
