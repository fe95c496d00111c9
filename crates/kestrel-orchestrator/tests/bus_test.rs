//! Delivery and isolation tests for the event bus

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kestrel_orchestrator::event::{Ragnarok, StreamChunk, StreamComplete, UpdateView};
use kestrel_orchestrator::{ComponentTag, Event, EventBus, RequestId};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

fn explode() {
    panic!("subscriber bug");
}

fn chunk(content: &str) -> Event<StreamChunk> {
    Event::new(ComponentTag::Llm, StreamChunk { request_id: RequestId::new(), content: content.to_string() })
}

#[tokio::test]
async fn test_last_operation_per_tag_wins() {
    let bus = EventBus::new(4).unwrap();
    let channel = &bus.update_view;

    channel.subscribe(ComponentTag::Ui, |_| async {});
    channel.subscribe(ComponentTag::Llm, |_| async {});
    channel.unsubscribe(ComponentTag::Ui);
    channel.subscribe(ComponentTag::ToolManager, |_| async {});
    channel.unsubscribe(ComponentTag::ToolManager);
    channel.subscribe(ComponentTag::ToolManager, |_| async {});
    channel.subscribe(ComponentTag::Llm, |_| async {});

    assert!(!channel.is_subscribed(ComponentTag::Ui));
    assert!(channel.is_subscribed(ComponentTag::Llm));
    assert!(channel.is_subscribed(ComponentTag::ToolManager));
    assert_eq!(channel.subscriber_count(), 2);
}

#[tokio::test]
async fn test_every_installed_handler_gets_one_delivery() {
    let bus = EventBus::new(4).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for tag in [ComponentTag::Ui, ComponentTag::Llm, ComponentTag::ToolManager] {
        let tx = tx.clone();
        bus.stream_chunk.subscribe(tag, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((tag, event.data.content));
            }
        });
    }
    bus.stream_chunk.subscribe(ComponentTag::Environment, |_| async {});
    bus.stream_chunk.unsubscribe(ComponentTag::Environment);
    drop(tx);

    assert_eq!(bus.stream_chunk.publish(chunk("Hel")), 3);

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let (tag, content) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(content, "Hel");
        assert!(seen.insert(tag), "duplicate delivery to {tag}");
    }
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.unwrap_or(None).is_none());
}

#[tokio::test]
async fn test_panic_spares_siblings_and_raises_one_ragnarok() {
    let bus = EventBus::new(4).unwrap();
    let ragnaroks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ragnaroks);
    bus.ragnarok.subscribe(ComponentTag::Ui, move |_: Event<Ragnarok>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.update_view.subscribe(ComponentTag::Llm, |_| async { explode() });
    bus.update_view.subscribe(ComponentTag::Ui, move |_| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(());
        }
    });

    bus.update_view.publish(Event::new(ComponentTag::ToolManager, UpdateView));
    bus.update_view.publish(Event::new(ComponentTag::ToolManager, UpdateView));

    for _ in 0..2 {
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }
    for _ in 0..100 {
        if ragnaroks.load(Ordering::SeqCst) == 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(20)).await;
    assert_eq!(ragnaroks.load(Ordering::SeqCst), 2);

    // The bus keeps delivering after a fail-safe broadcast.
    assert_eq!(bus.update_view.publish(Event::new(ComponentTag::ToolManager, UpdateView)), 2);
}

#[tokio::test]
async fn test_panicking_ragnarok_handler_does_not_loop() {
    let bus = EventBus::new(2).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    bus.ragnarok.subscribe(ComponentTag::Ui, move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            explode();
        }
    });

    assert_eq!(bus.ragnarok(), 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_clones_share_channels() {
    let bus = EventBus::new(2).unwrap();
    let clone = bus.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    clone.stream_chunk.subscribe(ComponentTag::Ui, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.data.content);
        }
    });

    bus.stream_chunk.publish(chunk("shared"));
    let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(got.as_deref(), Some("shared"));

    clone.close();
    assert!(bus.is_closed());
    assert_eq!(bus.stream_chunk.publish(chunk("dropped")), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_subscriber_receives_chunks_in_publish_order() {
    let bus = EventBus::new(8).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.stream_chunk.subscribe(ComponentTag::Ui, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.data.content);
        }
    });

    for i in 0..500 {
        assert_eq!(bus.stream_chunk.publish(chunk(&i.to_string())), 1);
    }

    let mut received = Vec::with_capacity(500);
    for _ in 0..500 {
        received.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
    }
    let expected: Vec<String> = (0..500).map(|i: i32| i.to_string()).collect();
    assert_eq!(received, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completion_never_overtakes_chunks_of_same_subscriber() {
    let bus = EventBus::new(8).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let chunk_tx = tx.clone();
    bus.stream_chunk.subscribe(ComponentTag::Ui, move |event| {
        let tx = chunk_tx.clone();
        async move {
            let _ = tx.send(event.data.content);
        }
    });
    bus.stream_complete.subscribe(ComponentTag::Ui, move |_| {
        let tx = tx.clone();
        async move {
            let _ = tx.send("<done>".to_string());
        }
    });

    let request_id = RequestId::new();
    for i in 0..50 {
        bus.stream_chunk.publish(chunk(&i.to_string()));
    }
    bus.stream_complete.publish(Event::new(ComponentTag::Llm, StreamComplete { request_id, is_complete: true }));

    let mut received = Vec::new();
    for _ in 0..51 {
        received.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received.last().map(String::as_str), Some("<done>"));
    let chunks: Vec<String> = (0..50).map(|i: i32| i.to_string()).collect();
    assert_eq!(&received[..50], chunks.as_slice());
}
