//! Tests for the concurrency budget: dispatched underlying calls never
//! exceed the configured limit, overflow queues FIFO.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_test::assert_ok;

use merge_engine::{
    EngineConfig, HttpMethod, HttpRequest, HttpResponse, MergeEngine, MergeError, Transport,
    TransportError,
};

/// Tracks the concurrent-call high-water mark.
struct WatermarkTransport {
    current: AtomicU32,
    max_seen: AtomicU32,
    calls: AtomicU32,
}

impl WatermarkTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Transport for WatermarkTransport {
    async fn call(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(HttpResponse::new(200))
    }
}

/// Records dispatch order and holds each call open until released.
struct RecordingGatedTransport {
    started: Mutex<Vec<String>>,
    gate: Notify,
}

impl RecordingGatedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { started: Mutex::new(Vec::new()), gate: Notify::new() })
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for RecordingGatedTransport {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.started.lock().unwrap().push(request.url.clone());
        self.gate.notified().await;
        Ok(HttpResponse::new(200))
    }
}

fn get(url: &str) -> HttpRequest {
    HttpRequest::new(HttpMethod::Get, url)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn limit_bounds_concurrent_calls() {
    let transport = WatermarkTransport::new();
    let engine = MergeEngine::with_limit(transport.clone(), 4).unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.execute(get(&format!("https://example.com/resource/{i}"))).await
        }));
    }

    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert_eq!(transport.calls.load(Ordering::SeqCst), 16);
    assert!(transport.max_seen.load(Ordering::SeqCst) <= 4);
    assert_eq!(engine.stats().in_flight, 0);
    assert_eq!(engine.stats().queue_depth, 0);
}

#[tokio::test]
async fn limit_one_queues_second_distinct_request() {
    let transport = RecordingGatedTransport::new();
    let engine = MergeEngine::with_limit(transport.clone(), 1).unwrap();

    let engine_a = engine.clone();
    let a = tokio::spawn(async move { engine_a.execute(get("https://example.com/a")).await });
    wait_until(|| transport.started_count() == 1).await;

    let engine_b = engine.clone();
    let b = tokio::spawn(async move { engine_b.execute(get("https://example.com/b")).await });
    wait_until(|| engine.stats().queued_requests == 1).await;

    // B must not dispatch while A holds the only slot.
    assert_eq!(transport.started_count(), 1);
    assert_eq!(engine.stats().queue_depth, 1);

    // A completes; B is promoted.
    transport.gate.notify_waiters();
    a.await.unwrap().unwrap();
    wait_until(|| transport.started_count() == 2).await;

    transport.gate.notify_waiters();
    b.await.unwrap().unwrap();
    assert_eq!(transport.started(), vec!["https://example.com/a", "https://example.com/b"]);
}

#[tokio::test]
async fn promotion_is_fifo_across_keys() {
    let transport = RecordingGatedTransport::new();
    let engine = MergeEngine::with_limit(transport.clone(), 1).unwrap();

    let urls = ["https://example.com/a", "https://example.com/b", "https://example.com/c"];
    let mut handles = Vec::new();
    for (idx, url) in urls.iter().enumerate() {
        let task_engine = engine.clone();
        let url = url.to_string();
        handles.push(tokio::spawn(async move { task_engine.execute(get(&url)).await }));
        // Arrival order must be deterministic for the FIFO assertion.
        wait_until(|| transport.started_count() + engine.stats().queue_depth == idx + 1).await;
    }
    assert_eq!(engine.stats().queue_depth, 2);

    for expected in 1..=3 {
        wait_until(|| transport.started_count() == expected).await;
        transport.gate.notify_waiters();
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(transport.started(), urls);
}

#[tokio::test]
async fn queued_identical_request_attaches_on_promotion() {
    let transport = RecordingGatedTransport::new();
    let engine = MergeEngine::with_limit(transport.clone(), 1).unwrap();

    // Occupy the only slot.
    let engine_a = engine.clone();
    let a = tokio::spawn(async move { engine_a.execute(get("https://example.com/a")).await });
    wait_until(|| transport.started_count() == 1).await;

    // Park two identical requests behind the budget.
    let engine_b = engine.clone();
    let b1 = tokio::spawn(async move { engine_b.execute(get("https://example.com/b")).await });
    let engine_b = engine.clone();
    let b2 = tokio::spawn(async move { engine_b.execute(get("https://example.com/b")).await });
    wait_until(|| engine.stats().queue_depth == 2).await;

    // A completes: the first B dispatches, the second attaches to it.
    transport.gate.notify_waiters();
    a.await.unwrap().unwrap();
    wait_until(|| transport.started_count() == 2).await;
    wait_until(|| engine.stats().merged_requests == 1).await;
    assert_eq!(engine.stats().queue_depth, 0);

    transport.gate.notify_waiters();
    b1.await.unwrap().unwrap();
    b2.await.unwrap().unwrap();
    assert_eq!(transport.started_count(), 2);
}

#[tokio::test]
async fn queue_full_is_rejected() {
    let transport = RecordingGatedTransport::new();
    let config = EngineConfig { concurrency_limit: 1, max_pending: 1, ..Default::default() };
    let engine = MergeEngine::new(transport.clone(), config).unwrap();

    let engine_a = engine.clone();
    let _a = tokio::spawn(async move { engine_a.execute(get("https://example.com/a")).await });
    wait_until(|| transport.started_count() == 1).await;

    let engine_b = engine.clone();
    let _b = tokio::spawn(async move { engine_b.execute(get("https://example.com/b")).await });
    wait_until(|| engine.stats().queue_depth == 1).await;

    let err = engine.execute(get("https://example.com/c")).await.unwrap_err();
    assert_eq!(err, MergeError::QueueFull { current: 1, max: 1 });
}
