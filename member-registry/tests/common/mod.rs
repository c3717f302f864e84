//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use member_registry::{
    ChangeListener, ConnectionListener, CoordinationClient, Error, MemoryBackend, Result,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::Registry;

/// One captured log line.
#[derive(Debug, Clone)]
pub struct Captured {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Layer that records every event emitted while it is installed.
#[derive(Clone, Default)]
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

impl CaptureLayer {
    /// Warnings emitted by this crate, in order.
    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == Level::WARN && e.target.starts_with("member_registry"))
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}

/// Install a capturing subscriber for the current thread.
///
/// Use with current-thread runtimes so spawned tasks log through it too.
pub fn capture_logs() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
    let layer = CaptureLayer::default();
    let subscriber = Registry::default().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}

/// Yield until `check` passes or the attempts run out.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    check()
}

/// Client over a [`MemoryBackend`] whose first snapshot fetches fail.
///
/// Also counts listener registrations and every event delivered to a
/// subtree listener.
pub struct FlakyClient {
    inner: Arc<MemoryBackend>,
    failing_fetches: AtomicUsize,
    lose_connection: bool,
    subscriptions: AtomicUsize,
    deliveries: Arc<AtomicUsize>,
}

impl FlakyClient {
    /// Fail the next `failures` fetches, leaving the connection up.
    pub fn failing_fetches(inner: Arc<MemoryBackend>, failures: usize) -> Self {
        Self {
            inner,
            failing_fetches: AtomicUsize::new(failures),
            lose_connection: false,
            subscriptions: AtomicUsize::new(0),
            deliveries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `failures` fetches by dropping the connection first.
    pub fn losing_connection(inner: Arc<MemoryBackend>, failures: usize) -> Self {
        Self {
            lose_connection: true,
            ..Self::failing_fetches(inner, failures)
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationClient for FlakyClient {
    async fn create_ephemeral_sequential(&self, prefix: &str, payload: Vec<u8>) -> Result<String> {
        self.inner.create_ephemeral_sequential(prefix, payload).await
    }

    async fn remove_node(&self, path: &str) -> Result<()> {
        self.inner.remove_node(path).await
    }

    fn subscribe_connection_state(&self, listener: ConnectionListener) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe_connection_state(listener);
    }

    fn subscribe_subtree_changes(&self, listener: ChangeListener) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let deliveries = self.deliveries.clone();
        self.inner.subscribe_subtree_changes(Box::new(move |event| {
            deliveries.fetch_add(1, Ordering::SeqCst);
            listener(event);
        }));
    }

    async fn fetch_subtree_snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let fail = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            if self.lose_connection {
                self.inner.simulate_connection_loss();
            }
            return Err(Error::Connection("lost".into()));
        }
        self.inner.fetch_subtree_snapshot(path).await
    }

    async fn close_connection(&self) {
        self.inner.close_connection().await
    }
}
