//! Event bus: typed pub/sub with a broadcast tap and history ring buffer.
//!
//! Handlers subscribed with [`EventBus::subscribe`] run synchronously, in
//! subscription order, on the publishing task. A failing or panicking
//! handler is reported to the [`DiagnosticSink`] and never affects the
//! publisher or the other handlers.

use didlink_types::config::EventsConfig;
use didlink_types::event::{Event, EventKind};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A synchronous event handler.
///
/// Connection events are delivered after the record's pipeline is released,
/// so a handler never holds up the state machine. It does run on an async
/// worker: blocking or long-running work belongs on
/// `tokio::task::spawn_blocking`, and work that drives the same connection
/// again (approving, abandoning) has to be spawned onto a task.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event) -> Result<(), String>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<(), String> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Result<(), String> {
        self(event)
    }
}

/// Where handler failures are reported.
pub trait DiagnosticSink: Send + Sync {
    fn handler_failed(&self, subscription: SubscriptionId, event: &Event, error: &str);
}

/// Default sink: a `tracing` warning.
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn handler_failed(&self, subscription: SubscriptionId, event: &Event, error: &str) {
        warn!(
            subscription = %subscription,
            event_id = %event.id,
            kind = ?event.kind(),
            "Event handler failed: {error}"
        );
    }
}

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

/// One agent's event bus.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    /// Broadcast tap for async consumers.
    sender: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    history_size: usize,
    sink: Arc<dyn DiagnosticSink>,
    failures: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(&EventsConfig::default())
    }

    pub fn with_config(config: &EventsConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            subscriptions: RwLock::new(Vec::new()),
            sender,
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            history_size: config.history_size,
            sink: Arc::new(TracingSink),
            failures: AtomicU64::new(0),
        }
    }

    /// Replace the diagnostic sink.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Deliver `event` to every handler subscribed to its kind, then to the
    /// broadcast tap. Returns after all handlers have run.
    pub fn publish(&self, event: Event) {
        debug!(
            event_id = %event.id,
            kind = ?event.kind(),
            connection_id = %event.connection_id(),
            "Publishing event"
        );

        if self.history_size > 0 {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Snapshot so handlers may subscribe or unsubscribe while running.
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_event(&event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => panic_message(panic.as_ref()),
            };
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.sink.handler_failed(id, &event, &error);
        }

        let _ = self.sender.send(event);
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<H>(&self, kind: EventKind, handler: H) -> SubscriptionId
    where
        H: EventHandler + 'static,
    {
        let id = SubscriptionId::new();
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription {
                id,
                kind,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Receive every published event asynchronously.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Number of handler invocations that failed or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
