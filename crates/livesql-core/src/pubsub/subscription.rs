//! Subscriptions and their delivery loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::throttle::{Throttle, ThrottleAction};
use crate::db::Row;
use crate::error::{ErrorPayload, Result};
use crate::socket::ClientSocket;

/// Re-runnable query behind a subscription.
#[async_trait]
pub trait LiveQuery: Send + Sync {
    /// Fetches the current result set.
    async fn run(&self) -> Result<Vec<Row>>;
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Fresh result set.
    Data(Vec<Row>),
    /// The re-query failed or the trigger reported an error. The
    /// subscription stays registered.
    Error(ErrorPayload),
}

/// Local subscriber callback.
pub type LocalCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Where pushes go.
#[derive(Clone)]
pub enum SubscriptionSink {
    /// A client socket, on the subscription's channel.
    Socket(Arc<dyn ClientSocket>),
    /// An in-process callback.
    Local(LocalCallback),
}

impl fmt::Debug for SubscriptionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(socket) => f.debug_tuple("Socket").field(&socket.id()).finish(),
            Self::Local(_) => f.write_str("Local"),
        }
    }
}

impl SubscriptionSink {
    pub(crate) fn socket_id(&self) -> Option<&str> {
        match self {
            Self::Socket(socket) => Some(socket.id()),
            Self::Local(_) => None,
        }
    }

    fn send(&self, channel: &str, event: SubscriptionEvent) {
        match self {
            Self::Socket(socket) => {
                let payload = match event {
                    SubscriptionEvent::Data(rows) => json!({ "data": rows }),
                    SubscriptionEvent::Error(err) => json!({ "err": err.err, "msg": err.msg }),
                };
                socket.emit(channel, payload);
            }
            Self::Local(callback) => callback(event),
        }
    }
}

/// A (table, condition) pair registered in the trigger catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    /// Base table the trigger is installed on.
    pub table: String,
    /// Condition evaluated against the transition tables.
    pub condition: String,
}

impl TriggerKey {
    /// Creates a key.
    #[must_use]
    pub fn new(table: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            condition: condition.into(),
        }
    }
}

/// Parameters of a new subscription.
pub struct SubscriptionRequest {
    /// Subscribed table or view.
    pub table: String,
    /// Triggers the subscription listens to.
    pub triggers: Vec<(TriggerKey, Option<String>)>,
    /// Channel the pushes are emitted on.
    pub channel: String,
    /// Delivery target.
    pub sink: SubscriptionSink,
    /// Query re-run on every push.
    pub query: Arc<dyn LiveQuery>,
    /// Minimum delay between pushes.
    pub throttle: Duration,
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("table", &self.table)
            .field("triggers", &self.triggers)
            .field("channel", &self.channel)
            .field("sink", &self.sink)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SubscriptionEntry {
    pub(crate) id: u64,
    pub(crate) table: String,
    pub(crate) channel: String,
    pub(crate) trigger_keys: Vec<TriggerKey>,
    sink: SubscriptionSink,
    query: Arc<dyn LiveQuery>,
    throttle: Mutex<Throttle>,
    ready: AtomicBool,
    closed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEntry {
    pub(crate) fn new(id: u64, request: SubscriptionRequest) -> Self {
        Self {
            id,
            table: request.table,
            channel: request.channel,
            trigger_keys: request.triggers.into_iter().map(|(key, _)| key).collect(),
            sink: request.sink,
            query: request.query,
            throttle: Mutex::new(Throttle::new(request.throttle)),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    pub(crate) fn socket_id(&self) -> Option<&str> {
        self.sink.socket_id()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks the subscriber ready and starts the initial push.
    pub(crate) fn mark_ready(self: &Arc<Self>) {
        if self.ready.swap(true, Ordering::AcqRel) || self.is_closed() {
            return;
        }
        let action = self.throttle.lock().start();
        self.apply(action);
    }

    /// A matching change was notified.
    pub(crate) fn notify(self: &Arc<Self>) {
        if self.is_closed() || !self.is_ready() {
            return;
        }
        let action = self.throttle.lock().on_notify(Instant::now());
        self.apply(action);
    }

    /// Pushes an error without touching the throttle.
    pub(crate) fn push_error(&self, payload: ErrorPayload) {
        if !self.is_closed() {
            self.sink.send(&self.channel, SubscriptionEvent::Error(payload));
        }
    }

    /// Stops all future deliveries.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn apply(self: &Arc<Self>, action: ThrottleAction) {
        match action {
            ThrottleAction::PushNow => self.spawn_push(),
            ThrottleAction::Schedule(deadline) => self.schedule(deadline),
            ThrottleAction::Wait => {}
        }
    }

    fn schedule(self: &Arc<Self>, deadline: Instant) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(entry) = weak.upgrade() {
                let action = entry.throttle.lock().on_timer();
                entry.apply(action);
            }
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn spawn_push(self: &Arc<Self>) {
        let entry = Arc::clone(self);
        tokio::spawn(async move {
            entry.push().await;
            let action = entry.throttle.lock().on_delivered(Instant::now());
            entry.apply(action);
        });
    }

    async fn push(&self) {
        if self.is_closed() {
            return;
        }
        let event = match self.query.run().await {
            Ok(rows) => SubscriptionEvent::Data(rows),
            Err(e) => {
                tracing::warn!(table = %self.table, channel = %self.channel, error = %e, "subscription query failed");
                SubscriptionEvent::Error(e.to_payload())
            }
        };
        // The query may have outlived an unsubscribe.
        if self.is_closed() {
            tracing::debug!(channel = %self.channel, "dropping delivery for closed subscription");
            return;
        }
        self.sink.send(&self.channel, event);
    }
}

/// Handle returned to subscribers.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) channel: String,
    pub(crate) manager: Weak<super::PubSubManager>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl SubscriptionHandle {
    /// Channel the pushes are emitted on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops the subscription. Pushes already in flight are discarded.
    pub fn unsubscribe(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_subscription(self.id);
        }
    }
}
