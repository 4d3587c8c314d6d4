//! Subscriber and message-handler registries.
//!
//! Broadcasts iterate over a snapshot taken under the registry lock and run
//! with the lock released, so callbacks may register or cancel freely.
//! Every entry carries a liveness flag checked right before each
//! invocation: an entry cancelled mid-broadcast is skipped for the rest of
//! that broadcast.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};
use uuid::Uuid;

use serverwatch_protocol::{
    MetricsRealtime, MetricsUpdate, ServerMessage, ServerStatusUpdate, SystemInfoUpdate,
};

use crate::types::{CloseInfo, ConnectionError};

pub type OnOpenCallback = Arc<dyn Fn() + Send + Sync>;
pub type OnCloseCallback = Arc<dyn Fn(&CloseInfo) + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;
pub type OnMetricsUpdateCallback = Arc<dyn Fn(&MetricsUpdate) + Send + Sync>;
pub type OnMetricsRealtimeCallback = Arc<dyn Fn(&MetricsRealtime) + Send + Sync>;
pub type OnSystemInfoUpdateCallback = Arc<dyn Fn(&SystemInfoUpdate) + Send + Sync>;
pub type OnServerStatusUpdateCallback = Arc<dyn Fn(&ServerStatusUpdate) + Send + Sync>;

/// Raw handler receiving every decoded application message.
pub type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Lifecycle and typed-message callbacks of one subscriber.
///
/// All callbacks are optional:
///
/// ```rust
/// use serverwatch_realtime::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_open(|| println!("live"))
///     .on_metrics_update(|m| println!("{} cpu={:?}", m.server_id, m.cpu_usage));
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_open: Option<OnOpenCallback>,
    pub(crate) on_close: Option<OnCloseCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_metrics_update: Option<OnMetricsUpdateCallback>,
    pub(crate) on_metrics_realtime: Option<OnMetricsRealtimeCallback>,
    pub(crate) on_system_info_update: Option<OnSystemInfoUpdateCallback>,
    pub(crate) on_server_status_update: Option<OnServerStatusUpdateCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_metrics_update", &self.on_metrics_update.is_some())
            .field("on_metrics_realtime", &self.on_metrics_realtime.is_some())
            .field("on_system_info_update", &self.on_system_info_update.is_some())
            .field("on_server_status_update", &self.on_server_status_update.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the transport opens, or at registration if it already is.
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Called whenever the transport closes, intentionally or not.
    pub fn on_close(mut self, f: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Called for transport failures, credential rejection and budget
    /// exhaustion.
    pub fn on_error(mut self, f: impl Fn(&ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_metrics_update(mut self, f: impl Fn(&MetricsUpdate) + Send + Sync + 'static) -> Self {
        self.on_metrics_update = Some(Arc::new(f));
        self
    }

    pub fn on_metrics_realtime(
        mut self,
        f: impl Fn(&MetricsRealtime) + Send + Sync + 'static,
    ) -> Self {
        self.on_metrics_realtime = Some(Arc::new(f));
        self
    }

    pub fn on_system_info_update(
        mut self,
        f: impl Fn(&SystemInfoUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_system_info_update = Some(Arc::new(f));
        self
    }

    pub fn on_server_status_update(
        mut self,
        f: impl Fn(&ServerStatusUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_server_status_update = Some(Arc::new(f));
        self
    }
}

/// Lifecycle event fanned out to every subscriber.
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    Open,
    Close(CloseInfo),
    Error(ConnectionError),
}

#[derive(Clone)]
struct Target {
    live: Arc<AtomicBool>,
    callbacks: Callbacks,
}

/// Notices plus the subscribers to deliver them to, captured together so
/// delivery can happen after every lock is released.
#[must_use]
pub(crate) struct Broadcast {
    notices: Vec<Notice>,
    targets: Vec<Target>,
}

impl Broadcast {
    pub(crate) fn deliver(self) {
        for notice in &self.notices {
            for target in &self.targets {
                if !target.live.load(Ordering::Acquire) {
                    continue;
                }
                let callbacks = &target.callbacks;
                match notice {
                    Notice::Open => {
                        if let Some(cb) = &callbacks.on_open {
                            guarded("on_open", || cb());
                        }
                    }
                    Notice::Close(info) => {
                        if let Some(cb) = &callbacks.on_close {
                            guarded("on_close", || cb(info));
                        }
                    }
                    Notice::Error(error) => {
                        if let Some(cb) = &callbacks.on_error {
                            guarded("on_error", || cb(error));
                        }
                    }
                }
            }
        }
    }
}

struct SubscriberEntry {
    id: String,
    token: Uuid,
    live: Arc<AtomicBool>,
    callbacks: Callbacks,
}

struct HandlerEntry {
    token: Uuid,
    live: Arc<AtomicBool>,
    handler: MessageHandler,
}

#[derive(Default)]
struct Entries {
    subscribers: Vec<SubscriberEntry>,
    handlers: Vec<HandlerEntry>,
}

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub(crate) struct Registry {
    entries: Arc<Mutex<Entries>>,
}

impl Registry {
    /// Adds a subscriber. An existing registration under the same `id` is
    /// replaced in place and its old [`Subscription`] becomes inert.
    pub(crate) fn add_subscriber(&self, id: String, callbacks: Callbacks) -> Subscription {
        let live = Arc::new(AtomicBool::new(true));
        let token = Uuid::new_v4();
        let entry = SubscriberEntry {
            id,
            token,
            live: live.clone(),
            callbacks,
        };

        let mut entries = lock(&self.entries);
        match entries.subscribers.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                debug!(id = %entry.id, "replacing subscriber");
                existing.live.store(false, Ordering::Release);
                *existing = entry;
            }
            None => entries.subscribers.push(entry),
        }
        drop(entries);

        Subscription::new(SubscriptionKind::Subscriber, token, live, &self.entries)
    }

    pub(crate) fn add_handler(&self, handler: MessageHandler) -> Subscription {
        let live = Arc::new(AtomicBool::new(true));
        let token = Uuid::new_v4();
        lock(&self.entries).handlers.push(HandlerEntry {
            token,
            live: live.clone(),
            handler,
        });
        Subscription::new(SubscriptionKind::Handler, token, live, &self.entries)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.entries).subscribers.len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        lock(&self.entries).handlers.len()
    }

    /// Pairs `notices` with the current subscribers.
    pub(crate) fn broadcast(&self, notices: Vec<Notice>) -> Broadcast {
        let targets = if notices.is_empty() {
            Vec::new()
        } else {
            self.targets()
        };
        Broadcast { notices, targets }
    }

    fn targets(&self) -> Vec<Target> {
        lock(&self.entries)
            .subscribers
            .iter()
            .map(|e| Target {
                live: e.live.clone(),
                callbacks: e.callbacks.clone(),
            })
            .collect()
    }

    /// Delivers an application message: raw handlers first, then the typed
    /// subscriber callbacks, each in registration order.
    pub(crate) fn dispatch(&self, message: &ServerMessage) {
        let (handlers, targets): (Vec<_>, Vec<_>) = {
            let entries = lock(&self.entries);
            let handlers = entries
                .handlers
                .iter()
                .map(|e| (e.live.clone(), e.handler.clone()))
                .collect();
            let targets = entries
                .subscribers
                .iter()
                .map(|e| Target {
                    live: e.live.clone(),
                    callbacks: e.callbacks.clone(),
                })
                .collect();
            (handlers, targets)
        };

        if handlers.is_empty() {
            warn!(msg_type = message.type_name(), "no message handler registered");
        }
        for (live, handler) in &handlers {
            if live.load(Ordering::Acquire) {
                guarded("message handler", || handler(message));
            }
        }

        for target in &targets {
            if !target.live.load(Ordering::Acquire) {
                continue;
            }
            let callbacks = &target.callbacks;
            match message {
                ServerMessage::MetricsUpdate(m) => {
                    if let Some(cb) = &callbacks.on_metrics_update {
                        guarded("on_metrics_update", || cb(m));
                    }
                }
                ServerMessage::MetricsRealtime(m) => {
                    if let Some(cb) = &callbacks.on_metrics_realtime {
                        guarded("on_metrics_realtime", || cb(m));
                    }
                }
                ServerMessage::SystemInfoUpdate(m) => {
                    if let Some(cb) = &callbacks.on_system_info_update {
                        guarded("on_system_info_update", || cb(m));
                    }
                }
                ServerMessage::ServerStatusUpdate(m) => {
                    if let Some(cb) = &callbacks.on_server_status_update {
                        guarded("on_server_status_update", || cb(m));
                    }
                }
                _ => {}
            }
        }
    }

    /// Drops every registration; outstanding subscriptions become inert.
    pub(crate) fn clear(&self) {
        let mut entries = lock(&self.entries);
        for e in entries.subscribers.drain(..) {
            e.live.store(false, Ordering::Release);
        }
        for e in entries.handlers.drain(..) {
            e.live.store(false, Ordering::Release);
        }
    }
}

/// Runs one callback, containing any panic it raises.
pub(crate) fn guarded(callback: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback, "callback panicked");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Subscriber,
    Handler,
}

/// Handle to a registration. [`cancel`](Self::cancel) removes it and may be
/// called any number of times. Dropping the handle leaves the registration
/// in place.
#[must_use = "dropping a Subscription does not unregister it; keep it to cancel later"]
pub struct Subscription {
    kind: SubscriptionKind,
    token: Uuid,
    live: Arc<AtomicBool>,
    entries: Weak<Mutex<Entries>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    fn new(
        kind: SubscriptionKind,
        token: Uuid,
        live: Arc<AtomicBool>,
        entries: &Arc<Mutex<Entries>>,
    ) -> Self {
        Self {
            kind,
            token,
            live,
            entries: Arc::downgrade(entries),
        }
    }

    /// Whether the registration still receives events.
    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Removes the registration. Safe to call from inside a callback.
    pub fn cancel(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = lock(&entries);
        match self.kind {
            SubscriptionKind::Subscriber => entries.subscribers.retain(|e| e.token != self.token),
            SubscriptionKind::Handler => entries.handlers.retain(|e| e.token != self.token),
        }
    }
}
