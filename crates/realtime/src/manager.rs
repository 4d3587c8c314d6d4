//! Connection manager owning the process-wide realtime transport.
//!
//! One [`ConnectionManager`] is created at startup and cloned into every
//! consumer. It keeps at most one transport open, fans inbound messages out
//! to registered handlers, sends heartbeats while open, and reconnects after
//! abnormal closes with a linear, capped backoff until the attempt budget is
//! spent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use serverwatch_protocol::{ErrorNotice, ServerMessage};

use crate::config::{self, ManagerConfig};
use crate::endpoint;
use crate::machine::{Machine, Recovery};
use crate::pumps::ping::ping_pump;
use crate::reconnection::{self, cancel_pending};
use crate::registry::{self, Callbacks, Notice, Registry, Subscription};
use crate::session;
use crate::transport::{Connector, WsConnector};
use crate::types::{CloseInfo, CloseIntent, ConnectionError, ConnectionPhase};

/// Shared handle to the realtime connection.
///
/// Cloning is cheap; all clones drive the same connection. No operation
/// returns an error: failures reach subscribers through `on_error` and the
/// connected flag.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    pub(crate) connector: Arc<dyn Connector>,
    state: Mutex<State>,
    registry: Registry,
    connected_tx: watch::Sender<bool>,
}

struct State {
    machine: Machine,
    /// Incremented per transport; events from older transports are ignored.
    epoch: u64,
    transport: Option<TransportSlot>,
    reconnect: Option<CancellationToken>,
    credential: Option<String>,
}

impl State {
    fn is_current(&self, epoch: u64) -> bool {
        self.transport.as_ref().is_some_and(|t| t.epoch == epoch)
    }
}

struct TransportSlot {
    epoch: u64,
    /// Endpoint with the credential masked, for logs.
    target: String,
    close: CancellationToken,
    heartbeat: Option<CancellationToken>,
}

impl TransportSlot {
    /// Stops the heartbeat before asking the transport to close.
    fn stop(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.cancel();
        }
        self.close.cancel();
    }
}

impl ConnectionManager {
    /// Creates a manager using the `tokio-tungstenite` connector.
    pub fn new(config: ManagerConfig) -> Self {
        let connector = WsConnector::new(config.max_message_size);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates a manager with a custom transport.
    pub fn with_connector(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let machine = Machine::new(config.reconnect.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(State {
                    machine,
                    epoch: 0,
                    transport: None,
                    reconnect: None,
                    credential: None,
                }),
                registry: Registry::default(),
                connected_tx,
            }),
        }
    }

    /// Opens the connection with `credential`.
    ///
    /// Does nothing while an attempt is in flight, while a transport is open,
    /// or while reconnection is disabled. A pending reconnect timer is
    /// replaced by this attempt. Outside a Tokio runtime the call only
    /// reports a [`ConnectionError::Transport`] to subscribers.
    pub fn connect(&self, credential: &str) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("connect called outside a Tokio runtime");
            self.inner
                .registry
                .broadcast(vec![Notice::Error(ConnectionError::Transport(
                    "no Tokio runtime available".into(),
                ))])
                .deliver();
            return;
        }

        let broadcast = {
            let mut state = self.inner.lock();
            if let Err(skip) = state.machine.admit_connect() {
                info!(reason = ?skip, phase = ?state.machine.phase(), "connect ignored");
                return;
            }
            cancel_pending(&mut state.reconnect);
            state.credential = Some(credential.to_owned());

            let mut notices = Vec::new();
            self.inner.start_attempt(&mut state, &mut notices);
            self.inner.registry.broadcast(notices)
        };
        broadcast.deliver();
    }

    /// Closes the connection with a normal closure and cancels every timer.
    /// The next close never triggers a reconnect.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        cancel_pending(&mut state.reconnect);
        let live = state.transport.is_some();
        state.machine.disconnect(live);
        if let Some(slot) = &state.transport {
            slot.stop();
        }
        self.inner.set_connected(false);
        info!(transport_live = live, "realtime connection disconnected by operator");
    }

    /// Re-enables `connect` after a credential rejection or an exhausted
    /// reconnect budget, and clears the attempt counter.
    pub fn reset_credential_rejection(&self) {
        let mut state = self.inner.lock();
        state.machine.reset();
        info!("reconnection re-enabled");
    }

    /// Adds a subscriber under `id`, replacing any subscriber already
    /// registered with that id. If the connection is open, `on_open` runs
    /// before this returns.
    pub fn register_callbacks(&self, id: impl Into<String>, callbacks: Callbacks) -> Subscription {
        let id = id.into();
        let on_open = callbacks.on_open.clone();
        let (subscription, open) = {
            // Holding the state lock orders this against the open broadcast,
            // so `on_open` fires exactly once either way.
            let state = self.inner.lock();
            let subscription = self.inner.registry.add_subscriber(id.clone(), callbacks);
            (subscription, *state.machine.phase() == ConnectionPhase::Open)
        };
        debug!(id = %id, open, "subscriber registered");

        if open
            && subscription.is_active()
            && let Some(cb) = on_open
        {
            registry::guarded("on_open", || cb());
        }
        subscription
    }

    /// Adds a raw handler receiving every decoded application message.
    pub fn register_message_handler<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let subscription = self.inner.registry.add_handler(Arc::new(handler));
        debug!(handlers = self.inner.registry.handler_count(), "message handler registered");
        subscription
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Observes the connected flag.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().machine.phase().clone()
    }

    /// Failed attempts since the last successful open or normal close.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().machine.attempts()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Disconnects and drops every registration.
    pub fn shutdown(&self) {
        self.disconnect();
        self.inner.registry.clear();
        info!("connection manager shut down");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("phase", &self.phase())
            .field("connected", &self.is_connected())
            .field("subscribers", &self.inner.registry.subscriber_count())
            .field("handlers", &self.inner.registry.handler_count())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected(&self, value: bool) {
        self.connected_tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Builds the endpoint and spawns a session for it. A URL that cannot be
    /// built counts as a failed attempt.
    fn start_attempt(self: &Arc<Self>, state: &mut State, notices: &mut Vec<Notice>) {
        let credential = state.credential.clone().unwrap_or_default();
        match endpoint::resolve_ws_url(&self.config.endpoint, &credential) {
            Ok(url) => {
                let attempt = state.machine.begin_connect();
                state.epoch += 1;
                let epoch = state.epoch;
                let target = endpoint::redacted(&url);
                info!(
                    attempt,
                    max_attempts = state.machine.max_attempts(),
                    url = %target,
                    "opening realtime connection"
                );

                let close = CancellationToken::new();
                state.transport = Some(TransportSlot {
                    epoch,
                    target,
                    close: close.clone(),
                    heartbeat: None,
                });
                tokio::spawn(session::run(self.clone(), epoch, url, close));
            }
            Err(e) => {
                warn!(error = %e, "cannot build realtime endpoint");
                notices.push(Notice::Error(e.into()));
                let recovery = state.machine.failed();
                self.apply_recovery(state, recovery, notices);
            }
        }
    }

    fn apply_recovery(self: &Arc<Self>, state: &mut State, recovery: Recovery, notices: &mut Vec<Notice>) {
        match recovery {
            Recovery::Stop => {}
            Recovery::Retry { attempt, delay } => {
                info!(
                    attempt,
                    max_attempts = state.machine.max_attempts(),
                    delay_ms = config::millis(delay),
                    "scheduling reconnect"
                );
                let timer = CancellationToken::new();
                if let Some(previous) = state.reconnect.replace(timer.clone()) {
                    previous.cancel();
                }
                reconnection::schedule(self.clone(), delay, timer);
            }
            Recovery::GiveUp { attempts } => {
                error!(attempts, "reconnect budget exhausted, reconnection disabled");
                notices.push(Notice::Error(ConnectionError::RetriesExhausted { attempts }));
            }
        }
    }

    /// Reconnect timer fired.
    pub(crate) fn reconnect(self: &Arc<Self>, timer: &CancellationToken) {
        let broadcast = {
            let mut state = self.lock();
            if timer.is_cancelled() {
                return;
            }
            state.reconnect = None;
            if let Err(skip) = state.machine.admit_connect() {
                debug!(reason = ?skip, "reconnect skipped");
                return;
            }
            let mut notices = Vec::new();
            self.start_attempt(&mut state, &mut notices);
            self.registry.broadcast(notices)
        };
        broadcast.deliver();
    }

    /// Transport `epoch` finished its handshake. Returns `false` if the
    /// attempt was abandoned meanwhile.
    pub(crate) fn opened(self: &Arc<Self>, epoch: u64, write_tx: &mpsc::Sender<Message>) -> bool {
        let broadcast = {
            let mut state = self.lock();
            if !state.is_current(epoch) || !state.machine.opened() {
                debug!(epoch, "transport opened after the attempt was abandoned");
                return false;
            }
            self.set_connected(true);

            let period = self.config.heartbeat_interval;
            let Some(slot) = state.transport.as_mut() else {
                return false;
            };
            if !period.is_zero() {
                let heartbeat = slot.close.child_token();
                tokio::spawn(ping_pump(
                    write_tx.clone(),
                    period,
                    self.connected_tx.subscribe(),
                    heartbeat.clone(),
                ));
                slot.heartbeat = Some(heartbeat);
            }
            info!(url = %slot.target, "realtime connection open");
            self.registry.broadcast(vec![Notice::Open])
        };
        broadcast.deliver();
        true
    }

    /// Transport `epoch` ended.
    pub(crate) fn closed(self: &Arc<Self>, epoch: u64, info: CloseInfo) {
        let broadcast = {
            let mut state = self.lock();
            if !state.is_current(epoch) {
                debug!(epoch, "ignoring close from a stale transport");
                return;
            }
            if let Some(slot) = state.transport.take() {
                slot.stop();
            }
            self.set_connected(false);
            info!(code = info.code, reason = %info.reason, "realtime connection closed");

            let mut notices = vec![Notice::Close(info.clone())];
            let recovery = state.machine.closed(info.code);
            self.apply_recovery(&mut state, recovery, &mut notices);
            self.registry.broadcast(notices)
        };
        broadcast.deliver();
    }

    /// Advisory transport failure; the close that follows drives recovery.
    pub(crate) fn transport_error(&self, epoch: u64, error: ConnectionError) {
        let broadcast = {
            let state = self.lock();
            if !state.is_current(epoch) {
                return;
            }
            self.registry.broadcast(vec![Notice::Error(error)])
        };
        broadcast.deliver();
    }

    /// Reason to put in the close frame this client sends.
    pub(crate) fn close_reason(&self) -> &'static str {
        match self.lock().machine.phase() {
            ConnectionPhase::Closing { intent } => intent.reason(),
            _ => CloseIntent::Operator.reason(),
        }
    }

    /// Routes one inbound text frame from transport `epoch`.
    pub(crate) fn handle_text(&self, epoch: u64, text: &str) {
        if text.len() > self.config.max_message_size {
            warn!(len = text.len(), "message too large, dropping");
            return;
        }
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to decode message");
                return;
            }
        };
        trace!(msg_type = message.type_name(), "received message");

        match &message {
            ServerMessage::Ping | ServerMessage::Pong => return,
            ServerMessage::Error(notice) if notice.is_credential_rejection() => {
                if self.reject_credential(epoch, notice) {
                    return;
                }
            }
            _ => {}
        }
        self.registry.dispatch(&message);
    }

    /// Closes transport `epoch` because the backend refused the credential.
    fn reject_credential(&self, epoch: u64, notice: &ErrorNotice) -> bool {
        let broadcast = {
            let mut state = self.lock();
            if !state.is_current(epoch) || !state.machine.reject_credential() {
                return false;
            }
            if let Some(slot) = &state.transport {
                slot.stop();
            }
            cancel_pending(&mut state.reconnect);

            let message = notice.message.clone().unwrap_or_default();
            warn!(message = %message, "credential rejected, closing realtime connection");
            self.registry
                .broadcast(vec![Notice::Error(ConnectionError::CredentialRejected(message))])
        };
        broadcast.deliver();
        true
    }
}
