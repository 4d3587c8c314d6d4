//! In-memory transport and event recording for lifecycle tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, sink, stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use serverwatch_protocol::ServerStatus;
use serverwatch_realtime::{
    Callbacks, ConnectionError, ConnectionManager, Connector, FrameSink, FrameStream,
    ManagerConfig,
};

/// What the next connection attempt does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Handshake succeeds; the server half is handed to the test.
    Accept,
    /// Handshake fails immediately.
    Refuse,
    /// Handshake never completes.
    Hang,
}

/// Connector following a script of [`Step`]s. Attempts beyond the script
/// are refused.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    urls: Mutex<Vec<Url>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedConnector {
    pub fn new(
        script: impl IntoIterator<Item = Step>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            urls: Mutex::new(Vec::new()),
            servers,
        });
        (connector, accepted)
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        url: &Url,
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), tungstenite::Error>> {
        self.urls.lock().unwrap().push(url.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Refuse);

        match step {
            Step::Refuse => future::ready(Err(tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))))
            .boxed(),
            Step::Hang => future::pending().boxed(),
            Step::Accept => {
                let (to_server, from_client) = mpsc::unbounded_channel::<Message>();
                let (to_client, from_server) =
                    mpsc::unbounded_channel::<Result<Message, tungstenite::Error>>();

                let sink: FrameSink = Box::pin(sink::unfold(to_server, |tx, msg: Message| async move {
                    tx.send(msg)
                        .map_err(|_| tungstenite::Error::ConnectionClosed)?;
                    Ok::<_, tungstenite::Error>(tx)
                }));
                let stream: FrameStream = Box::pin(stream::unfold(from_server, |mut rx| async move {
                    rx.recv().await.map(|frame| (frame, rx))
                }));

                let _ = self.servers.send(ServerSide {
                    from_client,
                    to_client: Some(to_client),
                });
                future::ready(Ok((sink, stream))).boxed()
            }
        }
    }
}

/// Server half of an accepted in-memory transport.
pub struct ServerSide {
    from_client: mpsc::UnboundedReceiver<Message>,
    to_client: Option<mpsc::UnboundedSender<Result<Message, tungstenite::Error>>>,
}

impl ServerSide {
    pub fn send_json(&self, json: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(Message::text(json.to_owned())));
        }
    }

    /// Sends a close frame with `code`.
    pub fn close(&self, code: u16, reason: &str) {
        if let Some(tx) = &self.to_client {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_owned().into(),
            };
            let _ = tx.send(Ok(Message::Close(Some(frame))));
        }
    }

    /// Drops the connection without a close frame.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Frames the client has sent since the last call.
    pub fn received(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

pub fn is_ping(frame: &Message) -> bool {
    matches!(frame, Message::Text(text) if text.as_str() == r#"{"type":"ping"}"#)
}

/// The code and reason of the first close frame in `frames`.
pub fn close_frame(frames: &[Message]) -> Option<(u16, String)> {
    frames.iter().find_map(|frame| match frame {
        Message::Close(Some(f)) => Some((u16::from(f.code), f.reason.as_str().to_owned())),
        _ => None,
    })
}

/// Everything a subscriber observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open,
    Close(u16),
    Error(ConnectionError),
    Metrics(String),
    Realtime(String, i64),
    SystemInfo(String),
    Status(String, ServerStatus),
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> Callbacks {
        let (open, close, error) = (self.clone(), self.clone(), self.clone());
        let (metrics, realtime, info, status) =
            (self.clone(), self.clone(), self.clone(), self.clone());
        Callbacks::new()
            .on_open(move || open.push(Event::Open))
            .on_close(move |c| close.push(Event::Close(c.code)))
            .on_error(move |e| error.push(Event::Error(e.clone())))
            .on_metrics_update(move |m| metrics.push(Event::Metrics(m.server_id.clone())))
            .on_metrics_realtime(move |m| {
                realtime.push(Event::Realtime(m.server_id.clone(), m.timestamp))
            })
            .on_system_info_update(move |m| info.push(Event::SystemInfo(m.server_id.clone())))
            .on_server_status_update(move |m| {
                status.push(Event::Status(m.server_id.clone(), m.status))
            })
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Returns and clears the recorded events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn opens(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Open).count()
    }
}

pub fn config(max_attempts: u32) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.reconnect.max_attempts = max_attempts;
    config
}

pub fn manager(
    config: ManagerConfig,
    script: impl IntoIterator<Item = Step>,
) -> (
    ConnectionManager,
    Arc<ScriptedConnector>,
    mpsc::UnboundedReceiver<ServerSide>,
) {
    let (connector, accepted) = ScriptedConnector::new(script);
    let manager = ConnectionManager::with_connector(config, connector.clone());
    (manager, connector, accepted)
}

/// Lets spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Moves the paused clock forward by `ms`, letting tasks run on both sides.
pub async fn advance(ms: u64) {
    settle().await;
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}
