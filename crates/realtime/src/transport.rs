//! Transport seam between the manager and the WebSocket library.

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use serverwatch_protocol::constants::WS_MAX_MESSAGE_SIZE;

/// Outbound half of an open transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Inbound half of an open transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Opens transports. The manager calls this once per connection attempt.
///
/// The returned future resolves when the handshake completes, and is
/// dropped if the attempt times out or is cancelled.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<(FrameSink, FrameStream), tungstenite::Error>>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    max_message_size: usize,
}

impl WsConnector {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(WS_MAX_MESSAGE_SIZE)
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<(FrameSink, FrameStream), tungstenite::Error>> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        ws_config.max_frame_size = Some(self.max_message_size);
        let url = url.to_string();

        async move {
            let (ws_stream, _) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
            let (write, read) = ws_stream.split();
            let sink: FrameSink = Box::pin(write);
            let stream: FrameStream = Box::pin(read);
            Ok((sink, stream))
        }
        .boxed()
    }
}
