//! WebSocket read pump. Hands text frames to the manager.

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::types::CloseInfo;

/// Why the read loop stopped.
#[derive(Debug)]
pub(crate) enum ReadEnd {
    /// The client asked to close the transport.
    Cancelled,
    /// The peer closed, or the stream ended.
    Closed(CloseInfo),
    /// The transport failed.
    Failed(tungstenite::Error),
}

/// Reads frames until the transport ends, passing each text frame to
/// `on_text`. Heartbeat and binary frames are consumed here.
pub(crate) async fn read_pump<S, F>(mut read: S, cancel: &CancellationToken, mut on_text: F) -> ReadEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: FnMut(&str),
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadEnd::Cancelled,
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => on_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let info = CloseInfo::from_frame(frame);
                        debug!(code = info.code, "received close frame");
                        return ReadEnd::Closed(info);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => trace!("control frame"),
                    Some(Ok(_)) => trace!("ignoring binary frame"),
                    Some(Err(e)) => return ReadEnd::Failed(e),
                    None => {
                        debug!("websocket stream ended");
                        return ReadEnd::Closed(CloseInfo::abnormal("stream ended"));
                    }
                }
            }
        }
    }
}
