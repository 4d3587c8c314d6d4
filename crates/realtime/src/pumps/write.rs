//! WebSocket write pump.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{trace, warn};

/// Writes queued frames until every sender is gone or a close frame has
/// been sent.
pub(crate) async fn write_pump<S>(mut write: S, mut write_rx: mpsc::Receiver<Message>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(msg) = write_rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            warn!(error = %e, "websocket write failed");
            return;
        }
        if is_close {
            trace!("close frame sent");
            return;
        }
    }

    let _ = write.close().await;
}
