//! One transport's lifetime: handshake, pumps, and close reporting.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use serverwatch_protocol::constants::CLOSE_NORMAL;

use crate::config;
use crate::manager::Inner;
use crate::pumps::read::{ReadEnd, read_pump};
use crate::pumps::write::write_pump;
use crate::types::{CloseInfo, ConnectionError};

/// Outbound frames buffered ahead of the writer.
const WRITE_QUEUE: usize = 64;

/// Drives transport `epoch` from handshake to close. Every exit path reports
/// exactly one close to the manager.
pub(crate) async fn run(inner: Arc<Inner>, epoch: u64, url: Url, close: CancellationToken) {
    let timeout = inner.config.connect_timeout;
    let handshake = tokio::time::timeout(timeout, inner.connector.connect(&url));

    let result = tokio::select! {
        biased;
        _ = close.cancelled() => {
            debug!(epoch, "connection attempt abandoned");
            let reason = inner.close_reason();
            inner.closed(epoch, CloseInfo::normal(reason));
            return;
        }
        result = handshake => result,
    };

    let (sink, stream) = match result {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(error = %e, "realtime connection failed");
            inner.transport_error(epoch, ConnectionError::Transport(e.to_string()));
            inner.closed(epoch, CloseInfo::abnormal(e.to_string()));
            return;
        }
        Err(_) => {
            warn!(
                timeout_ms = config::millis(timeout),
                "realtime connection attempt timed out"
            );
            inner.transport_error(epoch, ConnectionError::ConnectTimeout(timeout));
            inner.closed(epoch, CloseInfo::abnormal("connect timeout"));
            return;
        }
    };

    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
    tokio::spawn(write_pump(sink, write_rx));

    if !inner.opened(epoch, &write_tx) {
        let reason = inner.close_reason();
        send_close(&write_tx, reason).await;
        inner.closed(epoch, CloseInfo::normal(reason));
        return;
    }

    let end = read_pump(stream, &close, |text| inner.handle_text(epoch, text)).await;
    let info = match end {
        ReadEnd::Cancelled => {
            let reason = inner.close_reason();
            send_close(&write_tx, reason).await;
            CloseInfo::normal(reason)
        }
        ReadEnd::Closed(info) => info,
        ReadEnd::Failed(e) => {
            warn!(error = %e, "realtime connection read failed");
            inner.transport_error(epoch, ConnectionError::Transport(e.to_string()));
            CloseInfo::abnormal(e.to_string())
        }
    };

    drop(write_tx);
    inner.closed(epoch, info);
}

async fn send_close(write_tx: &mpsc::Sender<Message>, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(CLOSE_NORMAL),
        reason: reason.into(),
    };
    if write_tx.send(Message::Close(Some(frame))).await.is_err() {
        debug!("writer already gone, close frame not sent");
    }
}
