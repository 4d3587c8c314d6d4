//! Heartbeat pump. Sends `{"type":"ping"}` while the transport is open.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use serverwatch_protocol::ClientMessage;

/// Sends one heartbeat per `period` until cancelled, until the writer is
/// gone, or until `open` reports the transport is no longer open.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<Message>,
    period: Duration,
    open: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let ping = match ClientMessage::Ping.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to encode heartbeat");
            return;
        }
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !*open.borrow() {
                    debug!("transport no longer open, heartbeat stopped");
                    break;
                }
                if write_tx.send(Message::text(ping.clone())).await.is_err() {
                    break;
                }
                trace!("heartbeat sent");
            }
        }
    }
}
