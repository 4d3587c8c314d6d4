//! Reconnect timer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manager::Inner;

/// Cancels and clears a pending timer, if any.
pub(crate) fn cancel_pending(timer: &mut Option<CancellationToken>) {
    if let Some(token) = timer.take() {
        token.cancel();
    }
}

/// Fires [`Inner::reconnect`] after `delay` unless `timer` is cancelled
/// first. The manager re-checks the timer under its lock, so a cancel that
/// races the wake-up still wins.
pub(crate) fn schedule(inner: Arc<Inner>, delay: Duration, timer: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => debug!("reconnect timer cancelled"),
            _ = tokio::time::sleep(delay) => inner.reconnect(&timer),
        }
    });
}
