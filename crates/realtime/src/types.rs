//! Public types for the realtime connection manager.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use serverwatch_protocol::constants::{
    BACKOFF_MAX_MULTIPLIER, CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_BASE_DELAY,
};

use crate::config::duration_ms;
use crate::endpoint::EndpointError;

/// Lifecycle phase of the managed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No transport and nothing scheduled.
    Idle,
    /// A transport is being opened. `attempt` is 1-based.
    Connecting { attempt: u32 },
    /// The transport is open and the heartbeat is running.
    Open,
    /// The client asked the transport to close and is waiting for it.
    Closing { intent: CloseIntent },
    /// Waiting for the reconnect timer after an abnormal close.
    BackingOff { attempt: u32, delay: Duration },
    /// Connection attempts are refused until
    /// [`reset_credential_rejection`](crate::ConnectionManager::reset_credential_rejection).
    Disabled { reason: DisableReason },
}

/// Why the client is closing its own transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
    /// `disconnect()` was called.
    Operator,
    /// The backend refused the credential.
    CredentialRejected,
}

impl CloseIntent {
    /// Reason string sent in the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Operator => "Manual disconnect",
            Self::CredentialRejected => "Token invalid",
        }
    }
}

/// Why reconnection is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    CredentialRejected,
    RetriesExhausted,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialRejected => f.write_str("credential rejected"),
            Self::RetriesExhausted => f.write_str("reconnect budget exhausted"),
        }
    }
}

/// How a transport ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1000 = normal, 1006 = abnormal).
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure (code 1000).
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_NORMAL, reason)
    }

    /// A failure without a close handshake (code 1006).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Builds from a received close frame. A frame without a status maps to 1005.
    pub fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(f) => Self::new(u16::from(f.code), f.reason.as_str()),
            None => Self::new(CLOSE_NO_STATUS, ""),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "{} (code {})", self.reason, self.code)
        }
    }
}

/// Error delivered to subscribers' `on_error` callbacks.
///
/// None of these are returned to callers; they only travel through the
/// broadcast channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    #[error("reconnect budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl ConnectionError {
    /// Terminal errors stop reconnection until an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CredentialRejected(_) | Self::RetriesExhausted { .. }
        )
    }
}

/// Linear, capped reconnect backoff with a bounded attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Abnormal closes tolerated before reconnection is disabled.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: RECONNECT_BASE_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Delay for a given attempt number (1-based): `base * min(attempt, 3)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.clamp(1, BACKOFF_MAX_MULTIPLIER)
    }
}
