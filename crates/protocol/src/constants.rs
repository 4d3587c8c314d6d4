use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Close code for a normal, intentional closure. Suppresses reconnection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code reported for connections that dropped without a close frame
/// (refused, timed out, reset).
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How often a `{"type":"ping"}` frame is sent while the connection is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for a connection attempt to open before it is aborted.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Base delay between reconnect attempts. Attempt `n` waits
/// `base * min(n, BACKOFF_MAX_MULTIPLIER)`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(3);

/// Abnormal closes tolerated before reconnection is disabled.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Cap on the linear backoff multiplier.
pub const BACKOFF_MAX_MULTIPLIER: u32 = 3;

/// Path of the dashboard's realtime endpoint behind the API prefix.
pub const FRONTEND_WS_PATH: &str = "/api/ws/frontend";

/// Query parameter carrying the bearer credential.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Maximum inbound message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Inbound message type identifier (the `type` field on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // Heartbeat
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Session
    #[serde(rename = "auth_success")]
    AuthSuccess,
    #[serde(rename = "connection_status")]
    ConnectionStatus,
    #[serde(rename = "error")]
    Error,

    // Server push updates
    #[serde(rename = "metrics_update")]
    MetricsUpdate,
    #[serde(rename = "metrics_realtime")]
    MetricsRealtime,
    #[serde(rename = "system_info_update")]
    SystemInfoUpdate,
    #[serde(rename = "swap_info_update")]
    SwapInfoUpdate,
    #[serde(rename = "server_status_update")]
    ServerStatusUpdate,
    #[serde(rename = "process_info_update")]
    ProcessInfoUpdate,
    #[serde(rename = "gpu_info_update")]
    GpuInfoUpdate,

    /// Forward compatibility: unknown message types map here.
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Maps a wire `type` string to its kind.
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "auth_success" => Self::AuthSuccess,
            "connection_status" => Self::ConnectionStatus,
            "error" => Self::Error,
            "metrics_update" => Self::MetricsUpdate,
            "metrics_realtime" => Self::MetricsRealtime,
            "system_info_update" => Self::SystemInfoUpdate,
            "swap_info_update" => Self::SwapInfoUpdate,
            "server_status_update" => Self::ServerStatusUpdate,
            "process_info_update" => Self::ProcessInfoUpdate,
            "gpu_info_update" => Self::GpuInfoUpdate,
            _ => Self::Unknown,
        }
    }

    /// The wire `type` string. `Unknown` has none and returns `"unknown"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::AuthSuccess => "auth_success",
            Self::ConnectionStatus => "connection_status",
            Self::Error => "error",
            Self::MetricsUpdate => "metrics_update",
            Self::MetricsRealtime => "metrics_realtime",
            Self::SystemInfoUpdate => "system_info_update",
            Self::SwapInfoUpdate => "swap_info_update",
            Self::ServerStatusUpdate => "server_status_update",
            Self::ProcessInfoUpdate => "process_info_update",
            Self::GpuInfoUpdate => "gpu_info_update",
            Self::Unknown => "unknown",
        }
    }

    /// Heartbeat traffic is consumed by the connection itself.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}
