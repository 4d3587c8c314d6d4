use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::MessageKind;

/// Errors decoding an inbound text frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object with a string `type` field")]
    MissingType,

    #[error("`{kind}` message has no `data` payload")]
    MissingData { kind: &'static str },

    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Push payloads
// ---------------------------------------------------------------------------

/// Periodic resource snapshot for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_upload: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_download: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

/// High-frequency sample used by the live charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRealtime {
    pub server_id: String,
    /// Sample time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_upload: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_download: Option<f64>,
}

impl MetricsRealtime {
    /// Sample time as a UTC timestamp, if in range.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Static host facts reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfoUpdate {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SystemInfo>,
}

/// Reachability of a monitored server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    Error,
    Warning,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusUpdate {
    pub server_id: String,
    pub status: ServerStatus,
}

/// Number of agents currently attached to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(
        default,
        alias = "agents_count",
        alias = "count",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_count: Option<u64>,
}

/// Loosely typed per-server payload (swap, process and GPU updates).
///
/// Only `server_id` is pinned down; everything else is kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Status message the backend sends on failures, e.g.
/// `{"type":"error","status":"error","message":"Token无效"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Message fragments the backend uses when it refuses a credential.
const CREDENTIAL_REJECTION_MARKERS: [&str; 4] = ["Token无效", "Token过期", "token", "Token"];

impl ErrorNotice {
    /// Whether this notice means the credential is invalid or expired.
    pub fn is_credential_rejection(&self) -> bool {
        if self.status.as_deref() != Some("error") {
            return false;
        }
        let message = self.message.as_deref().unwrap_or_default();
        CREDENTIAL_REJECTION_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

// ---------------------------------------------------------------------------
// Inbound envelope
// ---------------------------------------------------------------------------

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ping,
    Pong,
    AuthSuccess(ServerPayload),
    ConnectionStatus(ConnectionStatus),
    MetricsUpdate(MetricsUpdate),
    MetricsRealtime(MetricsRealtime),
    SystemInfoUpdate(SystemInfoUpdate),
    SwapInfoUpdate(ServerPayload),
    ServerStatusUpdate(ServerStatusUpdate),
    ProcessInfoUpdate(ServerPayload),
    GpuInfoUpdate(ServerPayload),
    Error(ErrorNotice),
    /// A `type` this client does not know, kept verbatim.
    Unknown { kind: String, raw: Value },
}

impl ServerMessage {
    /// Decodes a text frame.
    ///
    /// Push updates carry their body under `data`; `auth_success` and
    /// `connection_status` accept it either under `data` or inline.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_owned();

        let message = match MessageKind::from_wire(&kind) {
            MessageKind::Ping => Self::Ping,
            MessageKind::Pong => Self::Pong,
            MessageKind::AuthSuccess => {
                Self::AuthSuccess(data_or_inline(MessageKind::AuthSuccess, value)?)
            }
            MessageKind::ConnectionStatus => {
                Self::ConnectionStatus(data_or_inline(MessageKind::ConnectionStatus, value)?)
            }
            MessageKind::Error => Self::Error(inline(MessageKind::Error, value)?),
            MessageKind::MetricsUpdate => {
                Self::MetricsUpdate(data(MessageKind::MetricsUpdate, value)?)
            }
            MessageKind::MetricsRealtime => {
                Self::MetricsRealtime(data(MessageKind::MetricsRealtime, value)?)
            }
            MessageKind::SystemInfoUpdate => {
                Self::SystemInfoUpdate(data(MessageKind::SystemInfoUpdate, value)?)
            }
            MessageKind::SwapInfoUpdate => {
                Self::SwapInfoUpdate(data(MessageKind::SwapInfoUpdate, value)?)
            }
            MessageKind::ServerStatusUpdate => {
                Self::ServerStatusUpdate(data(MessageKind::ServerStatusUpdate, value)?)
            }
            MessageKind::ProcessInfoUpdate => {
                Self::ProcessInfoUpdate(data(MessageKind::ProcessInfoUpdate, value)?)
            }
            MessageKind::GpuInfoUpdate => {
                Self::GpuInfoUpdate(data(MessageKind::GpuInfoUpdate, value)?)
            }
            MessageKind::Unknown => Self::Unknown { kind, raw: value },
        };
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::AuthSuccess(_) => MessageKind::AuthSuccess,
            Self::ConnectionStatus(_) => MessageKind::ConnectionStatus,
            Self::MetricsUpdate(_) => MessageKind::MetricsUpdate,
            Self::MetricsRealtime(_) => MessageKind::MetricsRealtime,
            Self::SystemInfoUpdate(_) => MessageKind::SystemInfoUpdate,
            Self::SwapInfoUpdate(_) => MessageKind::SwapInfoUpdate,
            Self::ServerStatusUpdate(_) => MessageKind::ServerStatusUpdate,
            Self::ProcessInfoUpdate(_) => MessageKind::ProcessInfoUpdate,
            Self::GpuInfoUpdate(_) => MessageKind::GpuInfoUpdate,
            Self::Error(_) => MessageKind::Error,
            Self::Unknown { .. } => MessageKind::Unknown,
        }
    }

    /// The wire `type` string, including the original one for unknown kinds.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().as_str(),
        }
    }

    /// The server this message is about, when it names one.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::MetricsUpdate(m) => Some(&m.server_id),
            Self::MetricsRealtime(m) => Some(&m.server_id),
            Self::SystemInfoUpdate(m) => Some(&m.server_id),
            Self::ServerStatusUpdate(m) => Some(&m.server_id),
            Self::SwapInfoUpdate(p) | Self::ProcessInfoUpdate(p) | Self::GpuInfoUpdate(p) => {
                p.server_id.as_deref()
            }
            _ => None,
        }
    }
}

fn data<T: DeserializeOwned>(kind: MessageKind, mut value: Value) -> Result<T, DecodeError> {
    let body = value
        .get_mut("data")
        .map(Value::take)
        .filter(|v| !v.is_null())
        .ok_or(DecodeError::MissingData {
            kind: kind.as_str(),
        })?;
    serde_json::from_value(body).map_err(|source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    })
}

fn data_or_inline<T: DeserializeOwned>(kind: MessageKind, value: Value) -> Result<T, DecodeError> {
    let nested = value.get("data").is_some_and(Value::is_object);
    if nested {
        data(kind, value)
    } else {
        inline(kind, value)
    }
}

fn inline<T: DeserializeOwned>(kind: MessageKind, mut value: Value) -> Result<T, DecodeError> {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("type");
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Messages the dashboard sends to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat; the backend answers with `pong`.
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
