pub mod constants;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageKind;
pub use messages::{
    ClientMessage, ConnectionStatus, DecodeError, ErrorNotice, MetricsRealtime, MetricsUpdate,
    ServerMessage, ServerPayload, ServerStatus, ServerStatusUpdate, SystemInfo, SystemInfoUpdate,
};
