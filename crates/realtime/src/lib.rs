//! Reconnecting realtime connection for the ServerWatch dashboard.
//!
//! [`ConnectionManager`] keeps at most one WebSocket open to the backend,
//! sends heartbeats while it is open, routes decoded messages to raw
//! handlers and typed subscriber callbacks, and reconnects after abnormal
//! closes with a bounded, linear backoff.
//!
//! ```rust,no_run
//! use serverwatch_realtime::{Callbacks, ConnectionManager, ManagerConfig};
//!
//! # async fn example() {
//! let manager = ConnectionManager::new(ManagerConfig::default());
//! let _sub = manager.register_callbacks(
//!     "overview",
//!     Callbacks::new().on_server_status_update(|u| println!("{} is {:?}", u.server_id, u.status)),
//! );
//! manager.connect("bearer-token");
//! # }
//! ```

pub mod config;
pub mod endpoint;
mod machine;
pub mod manager;
mod pumps;
mod reconnection;
pub mod registry;
mod session;
pub mod transport;
pub mod types;

// Re-export primary types for convenience.
pub use config::{ConfigError, EndpointConfig, ManagerConfig};
pub use endpoint::EndpointError;
pub use manager::ConnectionManager;
pub use registry::{Callbacks, MessageHandler, Subscription};
pub use transport::{Connector, FrameSink, FrameStream, WsConnector};
pub use types::{
    CloseInfo, CloseIntent, ConnectionError, ConnectionPhase, DisableReason, ReconnectConfig,
};
