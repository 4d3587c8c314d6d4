//! ServerWatch monitor entry point.
//!
//! Usage: `serverwatch-monitor [CONFIG]`. The credential is read from
//! `SERVERWATCH_TOKEN`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use serverwatch_protocol::ServerMessage;
use serverwatch_realtime::{Callbacks, ConnectionManager, ManagerConfig};

const TOKEN_ENV: &str = "SERVERWATCH_TOKEN";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting ServerWatch monitor"
    );

    let config = load_config()?;
    let token = std::env::var(TOKEN_ENV).with_context(|| format!("{TOKEN_ENV} is not set"))?;

    let manager = ConnectionManager::new(config);
    let disabled = Arc::new(Notify::new());

    let _subscription = manager.register_callbacks("monitor", callbacks(disabled.clone()));
    let _handler = manager.register_message_handler(log_message);

    manager.connect(&token);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("interrupted");
        }
        () = disabled.notified() => {
            warn!(phase = ?manager.phase(), "reconnection disabled, exiting");
        }
    }

    manager.shutdown();
    Ok(())
}

/// Loads the file named on the command line, or the default file if present.
fn load_config() -> Result<ManagerConfig> {
    if let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) {
        let config = ManagerConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        return Ok(config);
    }

    let path = ManagerConfig::default_path();
    match ManagerConfig::load(&path) {
        Ok(c) => Ok(c),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Ok(ManagerConfig::default())
        }
    }
}

fn callbacks(disabled: Arc<Notify>) -> Callbacks {
    Callbacks::new()
        .on_open(|| info!("realtime channel live"))
        .on_close(|close| info!(code = close.code, reason = %close.reason, "realtime channel closed"))
        .on_error(move |e| {
            if e.is_terminal() {
                error!(error = %e, "realtime channel stopped");
                disabled.notify_one();
            } else {
                warn!(error = %e, "realtime channel error");
            }
        })
        .on_metrics_update(|m| {
            info!(
                server = %m.server_id,
                cpu = ?m.cpu_usage,
                memory = ?m.memory_usage,
                disk = ?m.disk_usage,
                uptime = ?m.uptime,
                "metrics"
            );
        })
        .on_metrics_realtime(|m| {
            debug!(
                server = %m.server_id,
                at = ?m.recorded_at(),
                cpu = ?m.cpu_usage,
                up = ?m.network_upload,
                down = ?m.network_download,
                "sample"
            );
        })
        .on_system_info_update(|u| {
            let info = u.data.clone().unwrap_or_default();
            info!(
                server = %u.server_id,
                os = ?info.os,
                arch = ?info.architecture,
                kernel = ?info.kernel,
                "system info"
            );
        })
        .on_server_status_update(|u| info!(server = %u.server_id, status = ?u.status, "status"))
}

fn log_message(message: &ServerMessage) {
    match message {
        ServerMessage::ConnectionStatus(status) => {
            info!(agents = ?status.agent_count, "backend connection status");
        }
        ServerMessage::AuthSuccess(_) => info!("authenticated"),
        ServerMessage::Unknown { kind, .. } => debug!(msg_type = %kind, "unrecognised message"),
        other => debug!(
            msg_type = other.type_name(),
            server = ?other.server_id(),
            "message"
        ),
    }
}
