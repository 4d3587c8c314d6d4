//! Per-transport tasks: outbound writer, heartbeat, inbound reader.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
