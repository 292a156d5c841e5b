//! fleet-core — shared types for the Fleetgrid control plane.
//!
//! - **`config`** — `fleetd.toml` parsing with per-section defaults
//! - **`protocol`** — tagged wire messages exchanged with sites
//! - **`commands`** — command type catalog (timeouts, queueability)
//! - **`failure`** — failure kinds and retryability
//! - **`events`** — in-process notification events

pub mod commands;
pub mod config;
pub mod events;
pub mod failure;
pub mod protocol;

pub use commands::CommandType;
pub use config::FleetConfig;
pub use events::{EventBus, FleetEvent};
pub use failure::FailureKind;
pub use protocol::*;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
