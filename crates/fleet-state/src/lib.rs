//! fleet-state — embedded state store for Fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the durable rows of the
//! control plane: sites, heartbeat samples, alerts, the command log, the
//! offline command queue, deployments, artifacts, and canary rollouts.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{site_id}:{id}`, `{canary_id}:{site_id}`) enable
//! prefix scans for related records. Read-modify-write helpers run inside a
//! single write transaction, so concurrent updates to the same row are
//! serialized rather than lost.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
