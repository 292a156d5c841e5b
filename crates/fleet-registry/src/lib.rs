//! fleet-registry — live site connections for the Fleetgrid control plane.
//!
//! The `ConnectionRegistry` owns the map of authenticated site channels.
//! It is the only writer of that map; everything else asks it whether a
//! site is reachable and hands it messages to deliver.
//!
//! On every successful authentication the registry runs the registered
//! [`ReconnectHook`]s (queue replay, pending deployments) as independent
//! tasks so a failure in one never blocks the others.

pub mod alerts;
pub mod auth;
pub mod error;
pub mod registry;

pub use alerts::{AlertSink, StoreAlertSink};
pub use error::{RegistryError, RegistryResult};
pub use registry::{
    AuthOutcome, BroadcastSummary, ConfigSync, ConnectionRegistry, ReconnectHook,
};
