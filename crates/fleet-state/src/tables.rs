//! redb table definitions for the Fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized rows).
//! Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Site rows keyed by `{site_id}`.
pub const SITES: TableDefinition<&str, &[u8]> = TableDefinition::new("sites");

/// Heartbeat samples keyed by `{site_id}:{recorded_at:020}:{seq:04}`.
pub const HEARTBEATS: TableDefinition<&str, &[u8]> = TableDefinition::new("site_heartbeats");

/// Alerts keyed by `{site_id}:{alert_id}`.
pub const ALERTS: TableDefinition<&str, &[u8]> = TableDefinition::new("alerts");

/// Command log keyed by `{command_id}`.
pub const REMOTE_COMMANDS: TableDefinition<&str, &[u8]> = TableDefinition::new("remote_commands");

/// Offline queue keyed by `{site_id}:{pending_id}`.
pub const PENDING_COMMANDS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_commands");

/// Content and update deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Stored artifacts (videos, software packages) keyed by `{resource_id}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Canary rollouts keyed by `{canary_id}`.
pub const CANARY_DEPLOYMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("canary_deployments");

/// Per-site canary status keyed by `{canary_id}:{site_id}`.
pub const CANARY_SITE_STATUS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("canary_site_status");
