//! StateStore — redb-backed state persistence for Fleetgrid.
//!
//! Provides typed CRUD operations over sites, heartbeats, alerts, the
//! command log, the offline queue, deployments, artifacts, and canary
//! rollouts. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

fn decode<T: DeserializeOwned>(def: Table, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Decode {
        table: def.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Heartbeat keys are `{site}:{timestamp:020}:{seq:04}`; `rest` is the
/// part after `{site}:`.
fn is_sample_suffix(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    bytes.len() == 25
        && bytes[20] == b':'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 20 || b.is_ascii_digit())
}

/// Rows stored under a `{owner}:` key prefix.
trait Owned {
    fn owner(&self) -> &str;
}

impl Owned for HeartbeatSample {
    fn owner(&self) -> &str {
        &self.site_id
    }
}

impl Owned for Alert {
    fn owner(&self) -> &str {
        &self.site_id
    }
}

impl Owned for PendingCommand {
    fn owner(&self) -> &str {
        &self.site_id
    }
}

impl Owned for SiteDeploymentStatus {
    fn owner(&self) -> &str {
        &self.canary_id
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [
            SITES,
            HEARTBEATS,
            ALERTS,
            REMOTE_COMMANDS,
            PENDING_COMMANDS,
            DEPLOYMENTS,
            ARTIFACTS,
            CANARY_DEPLOYMENTS,
            CANARY_SITE_STATUS,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Row helpers ────────────────────────────────────────────────

    fn put_row<T: Serialize>(&self, def: Table, key: &str, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(def, key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// List rows, optionally restricted to keys starting with `prefix`.
    fn list_rows<T: DeserializeOwned>(&self, def: Table, prefix: Option<&str>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let rows = match prefix {
            Some(p) => table.range(p..).map_err(map_err!(Read))?,
            None => table.iter().map_err(map_err!(Read))?,
        };
        let mut results = Vec::new();
        for entry in rows {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if prefix.is_some_and(|p| !key.starts_with(p)) {
                break;
            }
            results.push(decode(def, key, value.value())?);
        }
        Ok(results)
    }

    /// Rows keyed `{owner}:{..}` that belong to `owner`.
    ///
    /// The key prefix alone also matches owners whose id extends `owner`
    /// with a `:`, so rows are checked against their decoded owner.
    fn list_owned<T: DeserializeOwned + Owned>(&self, def: Table, owner: &str) -> StateResult<Vec<T>> {
        let prefix = format!("{owner}:");
        Ok(self
            .list_rows::<T>(def, Some(&prefix))?
            .into_iter()
            .filter(|row| row.owner() == owner)
            .collect())
    }

    fn remove_row(&self, def: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn remove_rows(&self, def: Table, keys: &[String]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            for key in keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    /// Read-modify-write a row inside one write transaction.
    ///
    /// Returns `None` when the row does not exist; otherwise the updated row
    /// and whatever `f` returned.
    fn update_row<T, R>(
        &self,
        def: Table,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> StateResult<Option<(T, R)>>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(def, key, guard.value())?),
                None => None,
            };
            match current {
                Some(mut row) => {
                    let ret = f(&mut row);
                    let value = serde_json::to_vec(&row).map_err(map_err!(Encode))?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some((row, ret))
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Sites ──────────────────────────────────────────────────────

    /// Insert or update a site row.
    pub fn put_site(&self, site: &Site) -> StateResult<()> {
        self.put_row(SITES, &site.id, site)?;
        debug!(site_id = %site.id, "site stored");
        Ok(())
    }

    pub fn get_site(&self, site_id: &str) -> StateResult<Option<Site>> {
        self.get_row(SITES, site_id)
    }

    pub fn list_sites(&self) -> StateResult<Vec<Site>> {
        self.list_rows(SITES, None)
    }

    /// Sites whose `group_id` matches.
    pub fn list_sites_in_group(&self, group_id: &str) -> StateResult<Vec<Site>> {
        Ok(self
            .list_sites()?
            .into_iter()
            .filter(|s| s.group_id.as_deref() == Some(group_id))
            .collect())
    }

    pub fn update_site<R>(
        &self,
        site_id: &str,
        f: impl FnOnce(&mut Site) -> R,
    ) -> StateResult<Option<(Site, R)>> {
        self.update_row(SITES, site_id, f)
    }

    pub fn delete_site(&self, site_id: &str) -> StateResult<bool> {
        self.remove_row(SITES, site_id)
    }

    // ── Heartbeats ─────────────────────────────────────────────────

    /// Store a heartbeat sample and drop the site's oldest samples beyond
    /// `keep`. Returns the number of samples dropped.
    pub fn put_heartbeat(&self, sample: &HeartbeatSample, keep: usize) -> StateResult<u32> {
        let value = serde_json::to_vec(sample).map_err(map_err!(Encode))?;
        let prefix = format!("{}:", sample.site_id);
        let stamp = format!("{prefix}{:020}:", sample.recorded_at);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let dropped = {
            let mut table = txn.open_table(HEARTBEATS).map_err(map_err!(Table))?;

            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                    break;
                };
                if is_sample_suffix(rest) {
                    keys.push(key.to_string());
                }
            }

            let same_stamp = keys.iter().filter(|k| k.starts_with(&stamp)).count();
            let key = format!("{stamp}{same_stamp:04}");
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            keys.push(key);
            keys.sort();

            let excess = keys.len().saturating_sub(keep);
            for key in &keys[..excess] {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            excess as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if dropped > 0 {
            debug!(site_id = %sample.site_id, dropped, "old heartbeat samples pruned");
        }
        Ok(dropped)
    }

    /// Most recent samples for a site, newest first.
    pub fn list_heartbeats_for_site(
        &self,
        site_id: &str,
        limit: usize,
    ) -> StateResult<Vec<HeartbeatSample>> {
        let mut samples: Vec<HeartbeatSample> = self.list_owned(HEARTBEATS, site_id)?;
        samples.reverse();
        samples.truncate(limit);
        Ok(samples)
    }

    // ── Alerts ─────────────────────────────────────────────────────

    pub fn put_alert(&self, alert: &Alert) -> StateResult<()> {
        self.put_row(ALERTS, &alert.table_key(), alert)
    }

    pub fn list_alerts_for_site(&self, site_id: &str) -> StateResult<Vec<Alert>> {
        self.list_owned(ALERTS, site_id)
    }

    /// Most recent alert of a given type for a site.
    pub fn last_alert(&self, site_id: &str, alert_type: AlertType) -> StateResult<Option<Alert>> {
        Ok(self
            .list_alerts_for_site(site_id)?
            .into_iter()
            .filter(|a| a.alert_type == alert_type)
            .max_by_key(|a| a.created_at))
    }

    // ── Command log ────────────────────────────────────────────────

    pub fn put_command(&self, command: &RemoteCommand) -> StateResult<()> {
        self.put_row(REMOTE_COMMANDS, &command.id, command)
    }

    pub fn get_command(&self, command_id: &str) -> StateResult<Option<RemoteCommand>> {
        self.get_row(REMOTE_COMMANDS, command_id)
    }

    pub fn update_command<R>(
        &self,
        command_id: &str,
        f: impl FnOnce(&mut RemoteCommand) -> R,
    ) -> StateResult<Option<(RemoteCommand, R)>> {
        self.update_row(REMOTE_COMMANDS, command_id, f)
    }

    pub fn list_commands_for_site(&self, site_id: &str) -> StateResult<Vec<RemoteCommand>> {
        Ok(self
            .list_rows::<RemoteCommand>(REMOTE_COMMANDS, None)?
            .into_iter()
            .filter(|c| c.site_id == site_id)
            .collect())
    }

    // ── Offline queue ──────────────────────────────────────────────

    pub fn put_pending_command(&self, pending: &PendingCommand) -> StateResult<()> {
        self.put_row(PENDING_COMMANDS, &pending.table_key(), pending)?;
        debug!(site_id = %pending.site_id, id = %pending.id, "pending command stored");
        Ok(())
    }

    /// All queued commands for a site, in key order.
    pub fn list_pending_for_site(&self, site_id: &str) -> StateResult<Vec<PendingCommand>> {
        self.list_owned(PENDING_COMMANDS, site_id)
    }

    pub fn list_all_pending(&self) -> StateResult<Vec<PendingCommand>> {
        self.list_rows(PENDING_COMMANDS, None)
    }

    pub fn update_pending_command<R>(
        &self,
        site_id: &str,
        id: &str,
        f: impl FnOnce(&mut PendingCommand) -> R,
    ) -> StateResult<Option<(PendingCommand, R)>> {
        self.update_row(PENDING_COMMANDS, &format!("{site_id}:{id}"), f)
    }

    pub fn delete_pending_command(&self, site_id: &str, id: &str) -> StateResult<bool> {
        self.remove_row(PENDING_COMMANDS, &format!("{site_id}:{id}"))
    }

    /// Delete the given queued commands. Returns the number removed.
    pub fn delete_pending_commands(&self, rows: &[PendingCommand]) -> StateResult<u32> {
        let keys: Vec<String> = rows.iter().map(PendingCommand::table_key).collect();
        self.remove_rows(PENDING_COMMANDS, &keys)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put_row(DEPLOYMENTS, &deployment.id, deployment)?;
        debug!(deployment_id = %deployment.id, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        self.get_row(DEPLOYMENTS, deployment_id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.list_rows(DEPLOYMENTS, None)
    }

    /// Deployments delivering the given artifact.
    pub fn list_deployments_for_resource(&self, resource_id: &str) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.resource_id == resource_id)
            .collect())
    }

    pub fn update_deployment<R>(
        &self,
        deployment_id: &str,
        f: impl FnOnce(&mut Deployment) -> R,
    ) -> StateResult<Option<(Deployment, R)>> {
        self.update_row(DEPLOYMENTS, deployment_id, f)
    }

    // ── Artifacts ──────────────────────────────────────────────────

    pub fn put_artifact(&self, artifact: &Artifact) -> StateResult<()> {
        self.put_row(ARTIFACTS, &artifact.id, artifact)
    }

    pub fn get_artifact(&self, artifact_id: &str) -> StateResult<Option<Artifact>> {
        self.get_row(ARTIFACTS, artifact_id)
    }

    pub fn update_artifact<R>(
        &self,
        artifact_id: &str,
        f: impl FnOnce(&mut Artifact) -> R,
    ) -> StateResult<Option<(Artifact, R)>> {
        self.update_row(ARTIFACTS, artifact_id, f)
    }

    // ── Canary rollouts ────────────────────────────────────────────

    pub fn put_canary(&self, canary: &CanaryDeployment) -> StateResult<()> {
        self.put_row(CANARY_DEPLOYMENTS, &canary.id, canary)?;
        debug!(canary_id = %canary.id, phase = canary.current_phase.as_str(), "canary stored");
        Ok(())
    }

    pub fn get_canary(&self, canary_id: &str) -> StateResult<Option<CanaryDeployment>> {
        self.get_row(CANARY_DEPLOYMENTS, canary_id)
    }

    pub fn list_canaries(&self) -> StateResult<Vec<CanaryDeployment>> {
        self.list_rows(CANARY_DEPLOYMENTS, None)
    }

    pub fn update_canary<R>(
        &self,
        canary_id: &str,
        f: impl FnOnce(&mut CanaryDeployment) -> R,
    ) -> StateResult<Option<(CanaryDeployment, R)>> {
        self.update_row(CANARY_DEPLOYMENTS, canary_id, f)
    }

    pub fn put_canary_site(&self, status: &SiteDeploymentStatus) -> StateResult<()> {
        self.put_row(CANARY_SITE_STATUS, &status.table_key(), status)
    }

    pub fn get_canary_site(
        &self,
        canary_id: &str,
        site_id: &str,
    ) -> StateResult<Option<SiteDeploymentStatus>> {
        self.get_row(CANARY_SITE_STATUS, &format!("{canary_id}:{site_id}"))
    }

    pub fn list_canary_sites(&self, canary_id: &str) -> StateResult<Vec<SiteDeploymentStatus>> {
        self.list_owned(CANARY_SITE_STATUS, canary_id)
    }

    pub fn update_canary_site<R>(
        &self,
        canary_id: &str,
        site_id: &str,
        f: impl FnOnce(&mut SiteDeploymentStatus) -> R,
    ) -> StateResult<Option<(SiteDeploymentStatus, R)>> {
        self.update_row(CANARY_SITE_STATUS, &format!("{canary_id}:{site_id}"), f)
    }
}
