//! Command dispatcher — sends commands and correlates their results.
//!
//! Every command sent to a connected site is tracked in an in-memory
//! pending set until either its `command_result` arrives or the periodic
//! sweep finds it past its budget. Whichever happens first removes the
//! entry; the other side then finds nothing to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use fleet_core::protocol::{CommandEnvelope, OutboundMessage, ResultStatus};
use fleet_core::{CommandType, EventBus, FailureKind, FleetEvent, epoch_millis};
use fleet_registry::ConnectionRegistry;
use fleet_state::{CommandId, CommandStatus, RemoteCommand, SiteId, StateStore};

use crate::error::CommandResult;

/// A command about to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub timeout: Duration,
}

impl Command {
    /// New command with a fresh id and the type's budget.
    pub fn new(command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timeout: command_type.timeout(),
            command_type,
            payload,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Terminal outcome of a tracked command, passed to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    pub site_id: SiteId,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

/// Notified when a tracked command reaches a terminal status.
#[async_trait]
pub trait CommandObserver: Send + Sync {
    async fn on_command_finished(&self, outcome: &CommandOutcome);
}

struct PendingEntry {
    site_id: SiteId,
    command_type: CommandType,
    sent_at: Instant,
    timeout: Duration,
}

pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    state: StateStore,
    events: EventBus,
    /// In-flight commands: command_id → entry.
    pending: Mutex<HashMap<CommandId, PendingEntry>>,
    observers: RwLock<Vec<Arc<dyn CommandObserver>>>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, state: StateStore, events: EventBus) -> Self {
        Self {
            registry,
            state,
            events,
            pending: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_observer(&self, observer: Arc<dyn CommandObserver>) {
        self.observers.write().await.push(observer);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send a command to a connected site.
    ///
    /// Returns `false` without persisting anything when the site is not
    /// connected. Queueing is the caller's business.
    pub async fn send(&self, site_id: &str, command: Command) -> CommandResult<bool> {
        if !self.registry.is_connected(site_id).await {
            debug!(%site_id, command_type = %command.command_type, "site not connected, command not sent");
            return Ok(false);
        }

        let now = epoch_millis();
        self.state.put_command(&RemoteCommand {
            id: command.id.clone(),
            site_id: site_id.to_string(),
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            status: CommandStatus::Pending,
            timeout_ms: command.timeout.as_millis() as u64,
            created_at: now,
            sent_at: None,
            completed_at: None,
            result: None,
            error: None,
            failure_kind: None,
        })?;

        self.pending.lock().await.insert(
            command.id.clone(),
            PendingEntry {
                site_id: site_id.to_string(),
                command_type: command.command_type.clone(),
                sent_at: Instant::now(),
                timeout: command.timeout,
            },
        );

        let delivered = self
            .registry
            .send(
                site_id,
                OutboundMessage::Command(CommandEnvelope {
                    id: command.id.clone(),
                    command_type: command.command_type.clone(),
                    data: command.payload.clone(),
                }),
            )
            .await;

        if !delivered {
            self.pending.lock().await.remove(&command.id);
            self.state.update_command(&command.id, |c| {
                if !c.status.is_terminal() {
                    c.status = CommandStatus::Failed;
                    c.error = Some("site disconnected before delivery".to_string());
                    c.failure_kind = Some(FailureKind::NetworkReset);
                    c.completed_at = Some(epoch_millis());
                }
            })?;
            warn!(%site_id, command_id = %command.id, "command delivery failed");
            return Ok(false);
        }

        // A fast result may already have landed; never overwrite it.
        self.state.update_command(&command.id, |c| {
            if c.status == CommandStatus::Pending {
                c.status = CommandStatus::Executing;
                c.sent_at = Some(epoch_millis());
            }
        })?;

        info!(
            %site_id,
            command_id = %command.id,
            command_type = %command.command_type,
            timeout_secs = command.timeout.as_secs(),
            "command dispatched"
        );
        Ok(true)
    }

    /// Apply a `command_result` reported by a site.
    ///
    /// Returns `false` when the command is not pending (unknown, already
    /// timed out, or reported by a different site). Such results are
    /// ignored.
    pub async fn on_result(
        &self,
        site_id: &str,
        result: fleet_core::protocol::CommandResult,
    ) -> CommandResult<bool> {
        let entry = {
            let mut pending = self.pending.lock().await;
            let owner = pending.get(&result.command_id).map(|e| e.site_id.clone());
            match owner {
                Some(owner) if owner == site_id => pending.remove(&result.command_id),
                Some(_) => {
                    warn!(%site_id, command_id = %result.command_id, "result reported by a different site");
                    return Ok(false);
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            debug!(%site_id, command_id = %result.command_id, "result for command not pending, ignored");
            return Ok(false);
        };

        let status = match result.status {
            ResultStatus::Completed => CommandStatus::Completed,
            ResultStatus::Failed => CommandStatus::Failed,
        };
        let failure_kind = result.failure_kind();
        let now = epoch_millis();

        let updated = self.state.update_command(&result.command_id, |c| {
            if c.status.is_terminal() {
                return false;
            }
            c.status = status;
            c.result = result.result.clone();
            c.error = result.error.clone();
            c.failure_kind = failure_kind;
            c.completed_at = Some(now);
            true
        })?;
        let Some((row, true)) = updated else {
            debug!(command_id = %result.command_id, "command already terminal");
            return Ok(false);
        };

        if status == CommandStatus::Completed && entry.command_type == CommandType::UpdateConfig {
            self.clear_pending_config(site_id);
        }

        let elapsed_ms = entry.sent_at.elapsed().as_millis() as u64;
        match status {
            CommandStatus::Completed => {
                info!(%site_id, command_id = %row.id, command_type = %row.command_type, elapsed_ms, "command completed");
                self.events.publish(FleetEvent::CommandCompleted {
                    command_id: row.id.clone(),
                    site_id: site_id.to_string(),
                });
            }
            _ => {
                warn!(
                    %site_id,
                    command_id = %row.id,
                    command_type = %row.command_type,
                    error = row.error.as_deref().unwrap_or(""),
                    "command failed"
                );
                self.events.publish(FleetEvent::CommandFailed {
                    command_id: row.id.clone(),
                    site_id: site_id.to_string(),
                    error: row.error.clone().unwrap_or_default(),
                });
            }
        }

        self.notify(outcome_from_row(row)).await;
        Ok(true)
    }

    /// Fail every pending command whose budget has elapsed.
    ///
    /// Returns the ids of the commands that timed out.
    pub async fn sweep_timeouts(&self) -> Vec<CommandId> {
        let expired: Vec<(CommandId, PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<CommandId> = pending
                .iter()
                .filter(|(_, e)| e.sent_at.elapsed() >= e.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let mut timed_out = Vec::with_capacity(expired.len());
        for (command_id, entry) in expired {
            let secs = entry.timeout.as_secs();
            let message = format!("timeout after {secs}s");
            let now = epoch_millis();

            let updated = match self.state.update_command(&command_id, |c| {
                if c.status.is_terminal() {
                    return false;
                }
                c.status = CommandStatus::Failed;
                c.error = Some(message.clone());
                c.failure_kind = Some(FailureKind::Timeout);
                c.completed_at = Some(now);
                true
            }) {
                Ok(u) => u,
                Err(e) => {
                    warn!(%command_id, error = %e, "failed to persist command timeout");
                    continue;
                }
            };
            let Some((row, true)) = updated else {
                continue;
            };

            warn!(
                site_id = %entry.site_id,
                %command_id,
                command_type = %entry.command_type,
                timeout_secs = secs,
                "command timed out"
            );
            self.events.publish(FleetEvent::CommandTimedOut {
                command_id: command_id.clone(),
                site_id: entry.site_id.clone(),
                timeout_secs: secs,
            });
            self.notify(outcome_from_row(row)).await;
            timed_out.push(command_id);
        }
        timed_out
    }

    /// Run the timeout sweep until `shutdown` flips.
    pub async fn run_sweep(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let timed_out = self.sweep_timeouts().await;
                    if !timed_out.is_empty() {
                        debug!(count = timed_out.len(), "timeout sweep finished");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("timeout sweep shutting down");
                    break;
                }
            }
        }
    }

    pub async fn is_pending(&self, command_id: &str) -> bool {
        self.pending.lock().await.contains_key(command_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Clear the "configuration pushed, not yet acknowledged" marker.
    fn clear_pending_config(&self, site_id: &str) {
        if let Err(e) = self.state.update_site(site_id, |s| s.pending_config_version = None) {
            warn!(%site_id, error = %e, "could not clear pending config version, skipping");
        }
    }

    async fn notify(&self, outcome: CommandOutcome) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.on_command_finished(&outcome).await;
        }
    }
}

fn outcome_from_row(row: RemoteCommand) -> CommandOutcome {
    CommandOutcome {
        command_id: row.id,
        site_id: row.site_id,
        command_type: row.command_type,
        payload: row.payload,
        status: row.status,
        error: row.error,
        failure_kind: row.failure_kind,
    }
}
