//! Offline command queue.
//!
//! Queueable commands for unreachable sites are parked as `PendingCommand`
//! rows and replayed when the site reconnects: urgent first, then oldest
//! first, one at a time with a short pause in between. Realtime-only
//! commands are never parked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::config::QueueConfig;
use fleet_core::{CommandType, epoch_millis};
use fleet_registry::{ConnectionRegistry, ReconnectHook};
use fleet_state::{PendingCommand, StateStore};

use crate::dispatcher::{Command, CommandDispatcher};
use crate::error::{CommandError, CommandResult};

/// Per-call queueing options. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// 1 = urgent, 10 = low.
    pub priority: Option<u8>,
    /// Relative expiry; `None` never expires.
    pub expires_in: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub description: Option<String>,
}

/// What happened to a `send_or_queue` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Sent { command_id: String },
    Queued { pending_id: String },
    Rejected { reason: String },
}

/// Result of replaying a site's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub processed: u32,
    pub failed: u32,
    /// Rows still queued for the site afterwards.
    pub remaining: u32,
}

pub struct CommandQueue {
    dispatcher: Arc<CommandDispatcher>,
    registry: Arc<ConnectionRegistry>,
    state: StateStore,
    config: QueueConfig,
}

impl CommandQueue {
    pub fn new(dispatcher: Arc<CommandDispatcher>, state: StateStore, config: QueueConfig) -> Self {
        Self {
            registry: dispatcher.registry().clone(),
            dispatcher,
            state,
            config,
        }
    }

    /// Deliver now if the site is connected, otherwise park it if allowed.
    ///
    /// Never waits for the command's result.
    pub async fn send_or_queue(
        &self,
        site_id: &str,
        command_type: CommandType,
        payload: serde_json::Value,
        options: QueueOptions,
    ) -> CommandResult<QueueOutcome> {
        if self.registry.is_connected(site_id).await {
            let command = Command::new(command_type.clone(), payload.clone());
            let command_id = command.id.clone();
            if self.dispatcher.send(site_id, command).await? {
                return Ok(QueueOutcome::Sent { command_id });
            }
            debug!(%site_id, "site dropped during send, falling back to queue");
        }

        if !command_type.is_queueable() {
            let reason = format!(
                "command type '{command_type}' is realtime-only and site {site_id} is not connected"
            );
            info!(%site_id, %command_type, "command rejected for offline site");
            return Ok(QueueOutcome::Rejected { reason });
        }

        let pending = self.queue_command(site_id, command_type, payload, options)?;
        Ok(QueueOutcome::Queued {
            pending_id: pending.id,
        })
    }

    /// Park a command for later delivery.
    pub fn queue_command(
        &self,
        site_id: &str,
        command_type: CommandType,
        payload: serde_json::Value,
        options: QueueOptions,
    ) -> CommandResult<PendingCommand> {
        if !command_type.is_queueable() {
            return Err(CommandError::NotQueueable(command_type.to_string()));
        }
        let priority = options.priority.unwrap_or(self.config.default_priority);
        if !(1..=10).contains(&priority) {
            return Err(CommandError::InvalidPriority(priority));
        }

        let now = epoch_millis();
        let pending = PendingCommand {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site_id.to_string(),
            command_type,
            payload,
            priority,
            created_at: now,
            expires_at: options.expires_in.map(|d| now + d.as_millis() as u64),
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            description: options.description,
        };
        self.state.put_pending_command(&pending)?;

        info!(
            %site_id,
            pending_id = %pending.id,
            command_type = %pending.command_type,
            priority,
            "command queued"
        );
        Ok(pending)
    }

    /// Replay a site's queued commands.
    ///
    /// Rows are tried in `(priority, created_at)` order. Each attempt counts
    /// against `max_attempts` whether or not it succeeds. Replay stops as
    /// soon as the site disconnects.
    pub async fn process_pending_commands(&self, site_id: &str) -> CommandResult<ReplaySummary> {
        let now = epoch_millis();
        let mut rows: Vec<PendingCommand> = self
            .state
            .list_pending_for_site(site_id)?
            .into_iter()
            .filter(|p| !p.is_expired(now) && p.has_attempts_left())
            .collect();
        rows.sort_by_key(|p| (p.priority, p.created_at));

        let mut summary = ReplaySummary::default();
        let total = rows.len();
        if total > 0 {
            info!(%site_id, count = total, "replaying queued commands");
        }

        for (i, row) in rows.into_iter().enumerate() {
            if !self.registry.is_connected(site_id).await {
                info!(%site_id, "site disconnected during replay, stopping");
                break;
            }

            let bumped = self.state.update_pending_command(site_id, &row.id, |p| {
                p.attempts += 1;
                p.attempts
            })?;
            let Some((_, attempt)) = bumped else {
                debug!(%site_id, pending_id = %row.id, "queued command vanished, skipping");
                continue;
            };

            let command = Command::new(row.command_type.clone(), row.payload.clone());
            match self.dispatcher.send(site_id, command).await {
                Ok(true) => {
                    self.state.delete_pending_command(site_id, &row.id)?;
                    summary.processed += 1;
                    debug!(%site_id, pending_id = %row.id, attempt, "queued command delivered");
                }
                Ok(false) => {
                    summary.failed += 1;
                    warn!(%site_id, pending_id = %row.id, attempt, "queued command not delivered");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(%site_id, pending_id = %row.id, attempt, error = %e, "queued command errored");
                }
            }

            if i + 1 < total {
                tokio::time::sleep(self.config.replay_delay()).await;
            }
        }

        summary.remaining = self.state.list_pending_for_site(site_id)?.len() as u32;
        info!(
            %site_id,
            processed = summary.processed,
            failed = summary.failed,
            remaining = summary.remaining,
            "queue replay finished"
        );
        Ok(summary)
    }

    /// Delete every queued row past its expiry, for all sites.
    pub fn cleanup_expired_commands(&self) -> CommandResult<u32> {
        let now = epoch_millis();
        let expired: Vec<PendingCommand> = self
            .state
            .list_all_pending()?
            .into_iter()
            .filter(|p| p.is_expired(now))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let removed = self.state.delete_pending_commands(&expired)?;
        info!(removed, "expired queued commands removed");
        Ok(removed)
    }

    /// Drop everything queued for a site.
    pub fn clear_pending_commands(&self, site_id: &str) -> CommandResult<u32> {
        let rows = self.state.list_pending_for_site(site_id)?;
        let removed = self.state.delete_pending_commands(&rows)?;
        info!(%site_id, removed, "queued commands cleared");
        Ok(removed)
    }

    pub fn list_pending_commands(&self, site_id: &str) -> CommandResult<Vec<PendingCommand>> {
        Ok(self.state.list_pending_for_site(site_id)?)
    }

    /// Push a configuration document, marking it unacknowledged on the site.
    pub async fn push_config(
        &self,
        site_id: &str,
        config: serde_json::Value,
        config_hash: &str,
    ) -> CommandResult<QueueOutcome> {
        let version = epoch_millis();
        let marked = self
            .state
            .update_site(site_id, |s| s.pending_config_version = Some(version))?;
        if marked.is_none() {
            return Err(CommandError::UnknownSite(site_id.to_string()));
        }
        let payload = serde_json::json!({
            "config": config,
            "configHash": config_hash,
            "version": version,
        });
        let options = QueueOptions {
            priority: Some(2),
            description: Some("configuration sync".to_string()),
            ..Default::default()
        };
        self.send_or_queue(site_id, CommandType::UpdateConfig, payload, options)
            .await
    }

    /// Remove expired rows periodically until `shutdown` flips.
    pub async fn run_cleanup(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cleanup_expired_commands() {
                        warn!(error = %e, "queue cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("queue cleanup shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ReconnectHook for CommandQueue {
    fn name(&self) -> &'static str {
        "command_queue"
    }

    async fn on_reconnect(&self, site_id: &str) -> anyhow::Result<()> {
        self.process_pending_commands(site_id).await?;
        Ok(())
    }
}
