//! Stability timers — one cancellable one-shot check per canary rollout.
//!
//! Each scheduled check runs in its own task that sleeps for the stability
//! period and then runs its callback. Scheduling again for the same rollout
//! replaces the previous check; cancelling guarantees the callback does not
//! run afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One pending check.
struct TimerSlot {
    /// Identifies this scheduling; a replaced slot's task must not fire.
    generation: u64,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl TimerSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

/// Pending stability checks keyed by canary id.
#[derive(Default)]
pub struct StabilityTimers {
    slots: Arc<Mutex<HashMap<String, TimerSlot>>>,
    generation: AtomicU64,
}

impl StabilityTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `check` after `delay`, replacing any check already scheduled
    /// for `canary_id`.
    pub async fn schedule<F>(&self, canary_id: &str, delay: Duration, check: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let slots = self.slots.clone();
        let id = canary_id.to_string();
        let check: BoxFuture = Box::pin(check);

        // Holding the map lock across spawn + insert keeps the new task from
        // looking for its slot before it is there.
        let mut map = self.slots.lock().await;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            {
                let mut map = slots.lock().await;
                match map.get(&id) {
                    Some(slot) if slot.generation == generation => {
                        map.remove(&id);
                    }
                    _ => return,
                }
            }
            debug!(canary_id = %id, "stability period elapsed");
            check.await;
        });

        if let Some(old) = map.insert(
            canary_id.to_string(),
            TimerSlot {
                generation,
                handle,
                shutdown_tx,
            },
        ) {
            old.stop();
        }
        debug!(%canary_id, delay_ms = delay.as_millis() as u64, "stability check scheduled");
    }

    /// Cancel the pending check for `canary_id`. Returns whether one was
    /// pending.
    pub async fn cancel(&self, canary_id: &str) -> bool {
        let slot = self.slots.lock().await.remove(canary_id);
        match slot {
            Some(slot) => {
                slot.stop();
                debug!(%canary_id, "stability check cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending check (for graceful shutdown).
    pub async fn cancel_all(&self) {
        let drained: Vec<(String, TimerSlot)> = self.slots.lock().await.drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            slot.stop();
        }
        info!(count, "stability checks cancelled");
    }

    pub async fn is_scheduled(&self, canary_id: &str) -> bool {
        self.slots.lock().await.contains_key(canary_id)
    }

    /// Canary ids with a pending check.
    pub async fn active(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }
}
