//! Turns committed desired-state changes into fleet commands.
//!
//! Only changes made through the API are acted on. Changes the control
//! plane applied in response to fleet feedback (spindown) already had their
//! command issued by the reconciler.

use keel_core::AppRecord;
use keel_state::{ChangeOrigin, StateChange};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::ReconcileResult;
use crate::sink::{FleetCommandSink, StartOptions};

pub struct StateObserver<F> {
    fleet: F,
}

impl<F: FleetCommandSink> StateObserver<F> {
    pub fn new(fleet: F) -> Self {
        Self { fleet }
    }

    /// Issue the commands implied by one change.
    pub fn apply(&self, change: &StateChange) -> ReconcileResult<()> {
        if change.origin == ChangeOrigin::Fleet {
            debug!(app_id = %change.app_id, "skipping fleet-originated change");
            return Ok(());
        }

        match (&change.before, &change.after) {
            (None, Some(created)) if created.is_started() => {
                self.start_range(created, 0, created.desired_instances)
            }
            (Some(_), None) => {
                info!(app_id = %change.app_id, "app deleted, stopping");
                self.fleet.stop(&change.app_id)
            }
            (Some(before), Some(after)) => self.transition(before, after),
            _ => Ok(()),
        }
    }

    fn transition(&self, before: &AppRecord, after: &AppRecord) -> ReconcileResult<()> {
        match (before.is_started(), after.is_started()) {
            (false, true) => {
                info!(app_id = %after.id, instances = after.desired_instances, "app started");
                self.start_range(after, 0, after.desired_instances)
            }
            (true, false) => {
                info!(app_id = %after.id, "app stopped");
                self.fleet.stop(&after.id)
            }
            (true, true) if after.desired_instances > before.desired_instances => {
                info!(
                    app_id = %after.id,
                    from = before.desired_instances,
                    to = after.desired_instances,
                    "scaling up"
                );
                self.start_range(after, before.desired_instances, after.desired_instances)
            }
            (true, true) if after.desired_instances < before.desired_instances => {
                info!(
                    app_id = %after.id,
                    from = before.desired_instances,
                    to = after.desired_instances,
                    "scaling down"
                );
                let removed: Vec<u32> = (after.desired_instances..before.desired_instances).collect();
                self.fleet.stop_instances(&after.id, &removed)
            }
            _ => Ok(()),
        }
    }

    fn start_range(&self, app: &AppRecord, from: u32, to: u32) -> ReconcileResult<()> {
        let indices: Vec<u32> = (from..to).collect();
        if indices.is_empty() {
            return Ok(());
        }
        self.fleet
            .start_instances(&app.id, &indices, &StartOptions::default())
    }

    /// Follow the store's change feed until shutdown is signalled.
    pub async fn run(
        self,
        mut changes: broadcast::Receiver<StateChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("state observer running");
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => {
                        if let Err(e) = self.apply(&change) {
                            error!(app_id = %change.app_id, error = %e, "failed to command fleet");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The health monitor's feedback repairs what was missed.
                        warn!(missed, "state observer lagged behind change feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change feed closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("state observer shutting down");
                        break;
                    }
                }
            }
        }
    }
}
