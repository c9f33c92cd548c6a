//! Fleet command sink: how the control plane tells the fleet what to run.
//!
//! Commands are fire-and-forget with at-least-once delivery; the fleet is
//! expected to treat repeats as no-ops.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use keel_bus::MessageBus;
use keel_core::config::FleetConfig;

use crate::error::ReconcileResult;

/// Hints forwarded with a start command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartOptions {
    /// The workload is crash-looping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flapping: Option<bool>,
}

pub trait FleetCommandSink: Send + Sync {
    fn start_instances(&self, app_id: &str, indices: &[u32], options: &StartOptions) -> ReconcileResult<()>;

    fn stop_instances(&self, app_id: &str, indices: &[u32]) -> ReconcileResult<()>;

    /// Stop every instance of the workload.
    fn stop(&self, app_id: &str) -> ReconcileResult<()>;
}

// ── Bus-backed client ──────────────────────────────────────────────

#[derive(Serialize)]
struct StartCommand<'a> {
    droplet: &'a str,
    indices: &'a [u32],
    #[serde(flatten)]
    options: &'a StartOptions,
}

#[derive(Serialize)]
struct StopInstancesCommand<'a> {
    droplet: &'a str,
    instances: &'a [u32],
}

#[derive(Serialize)]
struct StopCommand<'a> {
    droplet: &'a str,
}

/// Publishes JSON commands on the fleet's subjects.
#[derive(Clone)]
pub struct BusFleetClient {
    bus: MessageBus,
    subjects: FleetConfig,
}

impl BusFleetClient {
    pub fn new(bus: MessageBus, subjects: FleetConfig) -> Self {
        Self { bus, subjects }
    }
}

impl FleetCommandSink for BusFleetClient {
    fn start_instances(&self, app_id: &str, indices: &[u32], options: &StartOptions) -> ReconcileResult<()> {
        let cmd = StartCommand {
            droplet: app_id,
            indices,
            options,
        };
        let reached = self.bus.publish_json(&self.subjects.start_subject, &cmd, None)?;
        debug!(%app_id, ?indices, reached, "start sent");
        Ok(())
    }

    fn stop_instances(&self, app_id: &str, indices: &[u32]) -> ReconcileResult<()> {
        let cmd = StopInstancesCommand {
            droplet: app_id,
            instances: indices,
        };
        let reached = self
            .bus
            .publish_json(&self.subjects.stop_instances_subject, &cmd, None)?;
        debug!(%app_id, ?indices, reached, "stop_instances sent");
        Ok(())
    }

    fn stop(&self, app_id: &str) -> ReconcileResult<()> {
        let reached = self
            .bus
            .publish_json(&self.subjects.stop_subject, &StopCommand { droplet: app_id }, None)?;
        debug!(%app_id, reached, "stop sent");
        Ok(())
    }
}

// ── Recording sink ─────────────────────────────────────────────────

/// A command as issued to a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetCommand {
    StartInstances {
        app_id: String,
        indices: Vec<u32>,
        options: StartOptions,
    },
    StopInstances {
        app_id: String,
        indices: Vec<u32>,
    },
    Stop {
        app_id: String,
    },
}

/// Keeps issued commands in memory instead of sending them. Used for dry
/// runs and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    commands: Arc<Mutex<Vec<FleetCommand>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, cmd: FleetCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cmd);
    }

    /// Everything issued so far.
    pub fn commands(&self) -> Vec<FleetCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the recorded commands.
    pub fn take(&self) -> Vec<FleetCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl FleetCommandSink for RecordingSink {
    fn start_instances(&self, app_id: &str, indices: &[u32], options: &StartOptions) -> ReconcileResult<()> {
        self.push(FleetCommand::StartInstances {
            app_id: app_id.to_string(),
            indices: indices.to_vec(),
            options: options.clone(),
        });
        Ok(())
    }

    fn stop_instances(&self, app_id: &str, indices: &[u32]) -> ReconcileResult<()> {
        self.push(FleetCommand::StopInstances {
            app_id: app_id.to_string(),
            indices: indices.to_vec(),
        });
        Ok(())
    }

    fn stop(&self, app_id: &str) -> ReconcileResult<()> {
        self.push(FleetCommand::Stop {
            app_id: app_id.to_string(),
        });
        Ok(())
    }
}
