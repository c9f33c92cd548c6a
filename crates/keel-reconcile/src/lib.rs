//! keel-reconcile — keeps the fleet converged on desired state.
//!
//! Two loops feed the [`FleetCommandSink`]:
//!
//! ```text
//!   fleet health monitor ──feedback──▶ Reconciler ──┐
//!                                                   ├──▶ FleetCommandSink ──▶ fleet
//!   StateStore ──StateChange (after commit)──▶ StateObserver ──┘
//! ```
//!
//! The [`Reconciler`] consumes feedback events from the health monitor,
//! re-reads the authoritative record and issues at most one command per
//! event. Feedback is unordered, duplicated and possibly stale, so every
//! event is checked against the record's version and `last_updated` first.
//!
//! The [`StateObserver`] turns committed desired-state changes made through
//! the API into fleet commands.

pub mod desired;
pub mod error;
pub mod feedback;
pub mod observer;
pub mod reconciler;
pub mod sink;

pub use desired::DesiredState;
pub use error::{ReconcileError, ReconcileResult};
pub use feedback::{FeedbackEvent, FeedbackOp};
pub use observer::StateObserver;
pub use reconciler::{Decision, DropReason, Reconciler};
pub use sink::{BusFleetClient, FleetCommand, FleetCommandSink, RecordingSink, StartOptions};
