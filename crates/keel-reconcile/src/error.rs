//! Reconciliation errors.

use keel_bus::BusError;
use keel_state::StateError;
use thiserror::Error;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
