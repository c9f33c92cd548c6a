//! The slice of the desired-state store the reconciler depends on.

use keel_core::AppRecord;
use keel_state::{StateResult, StateStore};

/// Read access to workload records, plus the one write feedback may cause.
pub trait DesiredState: Send + Sync {
    /// The current record for `id`, or `None` if the workload is gone.
    fn find(&self, id: &str) -> StateResult<Option<AppRecord>>;

    /// Transition the workload to STOPPED after the fleet was told to shut
    /// it down.
    fn record_spindown(&self, id: &str) -> StateResult<()>;
}

impl DesiredState for StateStore {
    fn find(&self, id: &str) -> StateResult<Option<AppRecord>> {
        self.get_app(id)
    }

    fn record_spindown(&self, id: &str) -> StateResult<()> {
        StateStore::record_spindown(self, id).map(|_| ())
    }
}
