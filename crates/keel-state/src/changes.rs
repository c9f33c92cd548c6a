//! Post-commit workload change notifications.

use keel_core::AppRecord;

/// Where a committed workload mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user or operator changed desired state.
    Api,
    /// The control plane applied fleet feedback (e.g. a spindown). The fleet
    /// has already been commanded for these.
    Fleet,
}

/// A workload mutation that has been committed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub app_id: String,
    /// `None` when the workload was created.
    pub before: Option<AppRecord>,
    /// `None` when the workload was deleted.
    pub after: Option<AppRecord>,
    pub origin: ChangeOrigin,
}

impl StateChange {
    pub fn is_delete(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}
