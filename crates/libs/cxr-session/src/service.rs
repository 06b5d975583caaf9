//! Per-device transaction state.

use cxr_core::Trajectory;

use crate::counter::Counter;

/// State for the transaction this device is currently part of.
///
/// Created once per device session. Counters and the trajectory under
/// review are reset at every transaction boundary: fresh request,
/// rejection, consensus. The primary role is taken only by successfully
/// initiating a request and dropped on rejection, consensus, or reconnect.
#[derive(Debug, Default)]
pub struct ServiceManager {
    primary: bool,
    user_count: Counter,
    approval_count: Counter,
    current_trajectory: Option<Trajectory>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn set_primary(&mut self, primary: bool) {
        self.primary = primary;
    }

    /// Peers that answered the presence probe.
    pub fn user_count(&self) -> &Counter {
        &self.user_count
    }

    /// Peers that approved the trajectory.
    pub fn approval_count(&self) -> &Counter {
        &self.approval_count
    }

    pub fn current_trajectory(&self) -> Option<&Trajectory> {
        self.current_trajectory.as_ref()
    }

    pub fn set_current_trajectory(&mut self, trajectory: Trajectory) {
        self.current_trajectory = Some(trajectory);
    }

    /// Zero both counters and drop the trajectory under review.
    pub fn reset_transaction(&mut self) {
        self.user_count.reset();
        self.approval_count.reset();
        self.current_trajectory = None;
    }

    /// True iff every discovered peer approved and at least one peer
    /// replied. Never vacuously true before presence replies arrive.
    pub fn quorum_reached(&self) -> bool {
        let users = self.user_count.value();
        users > 0 && self.approval_count.value() == users
    }
}
