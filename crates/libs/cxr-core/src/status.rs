//! Approval status codes carried by `ApproveTrajectory` messages.

/// Closed set of approval outcomes. The wire carries the raw integer;
/// anything outside this set must be logged and ignored by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    /// A reviewer rejected the trajectory; every device aborts the
    /// transaction.
    Rejected = 0,
    /// A reviewer approved the trajectory; the primary tallies these
    /// against the discovered peer count.
    Approved = 1,
    /// The trajectory was executed; the transaction is closed for everyone.
    Consensus = 2,
}

impl ApprovalStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ApprovalStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ApprovalStatus::Rejected),
            1 => Ok(ApprovalStatus::Approved),
            2 => Ok(ApprovalStatus::Consensus),
            _ => Err(()),
        }
    }
}
