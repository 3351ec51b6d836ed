//! Error kinds shared by the team collection and its collaborator traits.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DdError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DdError {
    /// Cooperative cancellation of a task. Always re-raised, never handled.
    #[error("task cancelled")]
    Cancelled,

    /// The external move-keys lock was taken by another distributor.
    #[error("move keys lock conflict")]
    MoveKeysConflict,

    /// A worker rejected recruitment or did not reply meaningfully.
    #[error("recruitment failed")]
    RecruitmentFailed,

    /// An RPC outcome is unknown; the request may have been delivered.
    #[error("request may have been delivered")]
    RequestMaybeDelivered,

    /// A recruitment or stall deadline elapsed.
    #[error("timed out")]
    TimedOut,

    /// The peer endpoint is gone; the per-server tracker drives removal.
    #[error("endpoint failed: {0}")]
    EndpointFailed(String),

    /// Bootstrap could not read required persistent state. Fatal for the
    /// collection instance.
    #[error("i/o error during bootstrap: {0}")]
    Io(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl DdError {
    /// Transient errors are retried with jitter inside the issuing task; the
    /// collection as a whole never fails because of one RPC.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DdError::RecruitmentFailed | DdError::RequestMaybeDelivered | DdError::TimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_policy_table() {
        assert!(DdError::RecruitmentFailed.is_retryable());
        assert!(DdError::RequestMaybeDelivered.is_retryable());
        assert!(DdError::TimedOut.is_retryable());
        assert!(!DdError::Cancelled.is_retryable());
        assert!(!DdError::MoveKeysConflict.is_retryable());
        assert!(!DdError::Io("boom".into()).is_retryable());
    }
}
