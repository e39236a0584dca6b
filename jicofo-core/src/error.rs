//! Unified error kinds for the focus control plane (§7): every subordinate
//! component's error type folds into one of these, so callers at the
//! conference/HTTP/CLI boundary can map to a single outward surface instead
//! of matching on each component's own enum.

use thiserror::Error;

use crate::{
  colibri::ColibriError, jingle::JingleError, participant::ParticipantError,
  source_graph::SourceGraphError, xmpp::iq_tracker::IqWaitError,
};

/// A kind, not a type: several underlying errors fold into the same kind
/// because they're handled identically at the boundary (e.g. every Colibri
/// allocation failure is `retried on a different bridge up to cap`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FocusError {
  #[error("no response within the request timeout")]
  Timeout,

  #[error("no bridge satisfies the conference's constraints")]
  BridgeUnavailable,

  #[error("allocation request to the bridge failed or timed out")]
  BridgeFailedDuringAllocation,

  #[error("selected bridge is in graceful shutdown")]
  BridgeInGracefulShutdown,

  #[error("bridge returned an error condition: {0}")]
  AllocationFailed(String),

  #[error("participant already invited")]
  ParticipantAlreadyInvited,

  #[error("source graph rejected the change: {0}")]
  SourceRejected(String),

  #[error("too many restart requests in the current window")]
  RateLimited,

  #[error("not allowed")]
  NotAllowed,

  #[error("failed to reach the peer: {0}")]
  PeerUnavailable(String),

  #[error("fatal configuration or startup error: {0}")]
  Fatal(String),
}

impl From<ColibriError> for FocusError {
  fn from(error: ColibriError) -> Self {
    match error {
      ColibriError::BridgeUnavailable => FocusError::BridgeUnavailable,
      ColibriError::BridgeInGracefulShutdown => FocusError::BridgeInGracefulShutdown,
      ColibriError::BridgeFailedDuringAllocation => FocusError::BridgeFailedDuringAllocation,
      ColibriError::ParticipantAlreadyInvited => FocusError::ParticipantAlreadyInvited,
      ColibriError::AllocationFailed(reason) => FocusError::AllocationFailed(reason),
    }
  }
}

impl From<JingleError> for FocusError {
  fn from(error: JingleError) -> Self {
    FocusError::PeerUnavailable(error.to_string())
  }
}

impl From<ParticipantError> for FocusError {
  fn from(error: ParticipantError) -> Self {
    match error {
      ParticipantError::RateLimited => FocusError::RateLimited,
    }
  }
}

impl From<SourceGraphError> for FocusError {
  fn from(error: SourceGraphError) -> Self {
    FocusError::SourceRejected(error.to_string())
  }
}

impl From<IqWaitError> for FocusError {
  fn from(error: IqWaitError) -> Self {
    match error {
      IqWaitError::Timeout => FocusError::Timeout,
      IqWaitError::Closed => FocusError::PeerUnavailable("connection closed".to_owned()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn colibri_errors_fold_into_matching_kinds() {
    assert_eq!(FocusError::from(ColibriError::BridgeUnavailable), FocusError::BridgeUnavailable);
    assert_eq!(
      FocusError::from(ColibriError::ParticipantAlreadyInvited),
      FocusError::ParticipantAlreadyInvited
    );
  }

  #[test]
  fn participant_rate_limit_folds_to_rate_limited() {
    assert_eq!(FocusError::from(ParticipantError::RateLimited), FocusError::RateLimited);
  }
}
