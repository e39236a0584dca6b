//! Allocates and expires endpoints on bridges, and keeps the bridges
//! holding a conference meshed by [`Relay`]s (§4.4).

pub mod session_manager;
pub mod transport;

pub use session_manager::{ColibriAllocation, ColibriError, ColibriSessionManager};
pub use transport::{ColibriTransport, XmppColibriTransport};

use std::collections::HashSet;

use crate::bridge::BridgeId;

/// A participant allocated on one bridge, as tracked by the session manager.
#[derive(Debug, Clone)]
pub(crate) struct ColibriEndpoint {
  pub(crate) bridge: BridgeId,
  pub(crate) mute_audio: bool,
  pub(crate) mute_video: bool,
  pub(crate) sctp: bool,
}

/// A conference's footprint on one bridge: a meeting id shared across the
/// conference's sessions, the endpoints allocated there, and a relay to
/// every sibling session (I6).
#[derive(Debug, Clone, Default)]
pub(crate) struct ColibriSession {
  pub(crate) endpoints: HashSet<String>,
  pub(crate) relays: std::collections::HashMap<BridgeId, Relay>,
}

/// An inter-bridge link transporting forwarded sources between two sessions
/// of the same conference (I6). `endpoints` mirrors what has actually been
/// signaled over the wire, so a diff against the peer session's endpoint
/// set tells us what still needs to be added or removed.
#[derive(Debug, Clone, Default)]
pub(crate) struct Relay {
  pub(crate) endpoints: HashSet<String>,
}
