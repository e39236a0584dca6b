pub mod bridge;
pub mod clock;
pub mod colibri;
pub mod conference;
pub mod conference_registry;
pub mod config;
pub mod error;
pub mod focus_iq;
pub mod jingle;
pub mod participant;
mod pinger;
pub mod pool_selector;
pub mod source_graph;
mod stanza_filter;
mod tls;
pub mod util;
pub mod xmpp;

pub use crate::{
  bridge::{Bridge, BridgePresenceWatcher, BridgeEvent, BridgeId, BridgeRegistry, BridgeSelectionStrategy},
  clock::{Clock, SystemClock, TestClock},
  colibri::{ColibriError, ColibriSessionManager},
  conference::{Conference, ConferenceDeps},
  conference_registry::{ConferenceRegistry, ConferenceRegistryDeps, PinRegistry},
  config::Config,
  error::FocusError,
  focus_iq::FocusIqHandler,
  jingle::{ContentSpec, JingleError, JingleSession, JingleState, PayloadTypeSpec},
  participant::{
    OfferOptions, Participant, ParticipantError, RestartLimiter, SourceChangeQueue,
  },
  pool_selector::{PoolMember, PoolSelector},
  source_graph::{EndpointSourceSet, MediaType, Source, SourceGraph},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}