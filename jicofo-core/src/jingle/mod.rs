//! Per-participant Jingle signaling (§4.5): one state machine per dialog,
//! carrying offer/accept, source-add/remove and ICE restart over the
//! focus's own [`crate::xmpp::connection::Connection`].

pub mod session;

pub use session::{ContentSpec, JingleError, JingleSession, JingleState, PayloadTypeSpec};
