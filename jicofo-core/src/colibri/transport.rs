//! The wire boundary between [`super::session_manager::ColibriSessionManager`]
//! and a bridge: Colibri v2 rides on ordinary XMPP IQs (no separate
//! transport), so sending one is just another `send_iq` on the focus's own
//! [`Connection`], addressed to the bridge's full JID in the JVB brewery
//! MUC. This is a trait, not a concrete dependency, so the session manager
//! can be tested against an in-memory fake bridge instead (§9: dependency
//! injection over service registries).

use std::{convert::TryFrom, time::Duration};

use async_trait::async_trait;
use jicofo_xmpp_parsers::colibri2::ConferenceModify;
use thiserror::Error;
use xmpp_parsers::{
  iq::{Iq, IqType},
  BareJid, Jid,
};

use crate::{bridge::BridgeId, util::generate_id, xmpp::connection::Connection};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColibriTransportError {
  #[error("timed out waiting for bridge response")]
  Timeout,
  #[error("bridge returned an error: {0}")]
  Error(String),
}

#[async_trait]
pub trait ColibriTransport: Send + Sync + std::fmt::Debug {
  async fn send(
    &self,
    bridge: &BridgeId,
    request: ConferenceModify,
    timeout: Duration,
  ) -> Result<ConferenceModify, ColibriTransportError>;
}

/// Addresses bridges as `{brewery}/{bridge-id}`: the same MUC-presence
/// addressing scheme the focus uses for participants, just in the bridges'
/// own brewery room instead of the conference room.
#[derive(Debug, Clone)]
pub struct XmppColibriTransport {
  connection: Connection,
  brewery: BareJid,
}

impl XmppColibriTransport {
  pub fn new(connection: Connection, brewery: BareJid) -> Self {
    Self { connection, brewery }
  }

  fn bridge_jid(&self, bridge: &BridgeId) -> Jid {
    format!("{}/{}", self.brewery, bridge.0)
      .parse()
      .expect("brewery domain plus bridge id is a valid full JID")
  }
}

#[async_trait]
impl ColibriTransport for XmppColibriTransport {
  async fn send(
    &self,
    bridge: &BridgeId,
    request: ConferenceModify,
    timeout: Duration,
  ) -> Result<ConferenceModify, ColibriTransportError> {
    let iq = Iq::from_set(generate_id(), request).with_to(self.bridge_jid(bridge));
    let response = self
      .connection
      .send_iq(iq, timeout)
      .await
      .map_err(|e| match e {
        crate::xmpp::iq_tracker::IqWaitError::Timeout => ColibriTransportError::Timeout,
        crate::xmpp::iq_tracker::IqWaitError::Closed => {
          ColibriTransportError::Error("connection closed".to_owned())
        },
      })?;

    let iq = Iq::try_from(response)
      .map_err(|e| ColibriTransportError::Error(format!("malformed response: {e}")))?;
    match iq.payload {
      IqType::Result(Some(element)) => ConferenceModify::try_from(element)
        .map_err(|e| ColibriTransportError::Error(format!("malformed conference-modify: {e}"))),
      IqType::Error(error) => Err(ColibriTransportError::Error(format!("{:?}", error))),
      _ => Err(ColibriTransportError::Error(
        "bridge returned no conference-modify payload".to_owned(),
      )),
    }
  }
}
