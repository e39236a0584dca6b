//! Top-level conference-request IQ dispatch (§6): the client-facing entry
//! point into [`ConferenceRegistry::get_or_create`], addressed to the
//! focus's own JID rather than scoped to a room the way Jingle/presence
//! traffic is. The HTTP `/conference-request/v1` surface (§6, `jicofo::http`)
//! is a thin JSON translator in front of the same [`FocusIqHandler::handle_request`]
//! call, per SPEC_FULL §9's "REST does not duplicate behavior" decision.

use std::convert::TryFrom;

use anyhow::Result;
use async_trait::async_trait;
use jicofo_xmpp_parsers::{conference_iq::ConferenceIq, ns::JITSI_FOCUS};
use tracing::warn;
use xmpp_parsers::{
  iq::{Iq, IqType},
  BareJid, Element, FullJid, Jid,
};

use crate::{conference_registry::ConferenceRegistry, stanza_filter::StanzaFilter};

fn bare_of(jid: &Jid) -> BareJid {
  match jid {
    Jid::Bare(bare) => bare.clone(),
    Jid::Full(full) => full.to_bare(),
  }
}

/// Registered as a [`StanzaFilter`] on the focus's connection once its own
/// JID is known (post-bind).
#[derive(Clone)]
pub struct FocusIqHandler {
  focus_jid: FullJid,
  connection: crate::xmpp::connection::Connection,
  registry: std::sync::Arc<ConferenceRegistry>,
}

impl FocusIqHandler {
  pub fn new(
    focus_jid: FullJid,
    connection: crate::xmpp::connection::Connection,
    registry: std::sync::Arc<ConferenceRegistry>,
  ) -> Self {
    Self { focus_jid, connection, registry }
  }

  /// Looks up or creates the requested room and reports it ready; shared by
  /// the XMPP and HTTP entry points.
  pub fn handle_request(&self, request: ConferenceIq) -> ConferenceIq {
    let room = bare_of(&request.room);
    let conference = self.registry.get_or_create(room);
    ConferenceIq::response(request.room, [("meetingId".to_owned(), conference.meeting_id().to_owned())].into())
  }
}

#[async_trait]
impl StanzaFilter for FocusIqHandler {
  fn filter(&self, element: &Element) -> bool {
    if element.name() != "iq" {
      return false;
    }
    let addressed_to_focus = element
      .attr("to")
      .and_then(|to| to.parse::<Jid>().ok())
      .map(|to| bare_of(&to) == self.focus_jid.to_bare())
      .unwrap_or(false);
    addressed_to_focus && element.children().any(|child| child.is("conference", JITSI_FOCUS))
  }

  async fn take(&self, element: Element) -> Result<()> {
    let id = element.attr("id").unwrap_or_default().to_owned();
    let from = element.attr("from").and_then(|from| from.parse::<Jid>().ok());
    let iq = Iq::try_from(element)?;

    let IqType::Set(payload) = iq.payload
    else {
      return Ok(());
    };
    let request = match ConferenceIq::try_from(payload) {
      Ok(request) => request,
      Err(e) => {
        warn!("malformed conference-request IQ: {:?}", e);
        return Ok(());
      },
    };

    let response = self.handle_request(request);
    let mut result_iq = Iq::from_result(id, Some(response)).with_from(Jid::Full(self.focus_jid.clone()));
    if let Some(to) = from {
      result_iq = result_iq.with_to(to);
    }
    self.connection.tx.send(result_iq.into()).await?;
    Ok(())
  }
}
