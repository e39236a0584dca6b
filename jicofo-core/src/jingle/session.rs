//! One dialog per participant: **Idle → Initiated → Accepted → Active →
//! (Restarting → Active) → Terminated** (§4.5). Sends are fire-and-forget —
//! unlike Colibri, Jingle replies are independent incoming stanzas that the
//! conference's stanza dispatch routes back to this session by session id,
//! not responses correlated through [`crate::xmpp::iq_tracker::IqTracker`].

use std::collections::BTreeMap;

use jicofo_xmpp_parsers::{
  jingle::{Action, Content, Description, Jingle, Transport as JingleTransport},
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_rtp::Description as RtpDescription,
  jingle_ssma::{Group as WireGroup, Semantics as WireSemantics, Source as WireSource, SsrcInfo},
};
use thiserror::Error;
use xmpp_parsers::{
  iq::Iq,
  jingle::{ContentId, Creator, Reason, ReasonElement, Senders, SessionId},
  Jid,
};

use crate::{
  source_graph::{EndpointSourceSet, GroupSemantics, MediaType, Source, SsrcGroup},
  util::generate_id,
  xmpp::connection::Connection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JingleState {
  Idle,
  Initiated,
  Accepted,
  Active,
  Restarting,
  Terminated,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JingleError {
  /// Covers both a dead local connection and a peer that can no longer be
  /// reached: either way, the caller's response is the same (terminate).
  #[error("failed to send a Jingle stanza: {0}")]
  SendFailed(String),
  #[error("{action} is invalid in state {from:?}")]
  UnexpectedState {
    from: JingleState,
    action: &'static str,
  },
  #[error("malformed Jingle content: {0}")]
  Malformed(String),
}

/// One "audio" or "video" content to offer: its codecs, its transport, and
/// the sources to advertise on it.
#[derive(Debug, Clone)]
pub struct ContentSpec {
  pub media: MediaType,
  pub payload_types: Vec<PayloadTypeSpec>,
  pub transport: IceUdpTransport,
  pub sources: Vec<Source>,
  pub groups: Vec<SsrcGroup>,
}

#[derive(Debug, Clone)]
pub struct PayloadTypeSpec {
  pub id: u8,
  pub name: String,
  pub clock_rate: u32,
  pub channels: u8,
}

fn content_name(media: MediaType) -> &'static str {
  match media {
    MediaType::Audio => "audio",
    MediaType::Video => "video",
  }
}

fn media_from_content_name(name: &str) -> Result<MediaType, JingleError> {
  match name {
    "audio" => Ok(MediaType::Audio),
    "video" => Ok(MediaType::Video),
    other => Err(JingleError::Malformed(format!("unknown content media {other}"))),
  }
}

fn wire_semantics(semantics: GroupSemantics) -> WireSemantics {
  match semantics {
    GroupSemantics::Sim => WireSemantics::Sim,
    GroupSemantics::Fid => WireSemantics::Fid,
    GroupSemantics::Fec => WireSemantics::Fec,
    GroupSemantics::Ddp => WireSemantics::Ddp,
    GroupSemantics::Ls => WireSemantics::Ls,
    GroupSemantics::Srf => WireSemantics::Srf,
    GroupSemantics::Anat => WireSemantics::Anat,
  }
}

fn semantics_from_wire(semantics: WireSemantics) -> GroupSemantics {
  match semantics {
    WireSemantics::Sim => GroupSemantics::Sim,
    WireSemantics::Fid => GroupSemantics::Fid,
    WireSemantics::Fec => GroupSemantics::Fec,
    WireSemantics::Ddp => GroupSemantics::Ddp,
    WireSemantics::Ls => GroupSemantics::Ls,
    WireSemantics::Srf => GroupSemantics::Srf,
    WireSemantics::Anat => GroupSemantics::Anat,
  }
}

fn wire_source(source: &Source) -> WireSource {
  let mut wire = WireSource::new(source.ssrc);
  wire.info = Some(SsrcInfo {
    owner: source.owner.clone(),
  });
  wire
}

// `media` is unused here: `WireGroup` carries no media of its own, since
// it's always nested inside a content whose name already says audio/video.
fn wire_group(_media: MediaType, group: &SsrcGroup) -> WireGroup {
  WireGroup {
    semantics: wire_semantics(group.semantics),
    sources: group.ssrcs.iter().map(|&ssrc| WireSource::new(ssrc)).collect(),
  }
}

fn to_wire_content(spec: &ContentSpec, creator: Creator) -> Content {
  let name = content_name(spec.media);
  let mut description = RtpDescription::new(name.to_owned());
  for pt in &spec.payload_types {
    description
      .payload_types
      .push(xmpp_parsers::jingle_rtp::PayloadType::new(
        pt.id,
        pt.name.clone(),
        pt.clock_rate,
        pt.channels,
      ));
  }
  description.ssrcs = spec.sources.iter().map(wire_source).collect();
  description.ssrc_groups = spec.groups.iter().map(|g| wire_group(spec.media, g)).collect();

  Content::new(creator, ContentId(name.to_owned()))
    .with_senders(Senders::Both)
    .with_description(description)
    .with_transport(spec.transport.clone())
}

fn parse_content_sources(
  content: &Content,
  owner: &str,
) -> Result<(MediaType, Vec<Source>, Vec<SsrcGroup>), JingleError> {
  let media = media_from_content_name(&content.name.0)?;
  let Some(Description::Rtp(description)) = &content.description
  else {
    return Ok((media, Vec::new(), Vec::new()));
  };

  let sources = description
    .ssrcs
    .iter()
    .map(|ssrc| Source {
      ssrc: ssrc.id,
      media_type: media,
      owner: owner.to_owned(),
      name: None,
      video_type: None,
      muted: false,
    })
    .collect();

  let groups = description
    .ssrc_groups
    .iter()
    .map(|group| SsrcGroup {
      media_type: media,
      semantics: semantics_from_wire(group.semantics),
      ssrcs: group.sources.iter().map(|s| s.id).collect(),
    })
    .collect();

  Ok((media, sources, groups))
}

fn wire_sources_from_jingle(jingle: &Jingle, owner: &str) -> Result<EndpointSourceSet, JingleError> {
  let mut set = EndpointSourceSet::default();
  for content in &jingle.contents {
    let (_media, mut sources, mut groups) = parse_content_sources(content, owner)?;
    set.sources.append(&mut sources);
    set.groups.append(&mut groups);
  }
  Ok(set)
}

fn transport_of(jingle: &Jingle) -> Option<IceUdpTransport> {
  jingle.contents.iter().find_map(|content| match &content.transport {
    Some(JingleTransport::IceUdp(transport)) => Some(transport.clone()),
    _ => None,
  })
}

/// Per-participant Jingle dialog. `local`/`peer` are full JIDs (the focus's
/// own MUC occupant JID, and the participant's); `peer_endpoint_id` is the
/// id sources received from this peer are re-tagged with before being
/// applied to the source graph.
#[derive(Debug)]
pub struct JingleSession {
  sid: SessionId,
  local: Jid,
  peer: Jid,
  peer_endpoint_id: String,
  connection: Connection,
  state: JingleState,
}

impl JingleSession {
  pub fn new(local: Jid, peer: Jid, peer_endpoint_id: impl Into<String>, connection: Connection) -> Self {
    Self {
      sid: SessionId(generate_id()),
      local,
      peer,
      peer_endpoint_id: peer_endpoint_id.into(),
      connection,
      state: JingleState::Idle,
    }
  }

  pub fn sid(&self) -> &SessionId {
    &self.sid
  }

  pub fn state(&self) -> JingleState {
    self.state
  }

  fn require(&self, expected: JingleState, action: &'static str) -> Result<(), JingleError> {
    if self.state == expected {
      Ok(())
    }
    else {
      Err(JingleError::UnexpectedState { from: self.state, action })
    }
  }

  async fn send(&self, jingle: Jingle) -> Result<(), JingleError> {
    let iq = Iq::from_set(generate_id(), jingle)
      .with_to(self.peer.clone())
      .with_from(self.local.clone());
    self
      .connection
      .tx
      .send(iq.into())
      .await
      .map_err(|e| JingleError::SendFailed(e.to_string()))
  }

  /// Idle → Initiated: send session-initiate with the given offer contents.
  pub async fn initiate(&mut self, contents: &[ContentSpec]) -> Result<(), JingleError> {
    self.require(JingleState::Idle, "initiate")?;

    let mut jingle = Jingle::new(Action::SessionInitiate, self.sid.clone())
      .with_initiator(self.local.clone())
      .with_responder(self.peer.clone());
    for spec in contents {
      jingle = jingle.add_content(to_wire_content(spec, Creator::Initiator));
    }

    self.send(jingle).await?;
    self.state = JingleState::Initiated;
    Ok(())
  }

  /// Initiated → Accepted: incoming session-accept. Returns the peer's
  /// transport (per content, the first one found) and sources, re-tagged
  /// with this session's peer endpoint id.
  pub fn on_session_accept(
    &mut self,
    jingle: &Jingle,
  ) -> Result<(EndpointSourceSet, Option<IceUdpTransport>), JingleError> {
    self.require(JingleState::Initiated, "session-accept")?;
    let sources = wire_sources_from_jingle(jingle, &self.peer_endpoint_id)?;
    let transport = transport_of(jingle);
    self.state = JingleState::Accepted;
    Ok((sources, transport))
  }

  /// Accepted → Active: the conference has applied the peer's initial
  /// sources to the source graph.
  pub fn mark_active(&mut self) -> Result<(), JingleError> {
    self.require(JingleState::Accepted, "mark-active")?;
    self.state = JingleState::Active;
    Ok(())
  }

  /// Active: send an outgoing source-add for the given (already-merged)
  /// source set.
  pub async fn send_source_add(&mut self, added: &EndpointSourceSet) -> Result<(), JingleError> {
    self.require(JingleState::Active, "source-add")?;
    self.send(self.build_source_message(Action::SourceAdd, added)).await
  }

  /// Active: send an outgoing source-remove for the given (already-merged)
  /// source set.
  pub async fn send_source_remove(&mut self, removed: &EndpointSourceSet) -> Result<(), JingleError> {
    self.require(JingleState::Active, "source-remove")?;
    self.send(self.build_source_message(Action::SourceRemove, removed)).await
  }

  fn build_source_message(&self, action: Action, set: &EndpointSourceSet) -> Jingle {
    let mut by_media: BTreeMap<&'static str, (Vec<WireSource>, Vec<WireGroup>)> = BTreeMap::new();
    for source in &set.sources {
      by_media
        .entry(content_name(source.media_type))
        .or_default()
        .0
        .push(wire_source(source));
    }
    for group in &set.groups {
      by_media
        .entry(content_name(group.media_type))
        .or_default()
        .1
        .push(wire_group(group.media_type, group));
    }

    let mut jingle = Jingle::new(action, self.sid.clone())
      .with_initiator(self.local.clone())
      .with_responder(self.peer.clone());
    for (name, (sources, groups)) in by_media {
      let mut description = RtpDescription::new(name.to_owned());
      description.ssrcs = sources;
      description.ssrc_groups = groups;
      jingle = jingle.add_content(
        Content::new(Creator::Initiator, ContentId(name.to_owned())).with_description(description),
      );
    }
    jingle
  }

  /// Active: incoming source-add, re-tagged with the peer endpoint id.
  pub fn on_source_add(&self, jingle: &Jingle) -> Result<EndpointSourceSet, JingleError> {
    self.require(JingleState::Active, "source-add")?;
    wire_sources_from_jingle(jingle, &self.peer_endpoint_id)
  }

  /// Active: incoming source-remove, re-tagged with the peer endpoint id.
  pub fn on_source_remove(&self, jingle: &Jingle) -> Result<EndpointSourceSet, JingleError> {
    self.require(JingleState::Active, "source-remove")?;
    wire_sources_from_jingle(jingle, &self.peer_endpoint_id)
  }

  /// Active → Restarting: request an ICE restart on one content by sending
  /// transport-replace with a freshly allocated transport.
  pub async fn restart(&mut self, media: MediaType, transport: IceUdpTransport) -> Result<(), JingleError> {
    self.require(JingleState::Active, "transport-replace")?;

    let jingle = Jingle::new(Action::TransportReplace, self.sid.clone())
      .with_initiator(self.local.clone())
      .with_responder(self.peer.clone())
      .add_content(
        Content::new(Creator::Initiator, ContentId(content_name(media).to_owned()))
          .with_transport(transport),
      );

    self.send(jingle).await?;
    self.state = JingleState::Restarting;
    Ok(())
  }

  /// Restarting → Active: the peer accepted the new transport.
  pub fn on_restart_accept(&mut self, jingle: &Jingle) -> Result<Option<IceUdpTransport>, JingleError> {
    self.require(JingleState::Restarting, "transport-accept")?;
    let transport = transport_of(jingle);
    self.state = JingleState::Active;
    Ok(transport)
  }

  /// Any → Terminated. Best-effort: the session is marked Terminated even
  /// if the stanza fails to send, since there is no peer left to retry
  /// against.
  pub async fn terminate(&mut self, reason: Reason) -> Result<(), JingleError> {
    if self.state == JingleState::Terminated {
      return Ok(());
    }

    let jingle = Jingle::new(Action::SessionTerminate, self.sid.clone()).set_reason(ReasonElement {
      reason,
      texts: BTreeMap::new(),
    });
    let result = self.send(jingle).await;
    self.state = JingleState::Terminated;
    result
  }

  /// Initiated → Terminated: no session-accept arrived within the caller's
  /// response timeout.
  pub fn on_timeout(&mut self) {
    if self.state == JingleState::Initiated {
      self.state = JingleState::Terminated;
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::source_graph::JVB_OWNER;

  fn jids() -> (Jid, Jid) {
    (
      "focus@conference.example.com/focus".parse().unwrap(),
      "room@conference.example.com/alice".parse().unwrap(),
    )
  }

  fn test_connection() -> (Connection, tokio::sync::mpsc::Receiver<xmpp_parsers::Element>) {
    // `Connection::new` dials a real websocket; for FSM-only tests we just
    // need something with a `tx`/`iq_tracker` pair, so build the channel
    // directly the same way `Connection::new` does internally.
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    (Connection::for_test(tx), rx)
  }

  fn content_spec(media: MediaType) -> ContentSpec {
    ContentSpec {
      media,
      payload_types: vec![PayloadTypeSpec {
        id: if media == MediaType::Audio { 111 } else { 100 },
        name: if media == MediaType::Audio { "opus" } else { "VP8" }.to_owned(),
        clock_rate: 90000,
        channels: 1,
      }],
      transport: IceUdpTransport::new(),
      sources: Vec::new(),
      groups: Vec::new(),
    }
  }

  #[tokio::test]
  async fn initiate_transitions_idle_to_initiated_and_sends_once() {
    let (connection, mut rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer, "alice", connection);

    session
      .initiate(&[content_spec(MediaType::Audio), content_spec(MediaType::Video)])
      .await
      .unwrap();

    assert_eq!(session.state(), JingleState::Initiated);
    let sent = tokio::time::timeout(Duration::from_millis(100), rx.recv())
      .await
      .unwrap();
    assert!(sent.is_some());
    assert!(rx.try_recv().is_err(), "session-initiate must be sent exactly once");
  }

  #[tokio::test]
  async fn double_initiate_is_rejected() {
    let (connection, _rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer, "alice", connection);

    session.initiate(&[content_spec(MediaType::Audio)]).await.unwrap();
    let err = session.initiate(&[content_spec(MediaType::Audio)]).await.unwrap_err();
    assert_eq!(
      err,
      JingleError::UnexpectedState {
        from: JingleState::Initiated,
        action: "initiate"
      }
    );
  }

  #[tokio::test]
  async fn session_accept_extracts_sources_and_transport_tagged_with_peer() {
    let (connection, _rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer.clone(), "alice", connection);
    session.initiate(&[content_spec(MediaType::Audio)]).await.unwrap();

    let mut transport = IceUdpTransport::new();
    transport.ufrag = Some("ufrag".to_owned());
    let mut description = RtpDescription::new("audio".to_owned());
    description.ssrcs = vec![{
      let mut s = WireSource::new(111);
      s.info = Some(SsrcInfo {
        owner: JVB_OWNER.to_owned(),
      });
      s
    }];
    let accept = Jingle::new(Action::SessionAccept, session.sid().clone())
      .with_initiator(peer)
      .add_content(
        Content::new(Creator::Responder, ContentId("audio".to_owned()))
          .with_description(description)
          .with_transport(transport),
      );

    let (sources, transport) = session.on_session_accept(&accept).unwrap();
    assert_eq!(session.state(), JingleState::Accepted);
    assert_eq!(sources.sources.len(), 1);
    // Re-tagged with the peer's endpoint id, regardless of what ssrc-info said.
    assert_eq!(sources.sources[0].owner, "alice");
    assert!(transport.is_some());
  }

  #[tokio::test]
  async fn source_add_requires_active_state() {
    let (connection, _rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer, "alice", connection);

    let err = session
      .send_source_add(&EndpointSourceSet::default())
      .await
      .unwrap_err();
    assert_eq!(
      err,
      JingleError::UnexpectedState {
        from: JingleState::Idle,
        action: "source-add"
      }
    );
  }

  #[tokio::test]
  async fn terminate_is_terminal_and_idempotent() {
    let (connection, _rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer, "alice", connection);

    session.terminate(Reason::Success).await.unwrap();
    assert_eq!(session.state(), JingleState::Terminated);
    // Terminating again is a no-op, not an error.
    session.terminate(Reason::Success).await.unwrap();
  }

  #[tokio::test]
  async fn timeout_only_fires_while_initiated() {
    let (connection, _rx) = test_connection();
    let (local, peer) = jids();
    let mut session = JingleSession::new(local, peer, "alice", connection);

    session.on_timeout();
    assert_eq!(session.state(), JingleState::Idle);

    session.initiate(&[content_spec(MediaType::Audio)]).await.unwrap();
    session.on_timeout();
    assert_eq!(session.state(), JingleState::Terminated);
  }
}
