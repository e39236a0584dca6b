//! For one conference, keeps a minimal set of [`super::ColibriSession`]s
//! across bridges so that every participant has a [`super::ColibriEndpoint`]
//! on exactly one bridge and all bridges are meshed by [`super::Relay`]s
//! (I5, I6).

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::Duration,
};

use jicofo_xmpp_parsers::{
  colibri2::{ConferenceModify, Endpoint as WireEndpoint, ForceMute, Relay as WireRelay, RelayEndpoint, Sctp},
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_ssma::{Group as WireGroup, Semantics, Source as WireSource},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{transport::ColibriTransportError, ColibriEndpoint, ColibriSession, ColibriTransport, Relay};
use crate::{
  bridge::{BridgeId, BridgeRegistry, BridgeSelectionStrategy},
  source_graph::{EndpointSourceSet, GroupSemantics, MediaType, Source, SsrcGroup, JVB_OWNER},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColibriError {
  #[error("no bridge satisfies the conference's constraints")]
  BridgeUnavailable,
  #[error("selected bridge is in graceful shutdown")]
  BridgeInGracefulShutdown,
  #[error("allocation failed: {0}")]
  AllocationFailed(String),
  #[error("endpoint already invited")]
  ParticipantAlreadyInvited,
  #[error("allocation request to the bridge failed or timed out")]
  BridgeFailedDuringAllocation,
}

/// What an `allocate` call hands back to the [`crate::participant`]
/// controller: the bridge's own transport for this endpoint, plus any
/// feedback sources (I4) it synthesized.
#[derive(Debug, Clone)]
pub struct ColibriAllocation {
  pub bridge: BridgeId,
  pub transport: Option<IceUdpTransport>,
  pub feedback_sources: EndpointSourceSet,
}

#[derive(Debug, Default)]
struct ManagerState {
  sessions: HashMap<BridgeId, ColibriSession>,
  endpoint_bridge: HashMap<String, BridgeId>,
  endpoints: HashMap<String, ColibriEndpoint>,
  /// Each endpoint's most recently known source set, so a relay newly meshed
  /// against an already-populated bridge can be seeded with every existing
  /// endpoint's current sources rather than just its id (§4.4).
  endpoint_sources: HashMap<String, EndpointSourceSet>,
}

#[derive(Debug)]
pub struct ColibriSessionManager {
  meeting_id: String,
  transport: Arc<dyn ColibriTransport>,
  strategy: Arc<dyn BridgeSelectionStrategy>,
  registry: Arc<BridgeRegistry>,
  iq_timeout: Duration,
  state: Mutex<ManagerState>,
}

fn wire_source(source: &Source) -> WireSource {
  let mut wire = WireSource::new(source.ssrc);
  if source.owner != JVB_OWNER {
    wire.info = Some(jicofo_xmpp_parsers::jingle_ssma::SsrcInfo { owner: source.owner.clone() });
  }
  wire
}

fn wire_semantics(semantics: GroupSemantics) -> Semantics {
  match semantics {
    GroupSemantics::Sim => Semantics::Sim,
    GroupSemantics::Fid => Semantics::Fid,
    GroupSemantics::Fec => Semantics::Fec,
    GroupSemantics::Ddp => Semantics::Ddp,
    GroupSemantics::Ls => Semantics::Ls,
    GroupSemantics::Srf => Semantics::Srf,
    GroupSemantics::Anat => Semantics::Anat,
  }
}

fn wire_group(group: &SsrcGroup) -> WireGroup {
  WireGroup {
    semantics: wire_semantics(group.semantics),
    sources: group.ssrcs.iter().map(|ssrc| WireSource::new(*ssrc)).collect(),
  }
}

/// Builds a `RelayEndpoint::add` carrying `endpoint`'s current sources (if
/// any are known), so a sibling bridge first learning of `endpoint` (whether
/// via a fresh mesh or an incremental update) gets its SSRCs along with its
/// id (§4.4).
fn relay_endpoint_for(endpoint: &str, sources: Option<&EndpointSourceSet>) -> RelayEndpoint {
  let mut relay_endpoint = RelayEndpoint::add(endpoint.to_owned());
  if let Some(set) = sources {
    relay_endpoint.sources = set.sources.iter().map(wire_source).collect();
    relay_endpoint.source_groups = set.groups.iter().map(wire_group).collect();
  }
  relay_endpoint
}

fn feedback_sources_from(response: &ConferenceModify, endpoint_id: &str) -> EndpointSourceSet {
  let Some(endpoint) = response.endpoints.iter().find(|e| e.id == endpoint_id) else {
    return EndpointSourceSet::default();
  };
  EndpointSourceSet {
    sources: endpoint
      .sources
      .iter()
      .map(|s| Source {
        ssrc: s.id,
        media_type: MediaType::Audio,
        owner: JVB_OWNER.to_owned(),
        name: None,
        video_type: None,
        muted: false,
      })
      .collect(),
    groups: Vec::new(),
  }
}

impl ColibriSessionManager {
  pub fn new(
    meeting_id: impl Into<String>,
    transport: Arc<dyn ColibriTransport>,
    strategy: Arc<dyn BridgeSelectionStrategy>,
    registry: Arc<BridgeRegistry>,
    iq_timeout: Duration,
  ) -> Self {
    Self {
      meeting_id: meeting_id.into(),
      transport,
      strategy,
      registry,
      iq_timeout,
      state: Mutex::new(ManagerState::default()),
    }
  }

  async fn send(
    &self,
    bridge: &BridgeId,
    request: ConferenceModify,
  ) -> Result<ConferenceModify, ColibriTransportError> {
    self.transport.send(bridge, request, self.iq_timeout).await
  }

  /// Picks a bridge via the selection strategy, ensures a session exists on
  /// it (meshing relays to every sibling session if it is new), and
  /// allocates a [`super::ColibriEndpoint`] there.
  pub async fn allocate(
    &self,
    endpoint_id: &str,
    force_mute: (bool, bool),
    region: Option<&str>,
    version_constraint: Option<&str>,
  ) -> Result<ColibriAllocation, ColibriError> {
    let mut state = self.state.lock().await;

    if state.endpoint_bridge.contains_key(endpoint_id) {
      return Err(ColibriError::ParticipantAlreadyInvited);
    }

    let conference_bridges: HashMap<BridgeId, u32> = state
      .sessions
      .iter()
      .map(|(id, session)| (id.clone(), session.endpoints.len() as u32))
      .collect();
    let candidates = self.registry.snapshot();

    // §4.3: a pin's version always wins; absent one, once the conference
    // already spans at least one bridge every further allocation is
    // constrained to that bridge's version (I7) rather than left free.
    let derived_version = version_constraint.map(ToOwned::to_owned).or_else(|| {
      conference_bridges
        .keys()
        .next()
        .and_then(|id| candidates.iter().find(|b| b.id == *id))
        .map(|b| b.version.clone())
    });

    let chosen = self
      .strategy
      .select(&candidates, &conference_bridges, region, derived_version.as_deref())
      .await
      .ok_or(ColibriError::BridgeUnavailable)?;

    let bridge = self.registry.get(&chosen).ok_or(ColibriError::BridgeUnavailable)?;
    if bridge.graceful_shutdown {
      return Err(ColibriError::BridgeInGracefulShutdown);
    }

    let is_new_session = !state.sessions.contains_key(&chosen);
    if is_new_session {
      state.sessions.insert(chosen.clone(), ColibriSession::default());
    }

    let mut wire_endpoint = WireEndpoint::create(endpoint_id);
    wire_endpoint.sctp = Some(Sctp);
    if force_mute.0 || force_mute.1 {
      wire_endpoint.force_mute = Some(ForceMute {
        audio: force_mute.0.into(),
        video: force_mute.1.into(),
      });
    }

    let mut request = ConferenceModify::new().with_meeting_id(self.meeting_id.clone());
    if is_new_session {
      request = request.creating();
    }
    request = request.add_endpoint(wire_endpoint);

    let response = match self.send(&chosen, request).await {
      Ok(response) => response,
      Err(_) => {
        if is_new_session {
          state.sessions.remove(&chosen);
        }
        return Err(ColibriError::BridgeFailedDuringAllocation);
      },
    };

    let transport = response
      .endpoints
      .iter()
      .find(|e| e.id == endpoint_id)
      .and_then(|e| e.transport.clone());
    let feedback_sources = feedback_sources_from(&response, endpoint_id);

    state
      .sessions
      .get_mut(&chosen)
      .expect("session just ensured above")
      .endpoints
      .insert(endpoint_id.to_owned());
    state.endpoint_bridge.insert(endpoint_id.to_owned(), chosen.clone());
    state.endpoints.insert(
      endpoint_id.to_owned(),
      ColibriEndpoint {
        bridge: chosen.clone(),
        mute_audio: force_mute.0,
        mute_video: force_mute.1,
        sctp: true,
      },
    );

    if is_new_session {
      if let Err(e) = self.establish_relay_mesh(&mut state, &chosen).await {
        warn!("failed to mesh relays for new bridge {}: {:?}", chosen, e);
      }
    }

    info!("allocated endpoint {} on bridge {}", endpoint_id, chosen);
    Ok(ColibriAllocation { bridge: chosen, transport, feedback_sources })
  }

  /// Creates a `Relay` on `new_bridge` naming each existing sibling session
  /// (and carrying its current endpoints), and the symmetric relay on each
  /// sibling naming `new_bridge` (I6).
  async fn establish_relay_mesh(
    &self,
    state: &mut ManagerState,
    new_bridge: &BridgeId,
  ) -> Result<(), ColibriTransportError> {
    let siblings: Vec<BridgeId> = state
      .sessions
      .keys()
      .filter(|id| *id != new_bridge)
      .cloned()
      .collect();

    for sibling in siblings {
      let sibling_endpoints: HashSet<String> = state.sessions[&sibling].endpoints.clone();
      let mut relay_to_sibling = WireRelay::create(sibling.0.clone());
      for endpoint in &sibling_endpoints {
        relay_to_sibling = relay_to_sibling.add_endpoint(relay_endpoint_for(endpoint, state.endpoint_sources.get(endpoint)));
      }
      let request = ConferenceModify::new()
        .with_meeting_id(self.meeting_id.clone())
        .add_relay(relay_to_sibling);
      let response = self.send(new_bridge, request).await?;
      let new_bridge_relay_transport = response
        .relays
        .iter()
        .find(|r| r.id == sibling.0)
        .and_then(|r| r.transport.clone());

      let new_bridge_endpoints: HashSet<String> = state.sessions[new_bridge].endpoints.clone();
      let mut relay_to_new = WireRelay::create(new_bridge.0.clone());
      relay_to_new.transport = new_bridge_relay_transport;
      for endpoint in &new_bridge_endpoints {
        relay_to_new = relay_to_new.add_endpoint(relay_endpoint_for(endpoint, state.endpoint_sources.get(endpoint)));
      }
      let request = ConferenceModify::new()
        .with_meeting_id(self.meeting_id.clone())
        .add_relay(relay_to_new);
      self.send(&sibling, request).await?;

      state
        .sessions
        .get_mut(new_bridge)
        .expect("checked above")
        .relays
        .insert(sibling.clone(), Relay { endpoints: sibling_endpoints });
      state
        .sessions
        .get_mut(&sibling)
        .expect("checked above")
        .relays
        .insert(new_bridge.clone(), Relay { endpoints: new_bridge_endpoints });
    }

    Ok(())
  }

  /// Applies a partial update to an already-allocated endpoint; idempotent
  /// in each field.
  pub async fn update_participant(
    &self,
    endpoint_id: &str,
    transport: Option<IceUdpTransport>,
    sources: Option<&EndpointSourceSet>,
    mute: Option<(bool, bool)>,
  ) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    let bridge = state
      .endpoint_bridge
      .get(endpoint_id)
      .cloned()
      .ok_or_else(|| ColibriError::AllocationFailed(format!("{endpoint_id} not allocated")))?;

    let mut wire_endpoint = WireEndpoint::update(endpoint_id);
    wire_endpoint.transport = transport;
    if let Some(set) = sources {
      wire_endpoint.sources = set.sources.iter().map(wire_source).collect();
      wire_endpoint.source_groups = set.groups.iter().map(wire_group).collect();
    }
    if let Some((audio, video)) = mute {
      wire_endpoint.force_mute = Some(ForceMute { audio: audio.into(), video: video.into() });
    }

    let request = ConferenceModify::new()
      .with_meeting_id(self.meeting_id.clone())
      .add_endpoint(wire_endpoint);

    self
      .send(&bridge, request)
      .await
      .map_err(|e| ColibriError::AllocationFailed(e.to_string()))?;

    if let Some((audio, video)) = mute {
      if let Some(endpoint) = state.endpoints.get_mut(endpoint_id) {
        endpoint.mute_audio = audio;
        endpoint.mute_video = video;
      }
    }
    Ok(())
  }

  /// Sends a force-mute update for one endpoint.
  pub async fn mute(&self, endpoint_id: &str, audio: Option<bool>, video: Option<bool>) -> Result<(), ColibriError> {
    let mut state = self.state.lock().await;
    let bridge = state
      .endpoint_bridge
      .get(endpoint_id)
      .cloned()
      .ok_or_else(|| ColibriError::AllocationFailed(format!("{endpoint_id} not allocated")))?;
    let current = state
      .endpoints
      .get(endpoint_id)
      .cloned()
      .unwrap_or(ColibriEndpoint { bridge: bridge.clone(), mute_audio: false, mute_video: false, sctp: false });
    let new_audio = audio.unwrap_or(current.mute_audio);
    let new_video = video.unwrap_or(current.mute_video);

    let mut wire_endpoint = WireEndpoint::update(endpoint_id);
    wire_endpoint.force_mute = Some(ForceMute { audio: new_audio.into(), video: new_video.into() });
    let request = ConferenceModify::new()
      .with_meeting_id(self.meeting_id.clone())
      .add_endpoint(wire_endpoint);

    self
      .send(&bridge, request)
      .await
      .map_err(|e| ColibriError::AllocationFailed(e.to_string()))?;

    state
      .endpoints
      .insert(endpoint_id.to_owned(), ColibriEndpoint { mute_audio: new_audio, mute_video: new_video, ..current });
    Ok(())
  }

  /// Expires one endpoint. If it was the last one on its bridge, the whole
  /// session (and every relay referencing it) is torn down too.
  pub async fn expire(&self, endpoint_id: &str) {
    let mut state = self.state.lock().await;
    let Some(bridge) = state.endpoint_bridge.remove(endpoint_id) else {
      return;
    };
    state.endpoints.remove(endpoint_id);
    state.endpoint_sources.remove(endpoint_id);

    let request = ConferenceModify::new()
      .with_meeting_id(self.meeting_id.clone())
      .add_endpoint(WireEndpoint::expire(endpoint_id));
    if let Err(e) = self.send(&bridge, request).await {
      warn!("failed to expire endpoint {} on {}: {:?}", endpoint_id, bridge, e);
    }

    self.remove_endpoint_from_relays(&mut state, endpoint_id, &bridge).await;

    let is_last = state
      .sessions
      .get(&bridge)
      .map(|session| {
        session.endpoints.is_empty() || (session.endpoints.len() == 1 && session.endpoints.contains(endpoint_id))
      })
      .unwrap_or(true);
    if let Some(session) = state.sessions.get_mut(&bridge) {
      session.endpoints.remove(endpoint_id);
    }

    if is_last {
      self.teardown_session(&mut state, &bridge).await;
    }
  }

  async fn remove_endpoint_from_relays(&self, state: &mut ManagerState, endpoint_id: &str, home: &BridgeId) {
    let peers: Vec<BridgeId> = state
      .sessions
      .iter()
      .filter(|(id, session)| *id != home && session.relays.contains_key(home))
      .map(|(id, _)| id.clone())
      .collect();

    for peer in peers {
      let relay = WireRelay::update(home.0.clone()).add_endpoint(RelayEndpoint::remove(endpoint_id.to_owned()));
      let request = ConferenceModify::new()
        .with_meeting_id(self.meeting_id.clone())
        .add_relay(relay);
      if let Err(e) = self.send(&peer, request).await {
        warn!("failed to remove endpoint {} from relay on {}: {:?}", endpoint_id, peer, e);
      }
      if let Some(session) = state.sessions.get_mut(&peer) {
        if let Some(relay) = session.relays.get_mut(home) {
          relay.endpoints.remove(endpoint_id);
        }
      }
    }
  }

  /// Expires an empty session and removes the relay each sibling holds to it.
  async fn teardown_session(&self, state: &mut ManagerState, bridge: &BridgeId) {
    let Some(session) = state.sessions.remove(bridge) else {
      return;
    };
    for (peer, _) in session.relays {
      let relay = WireRelay::expire(bridge.0.clone());
      let request = ConferenceModify::new()
        .with_meeting_id(self.meeting_id.clone())
        .add_relay(relay);
      if let Err(e) = self.send(&peer, request).await {
        warn!("failed to tear down relay on {} for {}: {:?}", peer, bridge, e);
      }
      if let Some(peer_session) = state.sessions.get_mut(&peer) {
        peer_session.relays.remove(bridge);
      }
    }
    debug!("colibri session on {} torn down", bridge);
  }

  /// For every bridge holding a session, propagates newly added/removed
  /// sources belonging to endpoints hosted on *other* bridges over the
  /// relay between them (I6). Returns the endpoint ids whose home session
  /// had to be torn down because a relay update failed, so the caller can
  /// migrate them to a different bridge.
  pub async fn propagate_source_diff(
    &self,
    added: &HashMap<String, EndpointSourceSet>,
    removed: &HashMap<String, EndpointSourceSet>,
  ) -> Vec<String> {
    let mut state = self.state.lock().await;
    let mut migrated = Vec::new();

    for (endpoint_id, set) in added {
      let Some(home) = state.endpoint_bridge.get(endpoint_id).cloned() else { continue };
      let known = state.endpoint_sources.entry(endpoint_id.clone()).or_default();
      known.sources.extend(set.sources.iter().cloned());
      known.sources.dedup_by(|a, b| a.ssrc == b.ssrc);
      known.groups.extend(set.groups.iter().cloned());
      known.groups.dedup();

      let peers: Vec<BridgeId> = state.sessions.keys().filter(|id| **id != home).cloned().collect();
      for peer in peers {
        let mut relay_endpoint = RelayEndpoint::add(endpoint_id.clone());
        relay_endpoint.sources = set.sources.iter().map(wire_source).collect();
        relay_endpoint.source_groups = set.groups.iter().map(wire_group).collect();
        let relay = WireRelay::update(home.0.clone()).add_endpoint(relay_endpoint);
        let request = ConferenceModify::new()
          .with_meeting_id(self.meeting_id.clone())
          .add_relay(relay);
        if self.send(&peer, request).await.is_err() {
          self.teardown_session(&mut state, &home).await;
          let orphaned: Vec<String> = state
            .endpoint_bridge
            .iter()
            .filter(|(_, b)| **b == home)
            .map(|(id, _)| id.clone())
            .collect();
          for id in &orphaned {
            state.endpoint_bridge.remove(id);
            state.endpoints.remove(id);
            state.endpoint_sources.remove(id);
          }
          migrated.extend(orphaned);
          break;
        }
        if let Some(peer_session) = state.sessions.get_mut(&peer) {
          if let Some(relay) = peer_session.relays.get_mut(&home) {
            relay.endpoints.insert(endpoint_id.clone());
          }
        }
      }
    }

    for (endpoint_id, set) in removed {
      if let Some(known) = state.endpoint_sources.get_mut(endpoint_id) {
        known.sources.retain(|s| !set.sources.iter().any(|r| r.ssrc == s.ssrc));
        known.groups.retain(|g| !set.groups.contains(g));
      }

      let Some(home) = state.endpoint_bridge.get(endpoint_id).cloned() else { continue };
      let peers: Vec<BridgeId> = state.sessions.keys().filter(|id| **id != home).cloned().collect();
      for peer in peers {
        let relay = WireRelay::update(home.0.clone()).add_endpoint(RelayEndpoint::remove(endpoint_id.clone()));
        let request = ConferenceModify::new()
          .with_meeting_id(self.meeting_id.clone())
          .add_relay(relay);
        let _ = self.send(&peer, request).await;
        if let Some(peer_session) = state.sessions.get_mut(&peer) {
          if let Some(relay) = peer_session.relays.get_mut(&home) {
            relay.endpoints.remove(endpoint_id);
          }
        }
      }
    }

    migrated
  }

  /// Called when the bridge registry reports `bridge` as non-operational:
  /// returns the endpoints that were on it so the conference can reinvite
  /// them elsewhere, and drops all local state for that bridge (it is
  /// assumed unreachable, so no expire/teardown IQs are sent).
  pub async fn bridge_removed(&self, bridge: &BridgeId) -> Vec<String> {
    let mut state = self.state.lock().await;
    let Some(session) = state.sessions.remove(bridge) else {
      return Vec::new();
    };
    let orphaned: Vec<String> = session.endpoints.into_iter().collect();
    for id in &orphaned {
      state.endpoint_bridge.remove(id);
      state.endpoints.remove(id);
      state.endpoint_sources.remove(id);
    }
    for (_, peer_session) in state.sessions.iter_mut() {
      peer_session.relays.remove(bridge);
    }
    orphaned
  }

  pub async fn bridge_for(&self, endpoint_id: &str) -> Option<BridgeId> {
    self.state.lock().await.endpoint_bridge.get(endpoint_id).cloned()
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use tokio::sync::Mutex as TokioMutex;

  use super::*;
  use crate::bridge::{LoadReport, RegionBasedStrategy, RegionGroups};

  #[derive(Debug, Default)]
  struct FakeBridge {
    requests: TokioMutex<Vec<ConferenceModify>>,
  }

  #[async_trait]
  impl ColibriTransport for FakeBridge {
    async fn send(
      &self,
      _bridge: &BridgeId,
      request: ConferenceModify,
      _timeout: Duration,
    ) -> Result<ConferenceModify, ColibriTransportError> {
      let mut response = request.clone();
      for endpoint in &mut response.endpoints {
        if endpoint.create == jicofo_xmpp_parsers::colibri2::Flag::True {
          endpoint.transport = Some(IceUdpTransport::new());
        }
      }
      for relay in &mut response.relays {
        if relay.create == jicofo_xmpp_parsers::colibri2::Flag::True {
          relay.transport = Some(IceUdpTransport::new());
        }
      }
      self.requests.lock().await.push(request);
      Ok(response)
    }
  }

  fn registry_with(bridges: &[(&str, &str, f64)]) -> Arc<BridgeRegistry> {
    let registry = Arc::new(BridgeRegistry::new());
    for (id, region, stress) in bridges {
      registry.add_or_update(
        *id,
        LoadReport { region: (*region).to_owned(), version: "v1".to_owned(), stress: *stress, participants: 0 },
      );
    }
    registry
  }

  fn manager(registry: Arc<BridgeRegistry>) -> ColibriSessionManager {
    ColibriSessionManager::new(
      "meeting-1",
      Arc::new(FakeBridge::default()),
      Arc::new(RegionBasedStrategy::new(RegionGroups::default(), 100)),
      registry,
      Duration::from_secs(1),
    )
  }

  fn manager_with_bridge(registry: Arc<BridgeRegistry>) -> (ColibriSessionManager, Arc<FakeBridge>) {
    let bridge = Arc::new(FakeBridge::default());
    let manager = ColibriSessionManager::new(
      "meeting-1",
      bridge.clone(),
      Arc::new(RegionBasedStrategy::new(RegionGroups::default(), 100)),
      registry,
      Duration::from_secs(1),
    );
    (manager, bridge)
  }

  #[tokio::test]
  async fn allocate_picks_a_bridge_and_returns_transport() {
    let registry = registry_with(&[("b1", "eu", 0.0)]);
    let manager = manager(registry);
    let allocation = manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap();
    assert_eq!(allocation.bridge, BridgeId::from("b1"));
    assert!(allocation.transport.is_some());
  }

  #[tokio::test]
  async fn duplicate_allocation_is_rejected() {
    let registry = registry_with(&[("b1", "eu", 0.0)]);
    let manager = manager(registry);
    manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap();
    let err = manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap_err();
    assert_eq!(err, ColibriError::ParticipantAlreadyInvited);
  }

  #[tokio::test]
  async fn allocate_then_expire_round_trips_to_empty_state() {
    let registry = registry_with(&[("b1", "eu", 0.0)]);
    let manager = manager(registry);
    manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap();
    manager.expire("alice").await;
    assert!(manager.bridge_for("alice").await.is_none());
  }

  #[tokio::test]
  async fn second_bridge_gets_meshed_with_relays() {
    let registry = registry_with(&[("b1", "a", 0.0), ("b2", "b", 0.0)]);
    let manager = manager(registry);
    manager.allocate("alice", (false, false), Some("a"), None).await.unwrap();
    let allocation = manager.allocate("bob", (false, false), Some("b"), None).await.unwrap();
    assert_eq!(allocation.bridge, BridgeId::from("b2"));

    let state = manager.state.lock().await;
    assert!(state.sessions[&BridgeId::from("b1")].relays.contains_key(&BridgeId::from("b2")));
    assert!(state.sessions[&BridgeId::from("b2")].relays.contains_key(&BridgeId::from("b1")));
  }

  #[tokio::test]
  async fn no_bridge_satisfies_constraint_is_unavailable() {
    let registry = registry_with(&[("b1", "eu", 0.0)]);
    let manager = manager(registry);
    let err = manager.allocate("alice", (false, false), Some("eu"), Some("v2")).await.unwrap_err();
    assert_eq!(err, ColibriError::BridgeUnavailable);
  }

  #[tokio::test]
  async fn unpinned_allocation_is_constrained_to_the_conference_s_existing_version() {
    let registry = Arc::new(BridgeRegistry::new());
    registry.add_or_update(
      "b1",
      LoadReport { region: "eu".to_owned(), version: "v1".to_owned(), stress: 0.0, participants: 0 },
    );
    registry.add_or_update(
      "b2",
      LoadReport { region: "eu".to_owned(), version: "v2".to_owned(), stress: 0.0, participants: 0 },
    );
    let manager = manager(registry);

    manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap();
    // Without an explicit pin, the second participant must still land on the
    // conference's existing bridge version (I7), never the mismatched one,
    // even though both are otherwise equally good region matches.
    let allocation = manager.allocate("bob", (false, false), Some("eu"), None).await.unwrap();
    assert_eq!(allocation.bridge, BridgeId::from("b1"));
  }

  #[tokio::test]
  async fn propagate_source_diff_carries_sources_to_a_sibling_meshed_afterward() {
    let registry = registry_with(&[("b1", "a", 0.0)]);
    let (manager, bridge) = manager_with_bridge(registry.clone());
    manager.allocate("alice", (false, false), Some("a"), None).await.unwrap();

    let mut added = HashMap::new();
    added.insert(
      "alice".to_owned(),
      EndpointSourceSet { sources: vec![Source { ssrc: 1, media_type: MediaType::Audio, owner: "alice".to_owned(), name: None, video_type: None, muted: false }], groups: vec![] },
    );
    manager.propagate_source_diff(&added, &HashMap::new()).await;

    registry.add_or_update("b2", LoadReport { region: "b".to_owned(), version: "v1".to_owned(), stress: 0.0, participants: 0 });
    manager.allocate("bob", (false, false), Some("b"), None).await.unwrap();

    let requests = bridge.requests.lock().await;
    let relay_to_sibling = requests
      .iter()
      .flat_map(|r| r.relays.iter())
      .find(|r| r.id == "b1")
      .expect("b2 should have requested a relay to b1");
    let alice_endpoint = relay_to_sibling
      .endpoints
      .iter()
      .find(|e| e.id == "alice")
      .expect("relay to b1 should carry alice as a pre-existing endpoint");
    assert_eq!(alice_endpoint.sources.len(), 1);
  }

  #[tokio::test]
  async fn bridge_removed_reports_orphaned_endpoints() {
    let registry = registry_with(&[("b1", "eu", 0.0)]);
    let manager = manager(registry);
    manager.allocate("alice", (false, false), Some("eu"), None).await.unwrap();
    let orphaned = manager.bridge_removed(&BridgeId::from("b1")).await;
    assert_eq!(orphaned, vec!["alice".to_owned()]);
    assert!(manager.bridge_for("alice").await.is_none());
  }
}
