//! Aggregate root for one room (§4.7). A `Conference` handle is cheap to
//! clone (a room id, a meeting id, and an mpsc sender); all of its mutable
//! state -- the source graph, the participants map, the Colibri session
//! manager, the role manager -- is owned by a single task (the "writer")
//! that drains a command queue, so every mutation to one conference
//! observes a total order. The handle doubles as the [`StanzaFilter`]
//! registered for this room's presence and Jingle traffic; `filter`/`take`
//! only decode the envelope and forward it onto the queue, all
//! interpretation happens on the writer.

use std::{
  collections::HashMap,
  sync::Arc,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jicofo_xmpp_parsers::jingle::{Action, Jingle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use xmpp_parsers::{
  disco::{DiscoInfoQuery, DiscoInfoResult, Feature},
  iq::{Iq, IqType},
  muc::{
    user::{Affiliation, MucUser, Status as MucStatus},
    Muc,
  },
  presence::{Presence, Type as PresenceType},
  stanza_error::{DefinedCondition, ErrorType, StanzaError},
  BareJid, FullJid, Jid,
};

use crate::{
  bridge::{BridgeEvent, BridgeId, BridgeRegistry, BridgeSelectionStrategy},
  clock::Clock,
  colibri::{ColibriSessionManager, XmppColibriTransport},
  config::OwnershipPolicy,
  conference_registry::PinRegistry,
  error::FocusError,
  jingle::JingleSession,
  participant::{self, ChangeKind, OfferOptions, Participant},
  source_graph::{EndpointSourceSet, MediaType, SourceGraph, SourceGraphLimits},
  stanza_filter::StanzaFilter,
  xmpp::connection::Connection,
};

const FOCUS_FEATURES: &[&str] = &[
  "http://jitsi.org/protocol/focus",
  "urn:xmpp:jingle:1",
  "urn:xmpp:jingle:apps:rtp:1",
  "urn:xmpp:jingle:transports:ice-udp:1",
];

/// Shared dependencies every conference in the process is built from; owned
/// by the [`crate::conference_registry::ConferenceRegistry`] and cloned
/// (cheaply -- everything here is already an `Arc` or a handle) into each
/// [`Conference::spawn`] call.
#[derive(Clone)]
pub struct ConferenceDeps {
  pub connection: Connection,
  pub brewery: BareJid,
  pub bridge_registry: Arc<BridgeRegistry>,
  pub strategy: Arc<dyn BridgeSelectionStrategy>,
  pub clock: Arc<dyn Clock>,
  pub offer_options: OfferOptions,
  pub ownership_policy: OwnershipPolicy,
  pub iq_timeout: Duration,
  pub grace_period: Duration,
  pub max_restarts_per_window: usize,
  pub restart_window: Duration,
  pub source_graph_limits: SourceGraphLimits,
  pub pins: Arc<PinRegistry>,
}

/// Grants ownership per the configured policy and answers `mute`'s
/// authorization check. Either "first non-bot occupant" or "every
/// authenticated user" becomes an owner; if the sole owner under the
/// first-occupant policy leaves, the next non-bot joiner is granted
/// ownership in their place.
#[derive(Debug, Default)]
struct RoleManager {
  policy: OwnershipPolicy,
  owners: std::collections::HashSet<String>,
  first_granted: bool,
}

impl RoleManager {
  fn new(policy: OwnershipPolicy) -> Self {
    Self { policy, owners: Default::default(), first_granted: false }
  }

  fn on_member_joined(&mut self, endpoint_id: &str, authenticated: bool, bot: bool) {
    if bot {
      return;
    }
    match self.policy {
      OwnershipPolicy::AllAuthenticatedUsers => {
        if authenticated {
          self.owners.insert(endpoint_id.to_owned());
        }
      },
      OwnershipPolicy::FirstMemberOwner => {
        if !self.first_granted {
          self.owners.insert(endpoint_id.to_owned());
          self.first_granted = true;
        }
      },
    }
  }

  fn on_member_left(&mut self, endpoint_id: &str) {
    self.owners.remove(endpoint_id);
    if self.policy == OwnershipPolicy::FirstMemberOwner && self.owners.is_empty() {
      self.first_granted = false;
    }
  }

  fn is_owner(&self, endpoint_id: &str) -> bool {
    self.owners.contains(endpoint_id)
  }
}

/// Actor-private: whether `mute`'s actor may flip `target`'s mute state.
/// Self-(un)mute is always allowed; muting someone else requires ownership;
/// unmuting someone else is never allowed.
fn check_mute_allowed(roles: &RoleManager, actor: &str, target: &str, muted: bool) -> Result<(), FocusError> {
  if actor == target {
    return Ok(());
  }
  if !muted {
    return Err(FocusError::NotAllowed);
  }
  if !roles.is_owner(actor) {
    return Err(FocusError::NotAllowed);
  }
  Ok(())
}

enum Command {
  Presence(Presence),
  Iq(Iq),
  InviteReady {
    endpoint_id: String,
    outcome: InviteOutcome,
  },
  Mute {
    actor: String,
    target: String,
    media: MediaType,
    muted: bool,
    reply: oneshot::Sender<Result<(), FocusError>>,
  },
  BridgeRemoved(BridgeId),
  Shutdown(oneshot::Sender<()>),
}

struct InviteOutcome {
  features: std::collections::HashSet<String>,
  allocation: Result<crate::colibri::ColibriAllocation, crate::colibri::ColibriError>,
}

/// Handle to one room's conference. Cloning is cheap; every clone forwards
/// onto the same writer task.
#[derive(Clone)]
pub struct Conference {
  room: BareJid,
  meeting_id: String,
  cmd_tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Conference {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Conference").field("room", &self.room).field("meeting_id", &self.meeting_id).finish()
  }
}

impl Conference {
  pub fn room(&self) -> &BareJid {
    &self.room
  }

  pub fn meeting_id(&self) -> &str {
    &self.meeting_id
  }

  /// Spawns the writer task and the bridge-removal listener, registers this
  /// handle as a stanza filter on the shared connection, and enqueues the
  /// MUC join. Returns immediately; joining happens on the writer.
  pub fn spawn(
    deps: ConferenceDeps,
    room: BareJid,
    meeting_id: String,
    destroyed_tx: mpsc::UnboundedSender<BareJid>,
  ) -> Conference {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    let transport = Arc::new(XmppColibriTransport::new(deps.connection.clone(), deps.brewery.clone()));
    let colibri = Arc::new(ColibriSessionManager::new(
      meeting_id.clone(),
      transport,
      deps.strategy.clone(),
      deps.bridge_registry.clone(),
      deps.iq_timeout,
    ));

    let actor = Actor {
      room: room.clone(),
      connection: deps.connection.clone(),
      focus_jid: None,
      source_graph: SourceGraph::new(deps.source_graph_limits),
      participants: HashMap::new(),
      colibri,
      roles: RoleManager::new(deps.ownership_policy),
      offer_options: deps.offer_options,
      clock: deps.clock,
      iq_timeout: deps.iq_timeout,
      grace_period: deps.grace_period,
      max_restarts_per_window: deps.max_restarts_per_window,
      restart_window: deps.restart_window,
      empty_since: None,
      destroyed_tx,
      cmd_tx: cmd_tx.clone(),
      pins: deps.pins,
    };

    let handle = Conference { room: room.clone(), meeting_id, cmd_tx: cmd_tx.clone() };

    let mut bridge_events = deps.bridge_registry.subscribe();
    let forward_tx = cmd_tx.clone();
    tokio::spawn(async move {
      while let Ok(event) = bridge_events.recv().await {
        if let BridgeEvent::Removed(id) = event {
          if forward_tx.send(Command::BridgeRemoved(id)).await.is_err() {
            break;
          }
        }
      }
    });

    let connection = deps.connection.clone();
    let filter_handle = handle.clone();
    tokio::spawn(async move {
      connection.add_stanza_filter(filter_handle).await;
    });

    tokio::spawn(actor.run(cmd_rx));

    handle
  }

  pub async fn request_mute(
    &self,
    actor: impl Into<String>,
    target: impl Into<String>,
    media: MediaType,
    muted: bool,
  ) -> Result<(), FocusError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = Command::Mute { actor: actor.into(), target: target.into(), media, muted, reply: reply_tx };
    if self.cmd_tx.send(cmd).await.is_err() {
      return Err(FocusError::Fatal("conference writer is gone".to_owned()));
    }
    reply_rx.await.unwrap_or(Err(FocusError::Fatal("conference writer dropped the reply".to_owned())))
  }

  pub async fn shutdown(&self) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if self.cmd_tx.send(Command::Shutdown(reply_tx)).await.is_ok() {
      let _ = reply_rx.await;
    }
  }
}

#[async_trait]
impl StanzaFilter for Conference {
  fn filter(&self, element: &xmpp_parsers::Element) -> bool {
    let Some(from) = element.attr("from").and_then(|from| from.parse::<Jid>().ok()) else {
      return false;
    };
    bare_of(&from) == self.room && (element.name() == "presence" || element.name() == "iq")
  }

  async fn take(&self, element: xmpp_parsers::Element) -> Result<()> {
    let cmd = if element.name() == "presence" {
      Command::Presence(Presence::try_from(element)?)
    }
    else {
      Command::Iq(Iq::try_from(element)?)
    };
    let _ = self.cmd_tx.send(cmd).await;
    Ok(())
  }
}

/// Owns every piece of mutable state for one conference; only this task
/// ever touches them (§5's "single-writer queue").
struct Actor {
  room: BareJid,
  connection: Connection,
  focus_jid: Option<FullJid>,
  source_graph: SourceGraph,
  participants: HashMap<String, Participant>,
  colibri: Arc<ColibriSessionManager>,
  roles: RoleManager,
  offer_options: OfferOptions,
  clock: Arc<dyn Clock>,
  iq_timeout: Duration,
  grace_period: Duration,
  max_restarts_per_window: usize,
  restart_window: Duration,
  empty_since: Option<Instant>,
  destroyed_tx: mpsc::UnboundedSender<BareJid>,
  cmd_tx: mpsc::Sender<Command>,
  pins: Arc<PinRegistry>,
}

fn occupant_jid(room: &BareJid, nick: &str) -> Result<FullJid> {
  format!("{room}/{nick}").parse::<FullJid>().context("invalid occupant jid")
}

fn bare_of(jid: &Jid) -> BareJid {
  match jid {
    Jid::Bare(bare) => bare.clone(),
    Jid::Full(full) => full.to_bare(),
  }
}

fn bot_from_presence(presence: &Presence) -> bool {
  presence.payloads.iter().any(|payload| payload.name() == "bot")
}

fn region_from_presence(presence: &Presence) -> Option<String> {
  presence.payloads.iter().find(|payload| payload.name() == "region").map(|payload| payload.text())
}

fn combine_sources(sets: impl Iterator<Item = EndpointSourceSet>) -> EndpointSourceSet {
  let mut combined = EndpointSourceSet::default();
  for set in sets {
    combined.sources.extend(set.sources);
    combined.groups.extend(set.groups);
  }
  combined
}

impl Actor {
  async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
    self.focus_jid = self.connection.jid().await;
    if let Err(e) = self.join_muc().await {
      warn!("failed to join MUC {}: {:?}", self.room, e);
      return;
    }

    let mut grace_ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
      tokio::select! {
        cmd = cmd_rx.recv() => {
          match cmd {
            Some(Command::Shutdown(reply)) => {
              self.do_shutdown().await;
              let _ = reply.send(());
              break;
            },
            Some(cmd) => self.handle(cmd).await,
            None => break,
          }
        },
        _ = grace_ticker.tick() => {
          if let Some(empty_since) = self.empty_since {
            if self.clock.now().duration_since(empty_since) >= self.grace_period {
              info!("conference {} empty past grace period, destroying", self.room);
              self.do_shutdown().await;
              break;
            }
          }
        },
      }
    }

    let _ = self.destroyed_tx.send(self.room.clone());
  }

  async fn join_muc(&self) -> Result<()> {
    let Some(focus_jid) = self.focus_jid.clone() else {
      anyhow::bail!("not connected");
    };
    let to = occupant_jid(&self.room, &focus_jid.resource)?;
    let presence = Presence::new(xmpp_parsers::presence::Type::None)
      .with_from(focus_jid)
      .with_to(to)
      .with_payloads(vec![Muc::new().into()]);
    self.connection.tx.send(presence.into()).await.context("failed to send MUC join presence")
  }

  async fn handle(&mut self, cmd: Command) {
    match cmd {
      Command::Presence(presence) => self.on_presence(presence).await,
      Command::Iq(iq) => self.on_iq(iq).await,
      Command::InviteReady { endpoint_id, outcome } => self.on_invite_ready(endpoint_id, outcome).await,
      Command::Mute { actor, target, media, muted, reply } => {
        let result = self.do_mute(&actor, &target, media, muted).await;
        let _ = reply.send(result);
      },
      Command::BridgeRemoved(bridge) => self.on_bridge_removed(bridge).await,
      Command::Shutdown(reply) => {
        self.do_shutdown().await;
        let _ = reply.send(());
      },
    }
  }

  async fn on_presence(&mut self, presence: Presence) {
    let Some(Jid::Full(from)) = presence.clone().from
    else {
      return;
    };
    let endpoint_id = from.resource.clone();

    if presence.type_ == PresenceType::Unavailable {
      self.on_member_left(&endpoint_id).await;
      return;
    }

    let Some(payload) = presence.payloads.iter().find(|p| p.is("x", xmpp_parsers::ns::MUC_USER))
    else {
      return;
    };
    let Ok(muc_user) = MucUser::try_from(payload.clone())
    else {
      return;
    };
    if muc_user.status.contains(&MucStatus::SelfPresence) {
      debug!("focus joined MUC {}", self.room);
      return;
    }
    if self.participants.contains_key(&endpoint_id) {
      return;
    }

    let authenticated =
      muc_user.items.first().map(|item| item.affiliation != Affiliation::None).unwrap_or(false);
    let bot = bot_from_presence(&presence);
    let region = region_from_presence(&presence);
    self.on_member_joined(endpoint_id, from, authenticated, bot, region).await;
  }

  async fn on_member_joined(
    &mut self,
    endpoint_id: String,
    peer: FullJid,
    authenticated: bool,
    bot: bool,
    region: Option<String>,
  ) {
    self.empty_since = None;
    self.roles.on_member_joined(&endpoint_id, authenticated, bot);
    if bot {
      debug!("not inviting bot occupant {}", endpoint_id);
      return;
    }

    let Some(focus_jid) = self.focus_jid.clone()
    else {
      return;
    };
    let jingle = JingleSession::new(Jid::Full(focus_jid), Jid::Full(peer.clone()), endpoint_id.clone(), self.connection.clone());
    self.participants.insert(endpoint_id.clone(), Participant::new(endpoint_id.clone(), jingle, self.clock.clone()));

    let connection = self.connection.clone();
    let colibri = self.colibri.clone();
    let iq_timeout = self.iq_timeout;
    let cmd_tx = self.cmd_tx.clone();
    let version_constraint = self.pins.version_for_room(&self.room);
    tokio::spawn(async move {
      let features = participant::discover_features(&connection, Jid::Full(peer), iq_timeout).await;
      let allocation = colibri.allocate(&endpoint_id, (false, false), region.as_deref(), version_constraint.as_deref()).await;
      let _ = cmd_tx.send(Command::InviteReady { endpoint_id, outcome: InviteOutcome { features, allocation } }).await;
    });
  }

  async fn on_invite_ready(&mut self, endpoint_id: String, outcome: InviteOutcome) {
    let allocation = match outcome.allocation {
      Ok(allocation) => allocation,
      Err(e) => {
        warn!("allocation failed for {}: {:?}", endpoint_id, e);
        self.participants.remove(&endpoint_id);
        return;
      },
    };
    let Some(participant) = self.participants.get_mut(&endpoint_id)
    else {
      return;
    };
    participant.features = outcome.features;
    participant.assigned_bridge = Some(allocation.bridge);

    let Some(transport) = allocation.transport
    else {
      warn!("bridge did not return a transport for {}", endpoint_id);
      self.participants.remove(&endpoint_id);
      return;
    };

    let other_sources = combine_sources(
      self
        .source_graph
        .snapshot()
        .into_iter()
        .filter(|(id, _)| id.as_str() != endpoint_id.as_str())
        .map(|(_, set)| set),
    );
    let contents =
      participant::build_offer(&self.offer_options, &participant.features, transport, &allocation.feedback_sources, &other_sources);

    if let Err(e) = participant.jingle.initiate(&contents).await {
      warn!("failed to send session-initiate to {}: {:?}", endpoint_id, e);
      self.participants.remove(&endpoint_id);
    }
  }

  async fn on_member_left(&mut self, endpoint_id: &str) {
    self.roles.on_member_left(endpoint_id);
    if self.participants.remove(endpoint_id).is_none() {
      return;
    }
    self.colibri.expire(endpoint_id).await;
    let removed = self.source_graph.remove_endpoint(endpoint_id);
    if !removed.is_empty() {
      self.fan_out_source_remove(endpoint_id, removed).await;
    }
    if self.participants.is_empty() {
      self.empty_since = Some(self.clock.now());
    }
  }

  async fn on_iq(&mut self, iq: Iq) {
    let from = iq.from.clone();
    let id = iq.id.clone();
    match iq.payload {
      IqType::Get(element) => {
        if DiscoInfoQuery::try_from(element).is_ok() {
          self.answer_disco(id, from).await;
        }
      },
      IqType::Set(element) => {
        let Some(Jid::Full(from)) = from.clone()
        else {
          return;
        };
        match Jingle::try_from(element) {
          Ok(jingle) => self.on_jingle(from, id, jingle).await,
          Err(e) => debug!("IQ did not parse as Jingle: {:?}", e),
        }
      },
      _ => {},
    }
  }

  async fn answer_disco(&self, id: String, to: Option<Jid>) {
    let Some(to) = to
    else {
      return;
    };
    let Some(focus_jid) = self.focus_jid.clone()
    else {
      return;
    };
    let result = DiscoInfoResult {
      node: None,
      identities: vec![],
      features: FOCUS_FEATURES.iter().map(|f| Feature::new(*f)).collect(),
      extensions: vec![],
    };
    let iq = Iq::from_result(id, Some(result)).with_from(Jid::Full(focus_jid)).with_to(to);
    let _ = self.connection.tx.send(iq.into()).await;
  }

  async fn ack(&self, id: String, to: FullJid) {
    let Some(focus_jid) = self.focus_jid.clone()
    else {
      return;
    };
    let iq = Iq::empty_result(Jid::Full(to), id).with_from(Jid::Full(focus_jid));
    let _ = self.connection.tx.send(iq.into()).await;
  }

  async fn error(&self, id: String, to: FullJid, condition: DefinedCondition, text: &str) {
    let Some(focus_jid) = self.focus_jid.clone()
    else {
      return;
    };
    let stanza_error = StanzaError::new(ErrorType::Modify, condition, "en", text);
    let iq = Iq::from_error(id, stanza_error).with_from(Jid::Full(focus_jid)).with_to(Jid::Full(to));
    let _ = self.connection.tx.send(iq.into()).await;
  }

  async fn on_jingle(&mut self, from: FullJid, id: String, jingle: Jingle) {
    let endpoint_id = from.resource.clone();

    match jingle.action.clone() {
      Action::SessionAccept => {
        self.ack(id, from).await;
        self.on_session_accept(&endpoint_id, &jingle).await;
      },
      Action::SourceAdd => {
        match self.on_source_change(&endpoint_id, &jingle, ChangeKind::Add).await {
          Ok(()) => self.ack(id, from).await,
          Err(e) => self.error(id, from, DefinedCondition::BadRequest, &e.to_string()).await,
        }
      },
      Action::SourceRemove => {
        match self.on_source_change(&endpoint_id, &jingle, ChangeKind::Remove).await {
          Ok(()) => self.ack(id, from).await,
          Err(e) => self.error(id, from, DefinedCondition::BadRequest, &e.to_string()).await,
        }
      },
      Action::TransportAccept => {
        self.ack(id, from).await;
        self.on_restart_accept(&endpoint_id, &jingle).await;
      },
      Action::SessionTerminate => {
        self.ack(id, from).await;
        self.on_member_left(&endpoint_id).await;
      },
      other => debug!("ignoring Jingle action {:?} from {}", other, endpoint_id),
    }
  }

  async fn on_session_accept(&mut self, endpoint_id: &str, jingle: &Jingle) {
    let Some(participant) = self.participants.get_mut(endpoint_id)
    else {
      return;
    };
    let (sources, transport) = match participant.jingle.on_session_accept(jingle) {
      Ok(result) => result,
      Err(e) => {
        warn!("malformed session-accept from {}: {:?}", endpoint_id, e);
        return;
      },
    };

    match self.source_graph.try_add(endpoint_id, sources.clone()) {
      Ok(accepted) => {
        if let Some(participant) = self.participants.get_mut(endpoint_id) {
          let _ = participant.jingle.mark_active();
        }
        self.colibri.update_participant(endpoint_id, transport, Some(&accepted), None).await.ok();
        self.fan_out_source_add(endpoint_id, accepted.clone()).await;

        let mut added = HashMap::new();
        added.insert(endpoint_id.to_owned(), accepted);
        let migrated = self.colibri.propagate_source_diff(&added, &HashMap::new()).await;
        for orphan in migrated {
          self.reinvite(&orphan).await;
        }
      },
      Err(e) => warn!("source graph rejected initial sources from {}: {:?}", endpoint_id, e),
    }
  }

  async fn on_source_change(&mut self, endpoint_id: &str, jingle: &Jingle, kind: ChangeKind) -> Result<(), crate::source_graph::SourceGraphError> {
    let Some(participant) = self.participants.get(endpoint_id)
    else {
      return Ok(());
    };
    let parsed = match kind {
      ChangeKind::Add => participant.jingle.on_source_add(jingle),
      ChangeKind::Remove => participant.jingle.on_source_remove(jingle),
    };
    let Ok(parsed) = parsed
    else {
      return Ok(());
    };

    let applied = match kind {
      ChangeKind::Add => self.source_graph.try_add(endpoint_id, parsed)?,
      ChangeKind::Remove => self.source_graph.try_remove(endpoint_id, parsed),
    };
    if applied.is_empty() {
      return Ok(());
    }

    let mut added = HashMap::new();
    let mut removed = HashMap::new();
    match kind {
      ChangeKind::Add => {
        added.insert(endpoint_id.to_owned(), applied.clone());
        self.fan_out_source_add(endpoint_id, applied).await;
      },
      ChangeKind::Remove => {
        removed.insert(endpoint_id.to_owned(), applied.clone());
        self.fan_out_source_remove(endpoint_id, applied).await;
      },
    }
    let migrated = self.colibri.propagate_source_diff(&added, &removed).await;
    for orphan in migrated {
      self.reinvite(&orphan).await;
    }
    Ok(())
  }

  async fn on_restart_accept(&mut self, endpoint_id: &str, jingle: &Jingle) {
    let Some(participant) = self.participants.get_mut(endpoint_id)
    else {
      return;
    };
    let transport = match participant.jingle.on_restart_accept(jingle) {
      Ok(transport) => transport,
      Err(e) => {
        warn!("unexpected transport-accept from {}: {:?}", endpoint_id, e);
        return;
      },
    };
    self.colibri.update_participant(endpoint_id, transport, None, None).await.ok();
    self.flush_queue(endpoint_id).await;
  }

  /// Sends a (Add, sources) entry to every other active participant,
  /// holding it on the peer's own queue if that peer isn't Active yet.
  async fn fan_out_source_add(&mut self, source_endpoint: &str, sources: EndpointSourceSet) {
    let peer_ids: Vec<String> = self.participants.keys().filter(|id| id.as_str() != source_endpoint).cloned().collect();
    for peer_id in peer_ids {
      self.send_or_queue(&peer_id, ChangeKind::Add, sources.clone()).await;
    }
  }

  async fn fan_out_source_remove(&mut self, source_endpoint: &str, sources: EndpointSourceSet) {
    let peer_ids: Vec<String> = self.participants.keys().filter(|id| id.as_str() != source_endpoint).cloned().collect();
    for peer_id in peer_ids {
      self.send_or_queue(&peer_id, ChangeKind::Remove, sources.clone()).await;
    }
  }

  async fn send_or_queue(&mut self, peer_id: &str, kind: ChangeKind, sources: EndpointSourceSet) {
    let Some(peer) = self.participants.get_mut(peer_id)
    else {
      return;
    };
    if peer.jingle.state() != crate::jingle::JingleState::Active {
      peer.queue.push(kind, sources);
      return;
    }
    let result = match kind {
      ChangeKind::Add => peer.jingle.send_source_add(&sources).await,
      ChangeKind::Remove => peer.jingle.send_source_remove(&sources).await,
    };
    if let Err(e) = result {
      warn!("failed to forward source change to {}: {:?}", peer_id, e);
    }
  }

  /// Drains a participant's held source-change queue once its Jingle
  /// session returns to Active (after session-accept or an ICE restart).
  async fn flush_queue(&mut self, endpoint_id: &str) {
    let Some(participant) = self.participants.get_mut(endpoint_id)
    else {
      return;
    };
    if participant.jingle.state() != crate::jingle::JingleState::Active {
      return;
    }
    let entries = participant.queue.drain();
    for (kind, sources) in entries {
      let result = match kind {
        ChangeKind::Add => participant.jingle.send_source_add(&sources).await,
        ChangeKind::Remove => participant.jingle.send_source_remove(&sources).await,
      };
      if let Err(e) = result {
        warn!("failed to flush queued source change to {}: {:?}", endpoint_id, e);
        break;
      }
    }
  }

  async fn do_mute(&mut self, actor: &str, target: &str, media: MediaType, muted: bool) -> Result<(), FocusError> {
    check_mute_allowed(&self.roles, actor, target, muted)?;
    let Some(participant) = self.participants.get_mut(target)
    else {
      return Err(FocusError::NotAllowed);
    };

    let (audio, video) = match media {
      MediaType::Audio => (muted, participant.mute_video),
      MediaType::Video => (participant.mute_audio, muted),
    };
    self.colibri.mute(target, Some(audio), Some(video)).await?;

    if let Some(participant) = self.participants.get_mut(target) {
      participant.mute_audio = audio;
      participant.mute_video = video;
    }
    Ok(())
  }

  async fn on_bridge_removed(&mut self, bridge: BridgeId) {
    let orphaned = self.colibri.bridge_removed(&bridge).await;
    for endpoint_id in orphaned {
      self.reinvite(&endpoint_id).await;
    }
  }

  /// Re-runs the allocate+restart dance for a participant whose bridge
  /// disappeared out from under it, without tearing down its Jingle
  /// session or graph state.
  async fn reinvite(&mut self, endpoint_id: &str) {
    let Some(participant) = self.participants.get_mut(endpoint_id)
    else {
      return;
    };
    let region: Option<String> = None;
    let version_constraint = self.pins.version_for_room(&self.room);
    let allocation = self
      .colibri
      .allocate(endpoint_id, (participant.mute_audio, participant.mute_video), region.as_deref(), version_constraint.as_deref())
      .await;
    let allocation = match allocation {
      Ok(allocation) => allocation,
      Err(e) => {
        warn!("failed to re-invite {} after bridge loss: {:?}", endpoint_id, e);
        self.terminate_participant(endpoint_id, xmpp_parsers::jingle::Reason::ConnectivityError).await;
        return;
      },
    };
    let Some(transport) = allocation.transport
    else {
      self.terminate_participant(endpoint_id, xmpp_parsers::jingle::Reason::ConnectivityError).await;
      return;
    };

    let Some(participant) = self.participants.get_mut(endpoint_id)
    else {
      return;
    };
    participant.assigned_bridge = Some(allocation.bridge);
    for media in [MediaType::Audio, MediaType::Video] {
      if let Err(e) = participant.request_restart(media, transport.clone()).await {
        warn!("restart request to {} rejected: {:?}", endpoint_id, e);
      }
    }
  }

  async fn terminate_participant(&mut self, endpoint_id: &str, reason: xmpp_parsers::jingle::Reason) {
    self.roles.on_member_left(endpoint_id);
    if let Some(mut participant) = self.participants.remove(endpoint_id) {
      let _ = participant.jingle.terminate(reason).await;
    }
    self.colibri.expire(endpoint_id).await;
    self.source_graph.remove_endpoint(endpoint_id);
  }

  async fn do_shutdown(&mut self) {
    let endpoint_ids: Vec<String> = self.participants.keys().cloned().collect();
    for endpoint_id in endpoint_ids {
      self.terminate_participant(&endpoint_id, xmpp_parsers::jingle::Reason::Gone).await;
    }
    if let Some(focus_jid) = self.focus_jid.clone() {
      if let Ok(to) = occupant_jid(&self.room, &focus_jid.resource) {
        let presence =
          Presence::new(PresenceType::Unavailable).with_from(focus_jid).with_to(to);
        let _ = self.connection.tx.send(presence.into()).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_member_owner_grants_to_first_non_bot_joiner() {
    let mut roles = RoleManager::new(OwnershipPolicy::FirstMemberOwner);
    roles.on_member_joined("recorder", false, true);
    roles.on_member_joined("alice", true, false);
    roles.on_member_joined("bob", true, false);

    assert!(!roles.is_owner("recorder"));
    assert!(roles.is_owner("alice"));
    assert!(!roles.is_owner("bob"));
  }

  #[test]
  fn ownership_transfers_when_sole_owner_leaves() {
    let mut roles = RoleManager::new(OwnershipPolicy::FirstMemberOwner);
    roles.on_member_joined("alice", true, false);
    roles.on_member_left("alice");
    roles.on_member_joined("bob", true, false);

    assert!(roles.is_owner("bob"));
  }

  #[test]
  fn all_authenticated_users_policy_grants_everyone_authenticated() {
    let mut roles = RoleManager::new(OwnershipPolicy::AllAuthenticatedUsers);
    roles.on_member_joined("alice", true, false);
    roles.on_member_joined("guest", false, false);

    assert!(roles.is_owner("alice"));
    assert!(!roles.is_owner("guest"));
  }

  #[test]
  fn self_mute_is_always_allowed() {
    let roles = RoleManager::new(OwnershipPolicy::FirstMemberOwner);
    assert!(check_mute_allowed(&roles, "alice", "alice", true).is_ok());
    assert!(check_mute_allowed(&roles, "alice", "alice", false).is_ok());
  }

  #[test]
  fn unmuting_another_user_is_never_allowed() {
    let mut roles = RoleManager::new(OwnershipPolicy::FirstMemberOwner);
    roles.on_member_joined("alice", true, false);
    assert_eq!(check_mute_allowed(&roles, "alice", "bob", false), Err(FocusError::NotAllowed));
  }

  #[test]
  fn muting_another_user_requires_ownership() {
    let mut roles = RoleManager::new(OwnershipPolicy::FirstMemberOwner);
    roles.on_member_joined("alice", true, false);
    roles.on_member_joined("bob", true, false);

    assert!(check_mute_allowed(&roles, "alice", "bob", true).is_ok());
    assert_eq!(check_mute_allowed(&roles, "bob", "alice", true), Err(FocusError::NotAllowed));
  }
}
