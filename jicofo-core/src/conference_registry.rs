//! Process-wide index from room identifier to [`Conference`] (§4.8):
//! creates conferences on demand with per-room mutual exclusion, destroys
//! them when their writer task exits, and tracks bridge-version pins.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tracing::info;
use xmpp_parsers::BareJid;

use crate::{
  bridge::{BridgeRegistry, BridgeSelectionStrategy},
  clock::Clock,
  conference::{Conference, ConferenceDeps},
  config::OwnershipPolicy,
  participant::OfferOptions,
  source_graph::SourceGraphLimits,
  util::generate_id,
  xmpp::connection::Connection,
};

/// Version affinity for a room (§3's `PinnedConference`): auto-expires, and
/// is consulted by bridge selection ahead of a fresh allocation's own
/// version constraint.
#[derive(Debug, Clone)]
struct PinnedConference {
  version: String,
  deadline: std::time::Instant,
}

/// The pin/unpin facility of §4.8, factored out of [`ConferenceRegistry`] so
/// an `Arc<PinRegistry>` can be handed to every [`Conference`] it spawns:
/// each conference consults its own room's pin on every allocation (I7),
/// without holding a reference back to the registry that owns it (§9's
/// "break cyclic references" rule).
#[derive(Debug)]
pub struct PinRegistry {
  clock: Arc<dyn Clock>,
  pins: DashMap<BareJid, PinnedConference>,
}

impl PinRegistry {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self { clock, pins: DashMap::new() }
  }

  /// Forces `room` to `version` for `duration`; a later `version_for_room`
  /// call returns `None` once `duration` has elapsed.
  pub fn pin(&self, room: BareJid, version: impl Into<String>, duration: Duration) {
    self.pins.insert(room, PinnedConference { version: version.into(), deadline: self.clock.now() + duration });
  }

  pub fn unpin(&self, room: &BareJid) {
    self.pins.remove(room);
  }

  /// `None` if unpinned or the pin has expired (an expired pin is also
  /// pruned as a side effect, so it does not linger until the next sweep).
  pub fn version_for_room(&self, room: &BareJid) -> Option<String> {
    let now = self.clock.now();
    let live_version = match self.pins.get(room) {
      Some(pin) if pin.deadline > now => Some(pin.version.clone()),
      _ => None,
    };
    if live_version.is_none() {
      self.pins.remove(room);
    }
    live_version
  }

  fn sweep_expired_pins(&self) {
    let now = self.clock.now();
    self.pins.retain(|_, pin| pin.deadline > now);
  }
}

/// Everything a freshly created [`Conference`] needs that does not vary
/// per-room; cloned into each [`Conference::spawn`] call alongside a fresh
/// room id and meeting id.
#[derive(Clone)]
pub struct ConferenceRegistryDeps {
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
}

pub struct ConferenceRegistry {
  deps: ConferenceRegistryDeps,
  conferences: DashMap<BareJid, Conference>,
  pins: Arc<PinRegistry>,
  destroyed_tx: tokio::sync::mpsc::UnboundedSender<BareJid>,
}

impl ConferenceRegistry {
  /// Spawns the background sweep that reaps conferences whose writer task
  /// has exited (e.g. past its empty grace period, or a fatal disconnect)
  /// and expires pins past their deadline.
  pub fn new(deps: ConferenceRegistryDeps, pin_sweep_interval: Duration) -> Arc<Self> {
    let (destroyed_tx, mut destroyed_rx) = tokio::sync::mpsc::unbounded_channel();
    let pins = Arc::new(PinRegistry::new(deps.clock.clone()));
    let registry = Arc::new(Self {
      deps,
      conferences: DashMap::new(),
      pins,
      destroyed_tx,
    });

    let reaper = registry.clone();
    tokio::spawn(async move {
      while let Some(room) = destroyed_rx.recv().await {
        if reaper.conferences.remove(&room).is_some() {
          info!("conference {} destroyed, removed from registry", room);
        }
      }
    });

    let sweeper = registry.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(pin_sweep_interval);
      loop {
        ticker.tick().await;
        sweeper.pins.sweep_expired_pins();
      }
    });

    registry
  }

  pub fn get(&self, room: &BareJid) -> Option<Conference> {
    self.conferences.get(room).map(|entry| entry.value().clone())
  }

  /// Creates the conference on first request for `room`; concurrent callers
  /// racing on the same room observe the same single creation, since
  /// [`DashMap::entry`] holds the shard lock for the room's bucket across
  /// the whole `or_insert_with`.
  pub fn get_or_create(&self, room: BareJid) -> Conference {
    self
      .conferences
      .entry(room.clone())
      .or_insert_with(|| {
        info!("creating conference for {}", room);
        let meeting_id = generate_id();
        Conference::spawn(
          ConferenceDeps {
            connection: self.deps.connection.clone(),
            brewery: self.deps.brewery.clone(),
            bridge_registry: self.deps.bridge_registry.clone(),
            strategy: self.deps.strategy.clone(),
            clock: self.deps.clock.clone(),
            offer_options: self.deps.offer_options.clone(),
            ownership_policy: self.deps.ownership_policy,
            iq_timeout: self.deps.iq_timeout,
            grace_period: self.deps.grace_period,
            max_restarts_per_window: self.deps.max_restarts_per_window,
            restart_window: self.deps.restart_window,
            source_graph_limits: self.deps.source_graph_limits,
            pins: self.pins.clone(),
          },
          room,
          meeting_id,
          self.destroyed_tx.clone(),
        )
      })
      .value()
      .clone()
  }

  /// Tears the conference down (if present) and removes it immediately,
  /// rather than waiting for the writer task to notice it is empty.
  pub async fn destroy(&self, room: &BareJid) {
    if let Some((_, conference)) = self.conferences.remove(room) {
      conference.shutdown().await;
    }
  }

  pub fn len(&self) -> usize {
    self.conferences.len()
  }

  pub fn is_empty(&self) -> bool {
    self.conferences.is_empty()
  }

  /// Forces `room` to `version` for `duration`; a later `version_for_room`
  /// call returns `None` once `duration` has elapsed.
  pub fn pin(&self, room: BareJid, version: impl Into<String>, duration: Duration) {
    self.pins.pin(room, version, duration);
  }

  pub fn unpin(&self, room: &BareJid) {
    self.pins.unpin(room);
  }

  /// `None` if unpinned or the pin has expired.
  pub fn version_for_room(&self, room: &BareJid) -> Option<String> {
    self.pins.version_for_room(room)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bridge::{BridgeRegistry, RegionBasedStrategy},
    clock::TestClock,
  };

  fn test_deps(clock: Arc<dyn Clock>) -> ConferenceRegistryDeps {
    ConferenceRegistryDeps {
      connection: Connection::for_test(tokio::sync::mpsc::channel(8).0),
      brewery: "jvbbrewery.example.com".parse().unwrap(),
      bridge_registry: Arc::new(BridgeRegistry::new()),
      strategy: Arc::new(RegionBasedStrategy::default()),
      clock,
      offer_options: OfferOptions::default(),
      ownership_policy: OwnershipPolicy::FirstMemberOwner,
      iq_timeout: Duration::from_secs(1),
      grace_period: Duration::from_secs(1),
      max_restarts_per_window: 3,
      restart_window: Duration::from_secs(60),
      source_graph_limits: SourceGraphLimits::default(),
    }
  }

  #[tokio::test]
  async fn pin_expires_after_clock_advance() {
    let clock = Arc::new(TestClock::new());
    let registry = ConferenceRegistry::new(test_deps(clock.clone()), Duration::from_secs(3600));
    let room: BareJid = "room@conference.example.com".parse().unwrap();

    registry.pin(room.clone(), "v2", Duration::from_secs(600));
    assert_eq!(registry.version_for_room(&room), Some("v2".to_owned()));

    clock.advance(Duration::from_secs(601));
    assert_eq!(registry.version_for_room(&room), None);
  }

  #[tokio::test]
  async fn unpin_clears_the_affinity_immediately() {
    let clock = Arc::new(TestClock::new());
    let registry = ConferenceRegistry::new(test_deps(clock), Duration::from_secs(3600));
    let room: BareJid = "room@conference.example.com".parse().unwrap();

    registry.pin(room.clone(), "v2", Duration::from_secs(600));
    registry.unpin(&room);
    assert_eq!(registry.version_for_room(&room), None);
  }

  #[tokio::test]
  async fn get_or_create_returns_the_same_conference_for_the_same_room() {
    let clock = Arc::new(TestClock::new());
    let registry = ConferenceRegistry::new(test_deps(clock), Duration::from_secs(3600));
    let room: BareJid = "room@conference.example.com".parse().unwrap();

    let a = registry.get_or_create(room.clone());
    let b = registry.get_or_create(room.clone());
    assert_eq!(a.meeting_id(), b.meeting_id());
    assert_eq!(registry.len(), 1);
  }
}
