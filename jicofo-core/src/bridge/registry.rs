use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Bridge, BridgeId, HealthResult, LoadReport};

#[derive(Debug, Clone)]
pub enum BridgeEvent {
  Added(BridgeId),
  Updated(BridgeId),
  /// A bridge was marked non-operational by a `Failed` health result (not
  /// `TimedOut`); every conference using it must migrate its endpoints.
  Removed(BridgeId),
}

/// Mapping from bridge id to [`Bridge`], guarded by its own short read-write
/// boundary (a concurrent map) and a broadcast channel for subscribers.
/// Mutations never take a conference's lock, matching the "no cross-entity
/// locks" requirement of the concurrency model.
#[derive(Debug)]
pub struct BridgeRegistry {
  bridges: DashMap<BridgeId, Bridge>,
  events_tx: broadcast::Sender<BridgeEvent>,
}

impl Default for BridgeRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl BridgeRegistry {
  pub fn new() -> Self {
    let (events_tx, _) = broadcast::channel(64);
    Self {
      bridges: DashMap::new(),
      events_tx,
    }
  }

  /// Idempotent: creates the bridge on first report, otherwise merges the
  /// new load figures into the existing entry.
  pub fn add_or_update(&self, id: impl Into<BridgeId>, report: LoadReport) {
    let id = id.into();
    let is_new = !self.bridges.contains_key(&id);
    self
      .bridges
      .entry(id.clone())
      .and_modify(|b| b.apply(report.clone()))
      .or_insert_with(|| Bridge::new(id.clone(), report));

    if is_new {
      info!("bridge {} registered", id);
      let _ = self.events_tx.send(BridgeEvent::Added(id));
    }
    else {
      debug!("bridge {} load updated", id);
      let _ = self.events_tx.send(BridgeEvent::Updated(id));
    }
  }

  pub fn remove(&self, id: &BridgeId) {
    if self.bridges.remove(id).is_some() {
      info!("bridge {} withdrawn", id);
      let _ = self.events_tx.send(BridgeEvent::Removed(id.clone()));
    }
  }

  /// `Passed` marks operational; `Failed` marks non-operational and fires
  /// removal (every conference migrates off); `TimedOut` marks
  /// non-operational without firing removal, to avoid a thundering herd of
  /// migrations during a transient network partition.
  pub fn on_health(&self, id: &BridgeId, result: HealthResult) {
    let Some(mut bridge) = self.bridges.get_mut(id) else {
      warn!("health result for unknown bridge {}", id);
      return;
    };
    bridge.last_health_result = Some(result);
    match result {
      HealthResult::Passed => {
        bridge.operational = true;
      },
      HealthResult::Failed => {
        bridge.operational = false;
        bridge.last_failure = Some(std::time::Instant::now());
        drop(bridge);
        let _ = self.events_tx.send(BridgeEvent::Removed(id.clone()));
        return;
      },
      HealthResult::TimedOut => {
        bridge.operational = false;
        bridge.last_failure = Some(std::time::Instant::now());
      },
    }
  }

  pub fn set_graceful_shutdown(&self, id: &BridgeId, draining: bool) {
    if let Some(mut bridge) = self.bridges.get_mut(id) {
      bridge.graceful_shutdown = draining;
    }
  }

  pub fn snapshot(&self) -> Vec<Bridge> {
    self.bridges.iter().map(|e| e.value().clone()).collect()
  }

  pub fn get(&self, id: &BridgeId) -> Option<Bridge> {
    self.bridges.get(id).map(|e| e.value().clone())
  }

  pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
    self.events_tx.subscribe()
  }

  pub fn len(&self) -> usize {
    self.bridges.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bridges.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report(region: &str, version: &str, stress: f64) -> LoadReport {
    LoadReport {
      region: region.to_owned(),
      version: version.to_owned(),
      stress,
      participants: 0,
    }
  }

  #[test]
  fn add_or_update_is_idempotent_and_fires_events() {
    let registry = BridgeRegistry::new();
    let mut events = registry.subscribe();

    registry.add_or_update("b1", report("eu", "1.0", 0.1));
    registry.add_or_update("b1", report("eu", "1.0", 0.5));

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(&"b1".into()).unwrap().stress, 0.5);

    assert!(matches!(
      events.try_recv().unwrap(),
      BridgeEvent::Added(_)
    ));
    assert!(matches!(
      events.try_recv().unwrap(),
      BridgeEvent::Updated(_)
    ));
  }

  #[test]
  fn failed_health_marks_non_operational_and_fires_removed() {
    let registry = BridgeRegistry::new();
    let mut events = registry.subscribe();
    registry.add_or_update("b1", report("eu", "1.0", 0.1));
    events.try_recv().unwrap(); // Added

    registry.on_health(&"b1".into(), HealthResult::Failed);
    assert!(!registry.get(&"b1".into()).unwrap().operational);
    assert!(matches!(
      events.try_recv().unwrap(),
      BridgeEvent::Removed(_)
    ));
  }

  #[test]
  fn timed_out_health_marks_non_operational_without_removal_event() {
    let registry = BridgeRegistry::new();
    let mut events = registry.subscribe();
    registry.add_or_update("b1", report("eu", "1.0", 0.1));
    events.try_recv().unwrap(); // Added

    registry.on_health(&"b1".into(), HealthResult::TimedOut);
    assert!(!registry.get(&"b1".into()).unwrap().operational);
    assert!(events.try_recv().is_err(), "no removal event expected");
  }
}
