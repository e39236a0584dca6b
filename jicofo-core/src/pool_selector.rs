//! Generic idle-member selector for the recorder (Jibri) and SIP-gateway
//! pools named in §6's dispatch IQs. Selecting a pool member is the one
//! piece of pool behavior this crate implements; everything past that
//! (actually starting a recording, bridging a SIP call) is the auxiliary
//! service's own business and out of scope here (§1 Non-goals).
//!
//! Mirrors the Bridge Selection Strategy's candidate-filter shape (idle +
//! healthy is this pool's analogue of operational + not-in-graceful-shutdown)
//! plus a per-caller cooldown: a caller that just received a selection gets
//! `None` if it asks again before `SELECT_TIMEOUT` elapses, so a slow
//! dispatch round-trip can't make the same caller double-book a second pool
//! member while the first request is still in flight.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use crate::clock::Clock;

/// One entry in a recorder or SIP-gateway pool.
#[derive(Debug, Clone)]
pub struct PoolMember {
  pub id: String,
  pub busy: bool,
  pub healthy: bool,
}

/// Default cooldown a caller must wait between successful selections,
/// matching real-world Jibri brewery deployments' pending-request timeout.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Selects an idle, healthy pool member on behalf of a caller (typically a
/// room id), enforcing [`SELECT_TIMEOUT`] between one caller's successful
/// selections.
#[derive(Debug)]
pub struct PoolSelector {
  clock: Arc<dyn Clock>,
  cooldown: Duration,
  last_selection: Mutex<HashMap<String, Instant>>,
}

impl PoolSelector {
  pub fn new(clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
    Self { clock, cooldown, last_selection: Mutex::new(HashMap::new()) }
  }

  pub fn with_default_timeout(clock: Arc<dyn Clock>) -> Self {
    Self::new(clock, SELECT_TIMEOUT)
  }

  /// Returns the first idle, healthy member in `members`, or `None` if
  /// `caller` is still within its cooldown from a prior successful
  /// selection, or if no member qualifies.
  pub fn select(&self, caller: &str, members: &[PoolMember]) -> Option<String> {
    let now = self.clock.now();
    {
      let last_selection = self.last_selection.lock().unwrap();
      if let Some(&last) = last_selection.get(caller) {
        if now.duration_since(last) < self.cooldown {
          return None;
        }
      }
    }

    let chosen = members.iter().find(|m| !m.busy && m.healthy)?.id.clone();
    self.last_selection.lock().unwrap().insert(caller.to_owned(), now);
    Some(chosen)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::TestClock;

  fn member(id: &str, busy: bool, healthy: bool) -> PoolMember {
    PoolMember { id: id.to_owned(), busy, healthy }
  }

  #[test]
  fn picks_first_idle_and_healthy_member() {
    let clock = Arc::new(TestClock::new());
    let selector = PoolSelector::with_default_timeout(clock);
    let members = vec![member("recorder-0", false, false), member("recorder-1", true, true), member("recorder-2", false, true)];

    assert_eq!(selector.select("room-a", &members), Some("recorder-2".to_owned()));
  }

  #[test]
  fn returns_none_when_no_member_qualifies() {
    let clock = Arc::new(TestClock::new());
    let selector = PoolSelector::with_default_timeout(clock);
    let members = vec![member("recorder-0", false, false), member("recorder-1", true, true)];

    assert_eq!(selector.select("room-a", &members), None);
  }

  #[test]
  fn same_caller_is_on_cooldown_until_timeout_elapses() {
    let clock = Arc::new(TestClock::new());
    let selector = PoolSelector::new(clock.clone(), Duration::from_secs(30));
    let members = vec![member("recorder-2", false, true)];

    assert_eq!(selector.select("room-a", &members), Some("recorder-2".to_owned()));
    assert_eq!(selector.select("room-a", &members), None);

    clock.advance(Duration::from_secs(30));
    assert_eq!(selector.select("room-a", &members), Some("recorder-2".to_owned()));
  }

  #[test]
  fn cooldown_is_per_caller() {
    let clock = Arc::new(TestClock::new());
    let selector = PoolSelector::new(clock, Duration::from_secs(30));
    let members = vec![member("recorder-2", false, true)];

    assert_eq!(selector.select("room-a", &members), Some("recorder-2".to_owned()));
    assert_eq!(selector.select("room-b", &members), Some("recorder-2".to_owned()));
  }
}
