use std::{
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

/// Indirection over wall-clock time so that rate limiters and expiry sweeps
/// can be driven deterministically in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
  fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// A clock that only advances when told to. `Instant` has no fixed epoch we
/// can construct directly, so this anchors to the instant it was created and
/// reports `anchor + offset`.
#[derive(Debug, Clone)]
pub struct TestClock {
  anchor: Instant,
  offset: Arc<Mutex<Duration>>,
}

impl TestClock {
  pub fn new() -> Self {
    Self {
      anchor: Instant::now(),
      offset: Arc::new(Mutex::new(Duration::ZERO)),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut offset = self.offset.lock().unwrap();
    *offset += by;
  }
}

impl Default for TestClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for TestClock {
  fn now(&self) -> Instant {
    self.anchor + *self.offset.lock().unwrap()
  }
}
