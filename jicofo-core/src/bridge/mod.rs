//! Set of known bridges with live load, region, version and operational
//! state (§4.2), and the pure selection policy over that set (§4.3).

pub mod health_check;
pub mod presence;
pub mod registry;
pub mod selection;

use std::time::Instant;

pub use presence::BridgePresenceWatcher;
pub use registry::{BridgeEvent, BridgeRegistry};
pub use selection::{BridgeSelectionStrategy, ExternalStrategy, RegionBasedStrategy};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(pub String);

impl std::fmt::Display for BridgeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for BridgeId {
  fn from(s: &str) -> Self {
    BridgeId(s.to_owned())
  }
}

impl From<String> for BridgeId {
  fn from(s: String) -> Self {
    BridgeId(s)
  }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
  pub region: String,
  pub version: String,
  /// Reported stress, in `[0.0, 1.0]`; higher is more loaded.
  pub stress: f64,
  pub participants: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthResult {
  Passed,
  Failed,
  TimedOut,
}

#[derive(Debug, Clone)]
pub struct Bridge {
  pub id: BridgeId,
  pub region: String,
  pub version: String,
  pub stress: f64,
  pub participants: u32,
  pub operational: bool,
  pub graceful_shutdown: bool,
  pub last_health_result: Option<HealthResult>,
  pub last_failure: Option<Instant>,
}

impl Bridge {
  fn new(id: BridgeId, report: LoadReport) -> Self {
    Self {
      id,
      region: report.region,
      version: report.version,
      stress: report.stress,
      participants: report.participants,
      operational: true,
      graceful_shutdown: false,
      last_health_result: None,
      last_failure: None,
    }
  }

  fn apply(&mut self, report: LoadReport) {
    self.region = report.region;
    self.version = report.version;
    self.stress = report.stress;
    self.participants = report.participants;
  }
}
