use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Bridge, BridgeId};

/// Stress at or above this threshold makes a bridge the selector's last
/// resort, ahead only of bridges that are not candidates at all.
const OVERLOADED_STRESS_THRESHOLD: f64 = 0.8;

fn is_candidate(bridge: &Bridge, version_constraint: Option<&str>) -> bool {
  bridge.operational
    && !bridge.graceful_shutdown
    && version_constraint
      .map(|v| bridge.version == v)
      .unwrap_or(true)
}

fn is_draining_candidate(bridge: &Bridge, version_constraint: Option<&str>) -> bool {
  bridge.operational
    && version_constraint
      .map(|v| bridge.version == v)
      .unwrap_or(true)
}

/// (bridge, existing conference participant count on that bridge) sort key:
/// overloaded bridges sort last, otherwise ascending stress, ties broken by
/// fewer existing participants in the conference.
fn sort_key(bridge: &Bridge, conference_bridges: &HashMap<BridgeId, u32>) -> (bool, i64, u32) {
  let overloaded = bridge.stress >= OVERLOADED_STRESS_THRESHOLD;
  // stress is f64 in [0,1]; scale so ordering by integer key is exact enough
  // for selection purposes without pulling in an Ord wrapper for f64.
  let stress_key = (bridge.stress * 1_000_000.0) as i64;
  let existing = conference_bridges.get(&bridge.id).copied().unwrap_or(0);
  (overloaded, stress_key, existing)
}

/// A pure function over (candidateList, conferenceBridges, participantRegion,
/// versionConstraint). `RegionBasedStrategy` is the bundled default; other
/// implementations (e.g. delegating to a remote oracle) are swappable behind
/// this interface, per §4.3/§9 ("polymorphism... capability interface").
#[async_trait]
pub trait BridgeSelectionStrategy: Send + Sync + std::fmt::Debug {
  async fn select(
    &self,
    candidates: &[Bridge],
    conference_bridges: &HashMap<BridgeId, u32>,
    participant_region: Option<&str>,
    version_constraint: Option<&str>,
  ) -> Option<BridgeId>;
}

/// Region-group membership: an equivalence class of regions considered
/// "near" each other for selection purposes (the default policy's step 3).
#[derive(Debug, Clone, Default)]
pub struct RegionGroups {
  region_to_group: HashMap<String, String>,
}

impl RegionGroups {
  pub fn new(region_to_group: HashMap<String, String>) -> Self {
    Self { region_to_group }
  }

  fn group_of(&self, region: &str) -> Option<&str> {
    self.region_to_group.get(region).map(String::as_str)
  }

  fn same_group(&self, a: &str, b: &str) -> bool {
    match (self.group_of(a), self.group_of(b)) {
      (Some(ga), Some(gb)) => ga == gb,
      _ => false,
    }
  }
}

/// The bundled default policy from §4.3, implemented literally top to
/// bottom, first match wins (see DESIGN.md for the tie-breaking rationale).
#[derive(Debug, Clone, Default)]
pub struct RegionBasedStrategy {
  pub region_groups: RegionGroups,
  pub max_bridge_participants: u32,
}

impl RegionBasedStrategy {
  pub fn new(region_groups: RegionGroups, max_bridge_participants: u32) -> Self {
    Self {
      region_groups,
      max_bridge_participants,
    }
  }

  fn pick(
    &self,
    candidates: &[Bridge],
    conference_bridges: &HashMap<BridgeId, u32>,
    participant_region: Option<&str>,
  ) -> Option<BridgeId> {
    let mut ranked: Vec<&Bridge> = candidates.iter().collect();
    ranked.sort_by_key(|b| sort_key(b, conference_bridges));

    // 1. A bridge already in the conference, in the participant's region,
    //    under the per-bridge participant cap.
    if let Some(region) = participant_region {
      if let Some(b) = ranked.iter().find(|b| {
        conference_bridges.contains_key(&b.id)
          && b.region == region
          && conference_bridges.get(&b.id).copied().unwrap_or(0) < self.max_bridge_participants
      }) {
        return Some(b.id.clone());
      }
    }

    // 2. Any bridge in the participant's region, lowest load first.
    if let Some(region) = participant_region {
      if let Some(b) = ranked.iter().find(|b| b.region == region) {
        return Some(b.id.clone());
      }
    }

    // 3. A bridge in the same region group as the participant.
    if let Some(region) = participant_region {
      if let Some(b) = ranked
        .iter()
        .find(|b| self.region_groups.same_group(region, &b.region))
      {
        return Some(b.id.clone());
      }
    }

    // 4. A bridge already in the conference, lowest load.
    if let Some(b) = ranked.iter().find(|b| conference_bridges.contains_key(&b.id)) {
      return Some(b.id.clone());
    }

    // 5. Any operational bridge, lowest load.
    ranked.first().map(|b| b.id.clone())
  }
}

#[async_trait]
impl BridgeSelectionStrategy for RegionBasedStrategy {
  async fn select(
    &self,
    candidates: &[Bridge],
    conference_bridges: &HashMap<BridgeId, u32>,
    participant_region: Option<&str>,
    version_constraint: Option<&str>,
  ) -> Option<BridgeId> {
    let mut eligible: Vec<Bridge> = candidates
      .iter()
      .filter(|b| is_candidate(b, version_constraint))
      .cloned()
      .collect();

    if eligible.is_empty() {
      debug!("no fully operational candidate, falling back to draining bridges");
      eligible = candidates
        .iter()
        .filter(|b| is_draining_candidate(b, version_constraint))
        .cloned()
        .collect();
    }

    if eligible.is_empty() {
      return None;
    }

    self.pick(&eligible, conference_bridges, participant_region)
  }
}

/// Delegates to a remote HTTP oracle, falling back to another strategy (the
/// region-based default, typically) if the oracle is unreachable or does not
/// answer within `timeout`.
#[derive(Debug)]
pub struct ExternalStrategy {
  client: reqwest::Client,
  endpoint: String,
  timeout: Duration,
  fallback: Box<dyn BridgeSelectionStrategy>,
}

#[derive(Debug, serde::Serialize)]
struct OracleRequest<'a> {
  candidates: Vec<&'a str>,
  conference_bridges: HashMap<String, u32>,
  participant_region: Option<&'a str>,
  version_constraint: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
struct OracleResponse {
  bridge_id: Option<String>,
}

impl ExternalStrategy {
  pub fn new(
    endpoint: impl Into<String>,
    timeout: Duration,
    fallback: Box<dyn BridgeSelectionStrategy>,
  ) -> Self {
    Self {
      client: reqwest::Client::new(),
      endpoint: endpoint.into(),
      timeout,
      fallback,
    }
  }
}

#[async_trait]
impl BridgeSelectionStrategy for ExternalStrategy {
  async fn select(
    &self,
    candidates: &[Bridge],
    conference_bridges: &HashMap<BridgeId, u32>,
    participant_region: Option<&str>,
    version_constraint: Option<&str>,
  ) -> Option<BridgeId> {
    let request = OracleRequest {
      candidates: candidates.iter().map(|b| b.id.0.as_str()).collect(),
      conference_bridges: conference_bridges
        .iter()
        .map(|(id, n)| (id.0.clone(), *n))
        .collect(),
      participant_region,
      version_constraint,
    };

    let result = tokio::time::timeout(
      self.timeout,
      self.client.post(&self.endpoint).json(&request).send(),
    )
    .await;

    match result {
      Ok(Ok(response)) => match response.json::<OracleResponse>().await {
        Ok(body) => {
          if let Some(id) = body.bridge_id {
            return Some(BridgeId(id));
          }
          warn!("selection oracle returned no bridge, falling back");
        },
        Err(e) => warn!("selection oracle returned unparseable body: {:?}", e),
      },
      Ok(Err(e)) => warn!("selection oracle request failed: {:?}", e),
      Err(_) => warn!("selection oracle timed out after {:?}", self.timeout),
    }

    self
      .fallback
      .select(candidates, conference_bridges, participant_region, version_constraint)
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bridge(id: &str, region: &str, stress: f64) -> Bridge {
    Bridge {
      id: id.into(),
      region: region.to_owned(),
      version: "v1".to_owned(),
      stress,
      participants: 0,
      operational: true,
      graceful_shutdown: false,
      last_health_result: None,
      last_failure: None,
    }
  }

  #[tokio::test]
  async fn prefers_existing_conference_bridge_in_region() {
    let strategy = RegionBasedStrategy::new(RegionGroups::default(), 100);
    let candidates = vec![bridge("b1", "eu", 0.1), bridge("b2", "eu", 0.0)];
    let mut conference_bridges = HashMap::new();
    conference_bridges.insert(BridgeId::from("b1"), 1);

    let chosen = strategy
      .select(&candidates, &conference_bridges, Some("eu"), None)
      .await;
    assert_eq!(chosen, Some(BridgeId::from("b1")));
  }

  #[tokio::test]
  async fn region_override_picks_bridge_in_participant_region() {
    let strategy = RegionBasedStrategy::new(RegionGroups::default(), 100);
    let candidates = vec![bridge("b1", "a", 0.0), bridge("b2", "b", 0.0)];
    let mut conference_bridges = HashMap::new();
    conference_bridges.insert(BridgeId::from("b1"), 1);

    let chosen = strategy
      .select(&candidates, &conference_bridges, Some("b"), None)
      .await;
    assert_eq!(chosen, Some(BridgeId::from("b2")));
  }

  #[tokio::test]
  async fn falls_back_to_draining_bridge_when_nothing_else_is_operational() {
    let strategy = RegionBasedStrategy::new(RegionGroups::default(), 100);
    let mut draining = bridge("b1", "eu", 0.0);
    draining.graceful_shutdown = true;
    let chosen = strategy
      .select(&[draining], &HashMap::new(), Some("eu"), None)
      .await;
    assert_eq!(chosen, Some(BridgeId::from("b1")));
  }

  #[tokio::test]
  async fn max_bridge_participants_pushes_to_a_different_bridge() {
    let strategy = RegionBasedStrategy::new(RegionGroups::default(), 1);
    let candidates = vec![bridge("b1", "eu", 0.0), bridge("b2", "eu", 0.0)];
    let mut conference_bridges = HashMap::new();
    conference_bridges.insert(BridgeId::from("b1"), 1); // at cap

    let chosen = strategy
      .select(&candidates, &conference_bridges, Some("eu"), None)
      .await;
    assert_eq!(chosen, Some(BridgeId::from("b2")));
  }
}
