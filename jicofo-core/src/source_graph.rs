//! Conference-wide map of endpoint -> media sources + SSRC groups.
//!
//! Enforces SSRC uniqueness across the whole conference (I1), group closure
//! (I2), and a per-endpoint cap on sources/groups (I3). All mutation is
//! expected to run on the owning Conference's single-writer queue; this type
//! itself is not internally synchronized.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

pub const JVB_OWNER: &str = "JVB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
  Audio,
  Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoType {
  Camera,
  Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupSemantics {
  Sim,
  Fid,
  Fec,
  Ddp,
  Ls,
  Srf,
  Anat,
}

/// One RTP stream, as tracked by the source graph. `owner` is the endpoint
/// id that advertised it, except for bridge-synthesized feedback sources,
/// which carry the sentinel owner [`JVB_OWNER`] (I4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub owner: String,
  pub name: Option<String>,
  pub video_type: Option<VideoType>,
  pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcGroup {
  pub media_type: MediaType,
  pub semantics: GroupSemantics,
  pub ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSourceSet {
  pub sources: Vec<Source>,
  pub groups: Vec<SsrcGroup>,
}

impl EndpointSourceSet {
  pub fn is_empty(&self) -> bool {
    self.sources.is_empty() && self.groups.is_empty()
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceGraphError {
  #[error("ssrc {ssrc} is already owned by endpoint {owner}")]
  SsrcConflict { ssrc: u32, owner: String },

  #[error("endpoint {endpoint} would exceed its source/group limit")]
  SsrcLimitExceeded { endpoint: String },

  #[error("ssrc-group referencing unknown ssrc {ssrc} on endpoint {endpoint}")]
  GroupInconsistent { endpoint: String, ssrc: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct SourceGraphLimits {
  pub max_ssrcs_per_user: usize,
  pub max_ssrc_groups_per_user: usize,
}

impl Default for SourceGraphLimits {
  fn default() -> Self {
    Self {
      max_ssrcs_per_user: 20,
      max_ssrc_groups_per_user: 10,
    }
  }
}

/// Whole-conference source state: `ConferenceSourceMap` in the data model.
#[derive(Debug, Clone, Default)]
pub struct SourceGraph {
  limits: SourceGraphLimitsOrDefault,
  endpoints: HashMap<String, EndpointSourceSet>,
}

#[derive(Debug, Clone, Copy)]
struct SourceGraphLimitsOrDefault(SourceGraphLimits);

impl Default for SourceGraphLimitsOrDefault {
  fn default() -> Self {
    Self(SourceGraphLimits::default())
  }
}

impl SourceGraph {
  pub fn new(limits: SourceGraphLimits) -> Self {
    Self {
      limits: SourceGraphLimitsOrDefault(limits),
      endpoints: HashMap::new(),
    }
  }

  fn owner_of(&self, ssrc: u32) -> Option<&str> {
    self.endpoints.iter().find_map(|(owner, set)| {
      set
        .sources
        .iter()
        .any(|s| s.ssrc == ssrc)
        .then_some(owner.as_str())
    })
  }

  /// Accepts only sources not already present for a *different* endpoint;
  /// within the endpoint, exact duplicates are collapsed silently. Returns
  /// the subset actually added (empty if everything was already present).
  pub fn try_add(
    &mut self,
    endpoint_id: &str,
    set: EndpointSourceSet,
  ) -> Result<EndpointSourceSet, SourceGraphError> {
    // Validate without mutating: a rejected call must leave no partial state.
    for source in &set.sources {
      if let Some(owner) = self.owner_of(source.ssrc) {
        if owner != endpoint_id {
          return Err(SourceGraphError::SsrcConflict {
            ssrc: source.ssrc,
            owner: owner.to_owned(),
          });
        }
      }
    }

    let existing = self.endpoints.entry(endpoint_id.to_owned()).or_default();

    let mut new_sources = Vec::new();
    for source in set.sources {
      if !existing.sources.contains(&source) {
        new_sources.push(source);
      }
    }

    let mut new_groups = Vec::new();
    for group in set.groups {
      if !existing.groups.contains(&group) {
        new_groups.push(group);
      }
    }

    if existing.sources.len() + new_sources.len() > self.limits.0.max_ssrcs_per_user
      || existing.groups.len() + new_groups.len() > self.limits.0.max_ssrc_groups_per_user
    {
      return Err(SourceGraphError::SsrcLimitExceeded {
        endpoint: endpoint_id.to_owned(),
      });
    }

    // Group closure (I2): every group SSRC must resolve to a Source on the
    // same endpoint+kind, considering sources added in this same call.
    let all_ssrcs_after: HashSet<(u32, MediaType)> = existing
      .sources
      .iter()
      .chain(new_sources.iter())
      .map(|s| (s.ssrc, s.media_type))
      .collect();
    for group in &new_groups {
      for ssrc in &group.ssrcs {
        if !all_ssrcs_after.contains(&(*ssrc, group.media_type)) {
          return Err(SourceGraphError::GroupInconsistent {
            endpoint: endpoint_id.to_owned(),
            ssrc: *ssrc,
          });
        }
      }
    }

    existing.sources.extend(new_sources.clone());
    existing.groups.extend(new_groups.clone());

    Ok(EndpointSourceSet {
      sources: new_sources,
      groups: new_groups,
    })
  }

  /// Removes only matching entries, returning the subset actually removed.
  /// A group is removed in full (and reported as removed) if any of its
  /// SSRCs are removed, even if it was not named explicitly.
  pub fn try_remove(&mut self, endpoint_id: &str, set: EndpointSourceSet) -> EndpointSourceSet {
    let Some(existing) = self.endpoints.get_mut(endpoint_id) else {
      return EndpointSourceSet::default();
    };

    let mut removed_sources = Vec::new();
    for source in &set.sources {
      if let Some(pos) = existing.sources.iter().position(|s| s == source) {
        removed_sources.push(existing.sources.remove(pos));
      }
    }

    let remaining_ssrcs: HashSet<u32> = existing.sources.iter().map(|s| s.ssrc).collect();

    let mut removed_groups = Vec::new();
    existing.groups.retain(|group| {
      let orphaned = group.ssrcs.iter().any(|s| !remaining_ssrcs.contains(s));
      let explicitly_removed = set.groups.contains(group);
      if orphaned || explicitly_removed {
        removed_groups.push(group.clone());
        false
      }
      else {
        true
      }
    });

    if existing.is_empty() {
      self.endpoints.remove(endpoint_id);
    }

    EndpointSourceSet {
      sources: removed_sources,
      groups: removed_groups,
    }
  }

  pub fn remove_endpoint(&mut self, endpoint_id: &str) -> EndpointSourceSet {
    self.endpoints.remove(endpoint_id).unwrap_or_default()
  }

  pub fn snapshot(&self) -> HashMap<String, EndpointSourceSet> {
    self.endpoints.clone()
  }

  pub fn endpoint(&self, endpoint_id: &str) -> Option<&EndpointSourceSet> {
    self.endpoints.get(endpoint_id)
  }

  /// Set-wise diff between this graph and a previously taken snapshot,
  /// partitioned by endpoint: sources/groups present now but not before
  /// ("added"), and vice versa ("removed").
  pub fn diff(
    &self,
    other: &HashMap<String, EndpointSourceSet>,
  ) -> (
    HashMap<String, EndpointSourceSet>,
    HashMap<String, EndpointSourceSet>,
  ) {
    let mut added = HashMap::new();
    let mut removed = HashMap::new();

    for (endpoint, set) in &self.endpoints {
      let before = other.get(endpoint).cloned().unwrap_or_default();
      let diff_added = EndpointSourceSet {
        sources: set
          .sources
          .iter()
          .filter(|s| !before.sources.contains(s))
          .cloned()
          .collect(),
        groups: set
          .groups
          .iter()
          .filter(|g| !before.groups.contains(g))
          .cloned()
          .collect(),
      };
      if !diff_added.is_empty() {
        added.insert(endpoint.clone(), diff_added);
      }
    }

    for (endpoint, before) in other {
      let now = self.endpoints.get(endpoint).cloned().unwrap_or_default();
      let diff_removed = EndpointSourceSet {
        sources: before
          .sources
          .iter()
          .filter(|s| !now.sources.contains(s))
          .cloned()
          .collect(),
        groups: before
          .groups
          .iter()
          .filter(|g| !now.groups.contains(g))
          .cloned()
          .collect(),
      };
      if !diff_removed.is_empty() {
        removed.insert(endpoint.clone(), diff_removed);
      }
    }

    (added, removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn source(ssrc: u32, owner: &str, media_type: MediaType) -> Source {
    Source {
      ssrc,
      media_type,
      owner: owner.to_owned(),
      name: None,
      video_type: None,
      muted: false,
    }
  }

  #[test]
  fn rejects_ssrc_owned_by_another_endpoint() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(1, "alice", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap();

    let err = graph
      .try_add(
        "bob",
        EndpointSourceSet {
          sources: vec![source(1, "bob", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap_err();
    assert_eq!(
      err,
      SourceGraphError::SsrcConflict {
        ssrc: 1,
        owner: "alice".to_owned()
      }
    );
  }

  #[test]
  fn collapses_duplicates_within_the_same_endpoint() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    let added = graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(1, "alice", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap();
    assert_eq!(added.sources.len(), 1);

    let added_again = graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(1, "alice", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap();
    assert!(added_again.is_empty());
  }

  #[test]
  fn rejects_group_referencing_missing_ssrc() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    let err = graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![],
          groups: vec![SsrcGroup {
            media_type: MediaType::Video,
            semantics: GroupSemantics::Sim,
            ssrcs: vec![1, 2],
          }],
        },
      )
      .unwrap_err();
    assert_eq!(
      err,
      SourceGraphError::GroupInconsistent {
        endpoint: "alice".to_owned(),
        ssrc: 1
      }
    );
  }

  #[test]
  fn enforces_per_endpoint_ssrc_limit() {
    let mut graph = SourceGraph::new(SourceGraphLimits {
      max_ssrcs_per_user: 1,
      max_ssrc_groups_per_user: 10,
    });
    graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(1, "alice", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap();
    let err = graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(2, "alice", MediaType::Video)],
          groups: vec![],
        },
      )
      .unwrap_err();
    assert_eq!(
      err,
      SourceGraphError::SsrcLimitExceeded {
        endpoint: "alice".to_owned()
      }
    );
  }

  #[test]
  fn removing_an_ssrc_orphans_its_group() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![
            source(1, "alice", MediaType::Video),
            source(2, "alice", MediaType::Video),
          ],
          groups: vec![SsrcGroup {
            media_type: MediaType::Video,
            semantics: GroupSemantics::Sim,
            ssrcs: vec![1, 2],
          }],
        },
      )
      .unwrap();

    let removed = graph.try_remove(
      "alice",
      EndpointSourceSet {
        sources: vec![source(1, "alice", MediaType::Video)],
        groups: vec![],
      },
    );
    assert_eq!(removed.sources.len(), 1);
    assert_eq!(removed.groups.len(), 1, "orphaned group must be reported");
    assert!(graph.endpoint("alice").unwrap().groups.is_empty());
  }

  #[test]
  fn add_then_remove_round_trips_to_prior_snapshot() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    let before = graph.snapshot();
    let set = EndpointSourceSet {
      sources: vec![source(1, "alice", MediaType::Audio)],
      groups: vec![],
    };
    graph.try_add("alice", set.clone()).unwrap();
    graph.try_remove("alice", set);
    assert_eq!(graph.snapshot(), before);
  }

  #[test]
  fn removing_endpoint_is_atomic() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![
            source(1, "alice", MediaType::Audio),
            source(2, "alice", MediaType::Video),
          ],
          groups: vec![],
        },
      )
      .unwrap();
    let removed = graph.remove_endpoint("alice");
    assert_eq!(removed.sources.len(), 2);
    assert!(graph.endpoint("alice").is_none());
  }

  #[test]
  fn diff_reports_added_and_removed_per_endpoint() {
    let mut graph = SourceGraph::new(SourceGraphLimits::default());
    let before = graph.snapshot();
    graph
      .try_add(
        "alice",
        EndpointSourceSet {
          sources: vec![source(1, "alice", MediaType::Audio)],
          groups: vec![],
        },
      )
      .unwrap();
    let (added, removed) = graph.diff(&before);
    assert_eq!(added["alice"].sources.len(), 1);
    assert!(removed.is_empty());
  }
}
