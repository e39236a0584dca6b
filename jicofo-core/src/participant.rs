//! Per-participant coordinator atop a [`JingleSession`] (§4.6): feature
//! discovery, offer synthesis, the outgoing source-change queue, restart
//! rate-limiting, and the conference-wide codec preference aggregator.

use std::{
  collections::{HashSet, VecDeque},
  sync::Arc,
  time::Duration,
};

use jicofo_xmpp_parsers::jingle_ice_udp::Transport as IceUdpTransport;
use thiserror::Error;
use xmpp_parsers::{
  disco::{DiscoInfoQuery, DiscoInfoResult},
  iq::{Iq, IqType},
  Jid,
};

use crate::{
  bridge::BridgeId,
  clock::Clock,
  jingle::{ContentSpec, JingleSession, PayloadTypeSpec},
  source_graph::{EndpointSourceSet, MediaType, Source, JVB_OWNER},
  util::generate_id,
  xmpp::connection::Connection,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParticipantError {
  #[error("too many restart requests in the current window")]
  RateLimited,
}

/// Capabilities intersected with a participant's discovered feature set to
/// build its offer.
#[derive(Debug, Clone)]
pub struct OfferOptions {
  pub ice: bool,
  pub dtls: bool,
  pub audio: bool,
  pub video: bool,
  pub sctp: bool,
  pub rtx: bool,
  pub tcc: bool,
  pub remb: bool,
  pub opus_red: bool,
  pub min_bitrate: u32,
  pub start_bitrate: u32,
  pub opus_max_average_bitrate: Option<u32>,
}

impl Default for OfferOptions {
  fn default() -> Self {
    Self {
      ice: true,
      dtls: true,
      audio: true,
      video: true,
      sctp: true,
      rtx: true,
      tcc: true,
      remb: false,
      opus_red: false,
      min_bitrate: 30_000,
      start_bitrate: 800_000,
      opus_max_average_bitrate: None,
    }
  }
}

pub const FEATURE_AUDIO: &str = "urn:xmpp:jingle:apps:rtp:audio";
pub const FEATURE_VIDEO: &str = "urn:xmpp:jingle:apps:rtp:video";
pub const FEATURE_RTX: &str = "urn:xmpp:jingle:apps:rtp:rtx:0";
pub const FEATURE_TCC: &str = "http://jitsi.org/tcc";
pub const FEATURE_REMB: &str = "http://jitsi.org/remb";
pub const FEATURE_SCTP: &str = "urn:xmpp:jingle:transports:ice-udp:1:sctp";
pub const FEATURE_OPUS_RED: &str = "http://jitsi.org/opus-red";
pub const FEATURE_JSON_SOURCES: &str = "http://jitsi.org/json-encoded-sources";

/// Assumed when feature discovery times out, so an invite is never blocked
/// indefinitely waiting on an unresponsive client (§5's "default list
/// fallback on timeout").
pub fn default_feature_set() -> HashSet<String> {
  [FEATURE_AUDIO, FEATURE_VIDEO, FEATURE_RTX, FEATURE_TCC, FEATURE_SCTP]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Queries `disco#info` on the participant's own full JID; on [`Timeout`]
/// (the IqTracker's `Timeout` kind) falls back to [`default_feature_set`]
/// rather than blocking the invite.
///
/// [`Timeout`]: crate::xmpp::iq_tracker::IqWaitError::Timeout
pub async fn discover_features(connection: &Connection, peer: Jid, timeout: Duration) -> HashSet<String> {
  let iq = Iq::from_get(generate_id(), DiscoInfoQuery { node: None })
    .with_to(peer.clone());
  let response = match connection.send_iq(iq, timeout).await {
    Ok(element) => element,
    Err(_) => return default_feature_set(),
  };

  let Ok(iq) = Iq::try_from(response)
  else {
    return default_feature_set();
  };
  match iq.payload {
    IqType::Result(Some(element)) => match DiscoInfoResult::try_from(element) {
      Ok(result) => result.features.into_iter().map(|f| f.var).collect(),
      Err(_) => default_feature_set(),
    },
    _ => default_feature_set(),
  }
}

fn default_payload_types(media: MediaType, features: &HashSet<String>, options: &OfferOptions) -> Vec<PayloadTypeSpec> {
  match media {
    MediaType::Audio => {
      let mut types = vec![PayloadTypeSpec {
        id: 111,
        name: "opus".to_owned(),
        clock_rate: 48000,
        channels: 2,
      }];
      if options.opus_red && features.contains(FEATURE_OPUS_RED) {
        types.push(PayloadTypeSpec {
          id: 112,
          name: "red".to_owned(),
          clock_rate: 48000,
          channels: 2,
        });
      }
      types
    },
    MediaType::Video => {
      let mut types = vec![
        PayloadTypeSpec {
          id: 100,
          name: "VP8".to_owned(),
          clock_rate: 90000,
          channels: 1,
        },
        PayloadTypeSpec {
          id: 101,
          name: "VP9".to_owned(),
          clock_rate: 90000,
          channels: 1,
        },
        PayloadTypeSpec {
          id: 127,
          name: "H264".to_owned(),
          clock_rate: 90000,
          channels: 1,
        },
      ];
      if options.rtx && features.contains(FEATURE_RTX) {
        types.push(PayloadTypeSpec {
          id: 96,
          name: "rtx".to_owned(),
          clock_rate: 90000,
          channels: 1,
        });
      }
      types
    },
  }
}

/// Builds the offer contents for a new participant: [`OfferOptions`]
/// intersected with its discovered features, the bridge's feedback sources
/// (always offered -- they are the bridge's own SSRCs the client must know
/// to receive forwarded media, not a `ConferenceSourceMap` entry), and every
/// other endpoint's current sources, excluding any that are themselves
/// owned by the bridge sentinel (I4: those belong to a *different*
/// bridge-as-speaker and are never re-offered as a peer's own source).
pub fn build_offer(
  options: &OfferOptions,
  features: &HashSet<String>,
  transport: IceUdpTransport,
  feedback_sources: &EndpointSourceSet,
  other_sources: &EndpointSourceSet,
) -> Vec<ContentSpec> {
  let mut contents = Vec::new();

  let not_feedback = |source: &&Source| source.owner != JVB_OWNER;

  if options.audio && features.contains(FEATURE_AUDIO) {
    let mut sources: Vec<Source> = feedback_sources
      .sources
      .iter()
      .filter(|s| s.media_type == MediaType::Audio)
      .chain(other_sources.sources.iter().filter(|s| s.media_type == MediaType::Audio).filter(not_feedback))
      .cloned()
      .collect();
    sources.dedup_by(|a, b| a.ssrc == b.ssrc);
    contents.push(ContentSpec {
      media: MediaType::Audio,
      payload_types: default_payload_types(MediaType::Audio, features, options),
      transport: transport.clone(),
      sources,
      groups: other_sources
        .groups
        .iter()
        .filter(|g| g.media_type == MediaType::Audio)
        .cloned()
        .collect(),
    });
  }

  if options.video && features.contains(FEATURE_VIDEO) {
    let mut sources: Vec<Source> = feedback_sources
      .sources
      .iter()
      .filter(|s| s.media_type == MediaType::Video)
      .chain(other_sources.sources.iter().filter(|s| s.media_type == MediaType::Video).filter(not_feedback))
      .cloned()
      .collect();
    sources.dedup_by(|a, b| a.ssrc == b.ssrc);
    contents.push(ContentSpec {
      media: MediaType::Video,
      payload_types: default_payload_types(MediaType::Video, features, options),
      transport,
      sources,
      groups: other_sources
        .groups
        .iter()
        .filter(|g| g.media_type == MediaType::Video)
        .cloned()
        .collect(),
    });
  }

  contents
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Add,
  Remove,
}

#[derive(Debug, Clone)]
struct QueueEntry {
  kind: ChangeKind,
  set: EndpointSourceSet,
}

/// Outgoing (Add|Remove, sources) entries awaiting a flush. Consecutive
/// entries of the same kind are merged; a kind change starts a new entry.
/// Flushed only when the owning session is Active; held otherwise.
#[derive(Debug, Default)]
pub struct SourceChangeQueue {
  entries: VecDeque<QueueEntry>,
}

impl SourceChangeQueue {
  pub fn push(&mut self, kind: ChangeKind, set: EndpointSourceSet) {
    if set.is_empty() {
      return;
    }
    if let Some(last) = self.entries.back_mut() {
      if last.kind == kind {
        last.set.sources.extend(set.sources);
        last.set.groups.extend(set.groups);
        return;
      }
    }
    self.entries.push_back(QueueEntry { kind, set });
  }

  pub fn drain(&mut self) -> Vec<(ChangeKind, EndpointSourceSet)> {
    self.entries.drain(..).map(|e| (e.kind, e.set)).collect()
  }

  /// Drops everything queued: called when the session terminates before a
  /// flush, since there is no longer anyone to deliver these to.
  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Sliding-window counter: at most `max` acceptances in the trailing
/// `window`. The clock is injected so tests can drive it deterministically.
#[derive(Debug)]
pub struct RestartLimiter {
  clock: Arc<dyn Clock>,
  max: usize,
  window: Duration,
  accepted: VecDeque<std::time::Instant>,
}

impl RestartLimiter {
  pub fn new(clock: Arc<dyn Clock>, max: usize, window: Duration) -> Self {
    Self {
      clock,
      max,
      window,
      accepted: VecDeque::new(),
    }
  }

  pub fn default_with_clock(clock: Arc<dyn Clock>) -> Self {
    Self::new(clock, 3, Duration::from_secs(60))
  }

  /// Records and accepts a restart request, or rejects it with
  /// [`ParticipantError::RateLimited`] if the window is already full.
  pub fn try_acquire(&mut self) -> Result<(), ParticipantError> {
    let now = self.clock.now();
    while let Some(&oldest) = self.accepted.front() {
      if now.duration_since(oldest) >= self.window {
        self.accepted.pop_front();
      }
      else {
        break;
      }
    }
    if self.accepted.len() >= self.max {
      return Err(ParticipantError::RateLimited);
    }
    self.accepted.push_back(now);
    Ok(())
  }
}

/// Computes the conference's effective codec ordering as the majority
/// order preserving the set of codecs every current participant supports.
/// Recomputation is cheap and idempotent; callers should flush downstream
/// only when [`CodecPreferenceAggregator::order`] actually changes.
#[derive(Debug, Default)]
pub struct CodecPreferenceAggregator {
  last_order: Vec<String>,
}

impl CodecPreferenceAggregator {
  /// Recomputes from each participant's ordered codec preference list,
  /// keeping only codecs common to every list, ordered by how often each
  /// relative order is observed (a crude Borda count: earlier = more
  /// votes).
  pub fn recompute(&mut self, participant_orders: &[Vec<String>]) -> Option<Vec<String>> {
    if participant_orders.is_empty() {
      return None;
    }

    let common: HashSet<&str> = participant_orders
      .iter()
      .map(|order| order.iter().map(String::as_str).collect::<HashSet<_>>())
      .reduce(|a, b| a.intersection(&b).copied().collect())
      .unwrap_or_default();

    let mut scores: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for order in participant_orders {
      for (rank, codec) in order.iter().enumerate() {
        if common.contains(codec.as_str()) {
          *scores.entry(codec.as_str()).or_insert(0) += order.len() - rank;
        }
      }
    }

    let mut ranked: Vec<&str> = common.into_iter().collect();
    ranked.sort_by(|a, b| scores[b].cmp(&scores[a]).then_with(|| a.cmp(b)));
    let new_order: Vec<String> = ranked.into_iter().map(str::to_owned).collect();

    if new_order == self.last_order {
      None
    }
    else {
      self.last_order = new_order.clone();
      Some(new_order)
    }
  }
}

/// One conference occupant: its Jingle dialog plus everything the
/// Conference needs to drive it (§3's `Participant` entity).
#[derive(Debug)]
pub struct Participant {
  pub endpoint_id: String,
  pub jingle: JingleSession,
  pub features: HashSet<String>,
  pub assigned_bridge: Option<BridgeId>,
  pub queue: SourceChangeQueue,
  pub restart_limiter: RestartLimiter,
  pub mute_audio: bool,
  pub mute_video: bool,
}

impl Participant {
  pub fn new(endpoint_id: impl Into<String>, jingle: JingleSession, clock: Arc<dyn Clock>) -> Self {
    Self {
      endpoint_id: endpoint_id.into(),
      jingle,
      features: default_feature_set(),
      assigned_bridge: None,
      queue: SourceChangeQueue::default(),
      restart_limiter: RestartLimiter::default_with_clock(clock),
      mute_audio: false,
      mute_video: false,
    }
  }

  /// Sends a restart request if the limiter still has room this window;
  /// otherwise rejects without touching the Jingle session.
  pub async fn request_restart(
    &mut self,
    media: MediaType,
    transport: IceUdpTransport,
  ) -> Result<(), ParticipantError> {
    self.restart_limiter.try_acquire()?;
    self
      .jingle
      .restart(media, transport)
      .await
      .map_err(|_| ParticipantError::RateLimited)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::clock::TestClock;

  fn source(ssrc: u32, media: MediaType, owner: &str) -> Source {
    Source {
      ssrc,
      media_type: media,
      owner: owner.to_owned(),
      name: None,
      video_type: None,
      muted: false,
    }
  }

  #[test]
  fn default_feature_set_covers_audio_video_and_data() {
    let features = default_feature_set();
    assert!(features.contains(FEATURE_AUDIO));
    assert!(features.contains(FEATURE_VIDEO));
    assert!(features.contains(FEATURE_SCTP));
  }

  #[test]
  fn build_offer_includes_feedback_sources_and_excludes_other_sources_owned_by_the_bridge() {
    let options = OfferOptions::default();
    let features = default_feature_set();
    let feedback = EndpointSourceSet {
      sources: vec![source(1, MediaType::Audio, JVB_OWNER)],
      groups: vec![],
    };
    let others = EndpointSourceSet {
      sources: vec![source(2, MediaType::Audio, "bob"), source(3, MediaType::Audio, JVB_OWNER)],
      groups: vec![],
    };

    let contents = build_offer(&options, &features, IceUdpTransport::new(), &feedback, &others);
    let audio = contents.iter().find(|c| c.media == MediaType::Audio).unwrap();
    // The bridge's own feedback source is always offered, "bob"'s source is
    // offered, and the JVB-owned entry in `other_sources` (I4) is excluded.
    assert_eq!(audio.sources.len(), 2);
    assert!(audio.sources.iter().any(|s| s.ssrc == 1 && s.owner == JVB_OWNER));
    assert!(audio.sources.iter().any(|s| s.ssrc == 2 && s.owner == "bob"));
    assert!(!audio.sources.iter().any(|s| s.ssrc == 3));
  }

  #[test]
  fn build_offer_omits_video_when_not_discovered() {
    let options = OfferOptions::default();
    let features: HashSet<String> = [FEATURE_AUDIO.to_owned()].into_iter().collect();
    let empty = EndpointSourceSet::default();

    let contents = build_offer(&options, &features, IceUdpTransport::new(), &empty, &empty);
    assert!(contents.iter().all(|c| c.media != MediaType::Video));
  }

  #[test]
  fn source_change_queue_merges_consecutive_same_kind_entries() {
    let mut queue = SourceChangeQueue::default();
    queue.push(
      ChangeKind::Add,
      EndpointSourceSet {
        sources: vec![source(1, MediaType::Audio, "alice")],
        groups: vec![],
      },
    );
    queue.push(
      ChangeKind::Add,
      EndpointSourceSet {
        sources: vec![source(2, MediaType::Audio, "alice")],
        groups: vec![],
      },
    );
    queue.push(
      ChangeKind::Remove,
      EndpointSourceSet {
        sources: vec![source(1, MediaType::Audio, "alice")],
        groups: vec![],
      },
    );

    let drained = queue.drain();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].0, ChangeKind::Add);
    assert_eq!(drained[0].1.sources.len(), 2);
    assert_eq!(drained[1].0, ChangeKind::Remove);
  }

  #[test]
  fn restart_limiter_accepts_three_then_rejects_until_window_clears() {
    let clock = Arc::new(TestClock::new());
    let mut limiter = RestartLimiter::new(clock.clone(), 3, Duration::from_secs(60));

    assert!(limiter.try_acquire().is_ok());
    clock.advance(Duration::from_secs(11));
    assert!(limiter.try_acquire().is_ok());
    clock.advance(Duration::from_secs(10));
    assert!(limiter.try_acquire().is_ok());

    // 4th request at t=21s, still well within the 60s window: rejected.
    assert_eq!(limiter.try_acquire(), Err(ParticipantError::RateLimited));

    // Advance past the first acceptance's window (t=0 + 60s) and it clears.
    clock.advance(Duration::from_secs(40));
    assert!(limiter.try_acquire().is_ok());
  }

  #[test]
  fn restart_limiter_clears_an_entry_at_exactly_window_age() {
    let clock = Arc::new(TestClock::new());
    let mut limiter = RestartLimiter::new(clock.clone(), 1, Duration::from_secs(60));

    assert!(limiter.try_acquire().is_ok());
    // A second request while the first is still within the window: rejected.
    clock.advance(Duration::from_secs(59));
    assert_eq!(limiter.try_acquire(), Err(ParticipantError::RateLimited));

    // The first entry is now exactly `window` old and must evict.
    clock.advance(Duration::from_secs(1));
    assert!(limiter.try_acquire().is_ok());
  }

  #[test]
  fn restart_limiter_accepts_at_61s_and_71s_after_filling_the_window_at_t0() {
    let clock = Arc::new(TestClock::new());
    let mut limiter = RestartLimiter::new(clock.clone(), 1, Duration::from_secs(60));

    assert!(limiter.try_acquire().is_ok());
    clock.advance(Duration::from_secs(61));
    assert!(limiter.try_acquire().is_ok());
    clock.advance(Duration::from_secs(10));
    assert!(limiter.try_acquire().is_ok());
  }

  #[test]
  fn codec_aggregator_only_returns_when_order_changes() {
    let mut aggregator = CodecPreferenceAggregator::default();
    let orders = vec![
      vec!["VP8".to_owned(), "VP9".to_owned(), "H264".to_owned()],
      vec!["VP8".to_owned(), "H264".to_owned(), "VP9".to_owned()],
    ];

    let first = aggregator.recompute(&orders);
    assert!(first.is_some());
    assert!(first.as_ref().unwrap().contains(&"VP8".to_owned()));

    let second = aggregator.recompute(&orders);
    assert!(second.is_none(), "unchanged input must not re-flush");
  }
}
