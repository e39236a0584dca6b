//! Colibri v2: the conference-modify IQ payload sent to and received from
//! bridges to create, update and expire conference endpoints and relays.

use xmpp_parsers::{iq::IqSetPayload, ns::JINGLE_ICE_UDP};

use crate::{
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_ssma::{Group, Source},
  ns::COLIBRI2,
};

generate_attribute!(
  /// A boolean-valued attribute, present (as "true") or absent.
  Flag, "flag", bool
);

generate_element!(
  /// The root payload of a Colibri v2 `conference-modify` IQ: a batch of
  /// endpoint and relay instructions for a single conference on a single
  /// bridge.
  ConferenceModify, "conference-modify", COLIBRI2,
  attributes: [
    /// The opaque meeting id the focus assigned to this conference.
    meeting_id: Option<String> = "meeting-id",

    /// A human-readable conference name, for bridge-side logging only.
    name: Option<String> = "name",

    /// Set on the request that creates the ColibriSession on this bridge.
    create: Default<Flag> = "create",
  ],
  children: [
    /// Endpoint instructions carried by this request/response.
    endpoints: Vec<Endpoint> = ("endpoint", COLIBRI2) => Endpoint,

    /// Relay instructions carried by this request/response.
    relays: Vec<Relay> = ("relay", COLIBRI2) => Relay,
  ]
);

impl IqSetPayload for ConferenceModify {}

impl ConferenceModify {
  /// Start building a request for one conference/bridge pair.
  pub fn new() -> ConferenceModify {
    ConferenceModify {
      meeting_id: None,
      name: None,
      create: Flag::False,
      endpoints: Vec::new(),
      relays: Vec::new(),
    }
  }

  pub fn with_meeting_id(mut self, meeting_id: impl Into<String>) -> Self {
    self.meeting_id = Some(meeting_id.into());
    self
  }

  pub fn creating(mut self) -> Self {
    self.create = Flag::True;
    self
  }

  pub fn add_endpoint(mut self, endpoint: Endpoint) -> Self {
    self.endpoints.push(endpoint);
    self
  }

  pub fn add_relay(mut self, relay: Relay) -> Self {
    self.relays.push(relay);
    self
  }
}

impl Default for ConferenceModify {
  fn default() -> Self {
    ConferenceModify::new()
  }
}

generate_element!(
  /// Force-mute instruction embedded in an endpoint create/update.
  ForceMute, "force-mute", COLIBRI2,
  attributes: [
    /// Mute the endpoint's audio sources.
    audio: Default<Flag> = "audio",

    /// Mute the endpoint's video sources.
    video: Default<Flag> = "video",
  ]
);

generate_empty_element!(
  /// Presence-only marker requesting an SCTP (data) channel for an
  /// endpoint.
  Sctp, "sctp", COLIBRI2
);

generate_element!(
  /// One endpoint's create/update/expire instruction within a
  /// `conference-modify` request, and its mirror in the bridge's response
  /// (populated with the transport and feedback sources it allocated).
  Endpoint, "endpoint", COLIBRI2,
  attributes: [
    /// The endpoint (participant) id.
    id: Required<String> = "id",

    /// Free-form id used for bridge-side stats correlation.
    stats_id: Option<String> = "stats-id",

    /// Set when this instruction allocates a new ColibriEndpoint.
    create: Default<Flag> = "create",

    /// Set when this instruction tears down an existing ColibriEndpoint.
    expire: Default<Flag> = "expire",
  ],
  children: [
    /// ICE-UDP transport parameters, carried both ways: offered by the
    /// focus on create, filled in by the bridge in its response.
    transport: Option<IceUdpTransport> = ("transport", JINGLE_ICE_UDP) => IceUdpTransport,

    /// Force-mute state to apply to this endpoint.
    force_mute: Option<ForceMute> = ("force-mute", COLIBRI2) => ForceMute,

    /// Requests (or confirms) an SCTP data channel for this endpoint.
    sctp: Option<Sctp> = ("sctp", COLIBRI2) => Sctp,

    /// Sources to associate with this endpoint (the union of all other
    /// endpoints' sources on create; incremental deltas on update).
    sources: Vec<Source> = ("source", JINGLE_SSMA) => Source,

    /// Source groups accompanying `sources`.
    source_groups: Vec<Group> = ("ssrc-group", JINGLE_SSMA) => Group,
  ]
);

impl Endpoint {
  pub fn create(id: impl Into<String>) -> Endpoint {
    Endpoint {
      id: id.into(),
      stats_id: None,
      create: Flag::True,
      expire: Flag::False,
      transport: None,
      force_mute: None,
      sctp: None,
      sources: Vec::new(),
      source_groups: Vec::new(),
    }
  }

  pub fn expire(id: impl Into<String>) -> Endpoint {
    Endpoint {
      id: id.into(),
      stats_id: None,
      create: Flag::False,
      expire: Flag::True,
      transport: None,
      force_mute: None,
      sctp: None,
      sources: Vec::new(),
      source_groups: Vec::new(),
    }
  }

  pub fn update(id: impl Into<String>) -> Endpoint {
    Endpoint {
      id: id.into(),
      stats_id: None,
      create: Flag::False,
      expire: Flag::False,
      transport: None,
      force_mute: None,
      sctp: None,
      sources: Vec::new(),
      source_groups: Vec::new(),
    }
  }
}

generate_element!(
  /// One remote endpoint signaled over a relay between two bridges.
  RelayEndpoint, "endpoint", COLIBRI2,
  attributes: [
    /// The remote endpoint id.
    id: Required<String> = "id",

    /// Set when adding this endpoint to the relay.
    create: Default<Flag> = "create",

    /// Set when removing this endpoint from the relay.
    expire: Default<Flag> = "expire",
  ],
  children: [
    /// The remote endpoint's sources, forwarded across the relay.
    sources: Vec<Source> = ("source", JINGLE_SSMA) => Source,

    /// Source groups accompanying `sources`.
    source_groups: Vec<Group> = ("ssrc-group", JINGLE_SSMA) => Group,
  ]
);

impl RelayEndpoint {
  pub fn add(id: impl Into<String>) -> RelayEndpoint {
    RelayEndpoint {
      id: id.into(),
      create: Flag::True,
      expire: Flag::False,
      sources: Vec::new(),
      source_groups: Vec::new(),
    }
  }

  pub fn remove(id: impl Into<String>) -> RelayEndpoint {
    RelayEndpoint {
      id: id.into(),
      create: Flag::False,
      expire: Flag::True,
      sources: Vec::new(),
      source_groups: Vec::new(),
    }
  }
}

generate_element!(
  /// An inter-bridge relay link instruction, naming the sibling bridge's
  /// relay id and transport and (incrementally) the remote endpoints
  /// signaled over it.
  Relay, "relay", COLIBRI2,
  attributes: [
    /// The id the peer bridge uses for its side of this relay.
    id: Required<String> = "id",

    /// Set on the request that creates the relay.
    create: Default<Flag> = "create",

    /// Set on the request that tears down the relay.
    expire: Default<Flag> = "expire",
  ],
  children: [
    /// ICE-UDP transport parameters for the relay link itself.
    transport: Option<IceUdpTransport> = ("transport", JINGLE_ICE_UDP) => IceUdpTransport,

    /// Remote-endpoint add/remove instructions carried over this relay.
    endpoints: Vec<RelayEndpoint> = ("endpoint", COLIBRI2) => RelayEndpoint,
  ]
);

impl Relay {
  pub fn create(id: impl Into<String>) -> Relay {
    Relay {
      id: id.into(),
      create: Flag::True,
      expire: Flag::False,
      transport: None,
      endpoints: Vec::new(),
    }
  }

  pub fn update(id: impl Into<String>) -> Relay {
    Relay {
      id: id.into(),
      create: Flag::False,
      expire: Flag::False,
      transport: None,
      endpoints: Vec::new(),
    }
  }

  pub fn expire(id: impl Into<String>) -> Relay {
    Relay {
      id: id.into(),
      create: Flag::False,
      expire: Flag::True,
      transport: None,
      endpoints: Vec::new(),
    }
  }

  pub fn add_endpoint(mut self, endpoint: RelayEndpoint) -> Self {
    self.endpoints.push(endpoint);
    self
  }
}

impl From<bool> for Flag {
  fn from(value: bool) -> Self {
    if value {
      Flag::True
    }
    else {
      Flag::False
    }
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use xmpp_parsers::Element;

  use super::*;

  #[test]
  fn round_trips_a_create_request() {
    let request = ConferenceModify::new()
      .with_meeting_id("abcd1234")
      .creating()
      .add_endpoint(Endpoint::create("alice"));
    let element = Element::from(request.clone());
    let parsed = ConferenceModify::try_from(element).unwrap();
    assert_eq!(parsed.meeting_id.as_deref(), Some("abcd1234"));
    assert_eq!(parsed.create, Flag::True);
    assert_eq!(parsed.endpoints.len(), 1);
    assert_eq!(parsed.endpoints[0].id, "alice");
    assert_eq!(parsed.endpoints[0].create, Flag::True);
  }

  #[test]
  fn expire_flag_round_trips() {
    let request = ConferenceModify::new().add_endpoint(Endpoint::expire("bob"));
    let element = Element::from(request);
    let parsed = ConferenceModify::try_from(element).unwrap();
    assert_eq!(parsed.endpoints[0].expire, Flag::True);
    assert_eq!(parsed.endpoints[0].create, Flag::False);
  }

  #[test]
  fn relay_carries_remote_endpoints() {
    let relay = Relay::create("relay-b2").add_endpoint(RelayEndpoint::add("carol"));
    let request = ConferenceModify::new().add_relay(relay);
    let element = Element::from(request);
    let parsed = ConferenceModify::try_from(element).unwrap();
    assert_eq!(parsed.relays.len(), 1);
    assert_eq!(parsed.relays[0].endpoints[0].id, "carol");
  }
}
