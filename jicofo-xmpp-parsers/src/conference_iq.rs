//! The focus's own "conference request" IQ (domain
//! `http://jitsi.org/protocol/focus`), used by a participant's client to
//! request that a conference be created or looked up, and by the focus to
//! report room readiness and initial configuration back.

use std::{collections::HashMap, convert::TryFrom};

use jid::Jid;
use xmpp_parsers::{
  iq::{IqResultPayload, IqSetPayload},
  Element, Error,
};

use crate::ns::JITSI_FOCUS;

generate_attribute!(
  /// Whether the room is ready for the participant to join yet (absent on
  /// the request; present on the response once the MUC is joined).
  Ready, "ready", bool
);

/// A single opaque configuration property exchanged on the conference IQ,
/// e.g. `"enableRecording" = "true"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
  pub name: String,
  pub value: String,
}

impl TryFrom<Element> for Property {
  type Error = Error;

  fn try_from(elem: Element) -> Result<Property, Error> {
    check_self!(elem, "property", JITSI_FOCUS, "Property");
    Ok(Property {
      name: get_attr!(elem, "name", Required),
      value: get_attr!(elem, "value", Required),
    })
  }
}

impl From<Property> for Element {
  fn from(property: Property) -> Element {
    Element::builder("property", JITSI_FOCUS)
      .attr("name", property.name)
      .attr("value", property.value)
      .build()
  }
}

/// The `conference` element itself: a request when sent by a participant's
/// client, a response when echoed back (with `ready` set and the room's
/// effective properties filled in) by the focus.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceIq {
  /// Caller-chosen identifier for the requesting client instance.
  pub machine_uid: Option<String>,

  /// The room being requested, as a bare JID (e.g. `room@conference.example`).
  pub room: Jid,

  /// Set by the focus once the room has been created/joined.
  pub ready: Ready,

  /// Effective configuration properties for the room (request: hints from
  /// the client; response: the focus's resolved values).
  pub properties: Vec<Property>,
}

impl IqSetPayload for ConferenceIq {}
impl IqResultPayload for ConferenceIq {}

impl ConferenceIq {
  pub fn request(room: Jid) -> ConferenceIq {
    ConferenceIq {
      machine_uid: None,
      room,
      ready: Ready::False,
      properties: Vec::new(),
    }
  }

  pub fn with_machine_uid(mut self, machine_uid: impl Into<String>) -> Self {
    self.machine_uid = Some(machine_uid.into());
    self
  }

  pub fn property_map(&self) -> HashMap<String, String> {
    self
      .properties
      .iter()
      .map(|p| (p.name.clone(), p.value.clone()))
      .collect()
  }

  pub fn response(room: Jid, properties: HashMap<String, String>) -> ConferenceIq {
    ConferenceIq {
      machine_uid: None,
      room,
      ready: Ready::True,
      properties: properties
        .into_iter()
        .map(|(name, value)| Property { name, value })
        .collect(),
    }
  }
}

impl TryFrom<Element> for ConferenceIq {
  type Error = Error;

  fn try_from(root: Element) -> Result<ConferenceIq, Error> {
    check_self!(root, "conference", JITSI_FOCUS, "ConferenceIq");
    let room: Jid = get_attr!(root, "room", Required);
    let mut properties = Vec::new();
    for child in root.children().cloned() {
      if child.is("property", JITSI_FOCUS) {
        properties.push(Property::try_from(child)?);
      }
    }
    Ok(ConferenceIq {
      machine_uid: get_attr!(root, "machine-uid", Option),
      room,
      ready: get_attr!(root, "ready", Default),
      properties,
    })
  }
}

impl From<ConferenceIq> for Element {
  fn from(iq: ConferenceIq) -> Element {
    Element::builder("conference", JITSI_FOCUS)
      .attr("machine-uid", iq.machine_uid)
      .attr("room", iq.room)
      .attr("ready", iq.ready)
      .append_all(iq.properties)
      .build()
  }
}

/// JSON mirror of [`ConferenceIq`], used by the optional HTTP
/// `/conference-request/v1` endpoint. The HTTP handler only translates
/// to/from this shape and otherwise drives the exact same internal path as
/// the XMPP IQ.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConferenceRequest {
  pub room: String,
  #[serde(default)]
  pub machine_uid: Option<String>,
  #[serde(default)]
  pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConferenceResponse {
  pub room: String,
  pub ready: bool,
  pub properties: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  #[test]
  fn round_trips_a_request() {
    let room = Jid::from_str("room@conference.example.com").unwrap();
    let iq = ConferenceIq::request(room.clone()).with_machine_uid("device-1");
    let element = Element::from(iq.clone());
    let parsed = ConferenceIq::try_from(element).unwrap();
    assert_eq!(parsed.room, room);
    assert_eq!(parsed.machine_uid.as_deref(), Some("device-1"));
    assert_eq!(parsed.ready, Ready::False);
  }

  #[test]
  fn round_trips_a_response_with_properties() {
    let room = Jid::from_str("room@conference.example.com").unwrap();
    let mut properties = HashMap::new();
    properties.insert("enableRecording".to_owned(), "true".to_owned());
    let iq = ConferenceIq::response(room.clone(), properties.clone());
    let element = Element::from(iq);
    let parsed = ConferenceIq::try_from(element).unwrap();
    assert_eq!(parsed.ready, Ready::True);
    assert_eq!(parsed.property_map(), properties);
  }
}
