//! Minimal rayo (`urn:xmpp:rayo:1`) dial IQ, used to dispatch a SIP call to
//! a selected member of the SIP-gateway pool. Jicofo is a rayo client here,
//! not a full rayo implementation: it only ever sends `dial` and parses the
//! `ref`/error it gets back.

use std::convert::TryFrom;

use xmpp_parsers::{iq::IqSetPayload, Element, Error};

use crate::ns::RAYO;

generate_element!(
  /// Request to place an outbound SIP call via a gateway pool member.
  Dial, "dial", RAYO,
  attributes: [
    /// The SIP URI to dial.
    to: Required<String> = "to",

    /// The room the call should be bridged into, as a URI understood by
    /// the gateway (e.g. `xmpp:room@conference.example.com`).
    from: Required<String> = "from",
  ]
);

/// The gateway's `ref` response, naming the call id it assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRef {
  pub id: String,
}

impl TryFrom<Element> for CallRef {
  type Error = Error;

  fn try_from(elem: Element) -> Result<CallRef, Error> {
    check_self!(elem, "ref", RAYO, "CallRef");
    Ok(CallRef {
      id: get_attr!(elem, "id", Required),
    })
  }
}

impl From<CallRef> for Element {
  fn from(call_ref: CallRef) -> Element {
    Element::builder("ref", RAYO).attr("id", call_ref.id).build()
  }
}

impl IqSetPayload for Dial {}
