//! Periodic bridge health probe (§4.2, §5's scheduled pool): gives
//! [`BridgeRegistry::on_health`]'s `Passed`/`Failed`/`TimedOut` distinction a
//! concrete signal source by disco#info-pinging every known bridge on an
//! interval. A reply maps to `Passed`, an IQ error to `Failed`, and a
//! request timeout to `TimedOut` (the thundering-herd-avoiding case: the
//! bridge is not marked removed on a bare timeout, only on an explicit
//! error response).

use std::{convert::TryFrom, sync::Arc, time::Duration};

use xmpp_parsers::{
  disco::DiscoInfoQuery,
  iq::{Iq, IqType},
  BareJid, Jid,
};

use super::{BridgeId, BridgeRegistry, HealthResult};
use crate::{util::generate_id, xmpp::connection::Connection, xmpp::iq_tracker::IqWaitError};

fn bridge_jid(brewery: &BareJid, bridge: &BridgeId) -> Jid {
  format!("{brewery}/{}", bridge.0).parse().expect("brewery domain plus bridge id is a valid full JID")
}

async fn probe_one(connection: &Connection, brewery: &BareJid, bridge: &BridgeId, timeout: Duration) -> HealthResult {
  let iq = Iq::from_get(generate_id(), DiscoInfoQuery { node: None }).with_to(bridge_jid(brewery, bridge));
  match connection.send_iq(iq, timeout).await {
    Ok(element) => match Iq::try_from(element) {
      Ok(iq) if matches!(iq.payload, IqType::Result(_)) => HealthResult::Passed,
      _ => HealthResult::Failed,
    },
    Err(IqWaitError::Timeout) => HealthResult::TimedOut,
    Err(IqWaitError::Closed) => HealthResult::Failed,
  }
}

/// Runs until the process exits; intended to be `tokio::spawn`ed once at
/// startup alongside the connection it probes over.
pub async fn run(connection: Connection, brewery: BareJid, registry: Arc<BridgeRegistry>, interval: Duration, timeout: Duration) {
  let mut ticker = tokio::time::interval(interval);
  loop {
    ticker.tick().await;
    for bridge in registry.snapshot() {
      let connection = connection.clone();
      let brewery = brewery.clone();
      let registry = registry.clone();
      tokio::spawn(async move {
        let result = probe_one(&connection, &brewery, &bridge.id, timeout).await;
        registry.on_health(&bridge.id, result);
      });
    }
  }
}
