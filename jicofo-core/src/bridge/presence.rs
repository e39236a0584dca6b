//! Watches the JVB brewery MUC (§6) and turns bridge presence into
//! [`BridgeRegistry`] mutations: a bridge's own `stats` extension carries its
//! region, version and load; leaving the room withdraws it. This is the
//! producer side of the registry -- everything else in §4.2 only consumes
//! the resulting snapshot/event stream.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use xmpp_parsers::{presence::Type as PresenceType, BareJid, Element, Jid, Presence};

use super::{BridgeId, BridgeRegistry, HealthResult, LoadReport};
use crate::stanza_filter::StanzaFilter;

const STATS_NS: &str = "http://jitsi.org/protocol/colibri";

fn bare_of(jid: &Jid) -> BareJid {
  match jid {
    Jid::Bare(bare) => bare.clone(),
    Jid::Full(full) => full.to_bare(),
  }
}

fn stat(stats: &Element, name: &str) -> Option<String> {
  stats
    .children()
    .find(|child| child.name() == "stat" && child.attr("name") == Some(name))
    .and_then(|child| child.attr("value"))
    .map(ToOwned::to_owned)
}

/// Registered as a [`StanzaFilter`] on the focus's own connection for
/// presence originating in the brewery room.
#[derive(Debug)]
pub struct BridgePresenceWatcher {
  brewery: BareJid,
  registry: Arc<BridgeRegistry>,
}

impl BridgePresenceWatcher {
  pub fn new(brewery: BareJid, registry: Arc<BridgeRegistry>) -> Self {
    Self { brewery, registry }
  }
}

#[async_trait]
impl StanzaFilter for BridgePresenceWatcher {
  fn filter(&self, element: &Element) -> bool {
    if element.name() != "presence" {
      return false;
    }
    let Some(from) = element.attr("from").and_then(|from| from.parse::<Jid>().ok()) else {
      return false;
    };
    bare_of(&from) == self.brewery
  }

  async fn take(&self, element: Element) -> Result<()> {
    let presence = Presence::try_from(element)?;
    let Some(Jid::Full(from)) = presence.clone().from
    else {
      return Ok(());
    };
    let bridge_id = BridgeId::from(from.resource.clone());

    if presence.type_ == PresenceType::Unavailable {
      self.registry.remove(&bridge_id);
      return Ok(());
    }

    let Some(stats) = presence.payloads.iter().find(|p| p.is("stats", STATS_NS))
    else {
      debug!("brewery presence from {} carried no stats extension, ignoring", bridge_id);
      return Ok(());
    };

    let region = stat(stats, "region").unwrap_or_default();
    let version = stat(stats, "version").unwrap_or_default();
    let stress = stat(stats, "stress_level").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let participants = stat(stats, "participants").and_then(|v| v.parse().ok()).unwrap_or(0);

    self.registry.add_or_update(
      bridge_id.clone(),
      LoadReport { region, version, stress, participants },
    );

    if let Some(draining) = stat(stats, "graceful_shutdown") {
      self.registry.set_graceful_shutdown(&bridge_id, draining == "true");
    }

    if let Some(healthy) = stat(stats, "healthy") {
      self.registry.on_health(
        &bridge_id,
        if healthy == "true" { HealthResult::Passed } else { HealthResult::Failed },
      );
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use xmpp_parsers::FullJid;

  use super::*;

  fn stats_element(pairs: &[(&str, &str)]) -> Element {
    let mut builder = Element::builder("stats", STATS_NS);
    for (name, value) in pairs {
      builder = builder.append(Element::builder("stat", STATS_NS).attr("name", *name).attr("value", *value).build());
    }
    builder.build()
  }

  fn announce(from: &FullJid, pairs: &[(&str, &str)]) -> Element {
    Presence::new(PresenceType::None)
      .with_from(from.clone())
      .with_payloads(vec![stats_element(pairs)])
      .into()
  }

  #[tokio::test]
  async fn announcement_registers_the_bridge_with_its_reported_load() {
    let registry = Arc::new(BridgeRegistry::new());
    let brewery: BareJid = "jvbbrewery.example.com".parse().unwrap();
    let watcher = BridgePresenceWatcher::new(brewery.clone(), registry.clone());
    let from: FullJid = "jvbbrewery.example.com/jvb1".parse().unwrap();

    let element = announce(&from, &[("region", "eu"), ("version", "2.3"), ("stress_level", "0.2"), ("participants", "5")]);
    assert!(watcher.filter(&element));
    watcher.take(element).await.unwrap();

    let bridge = registry.get(&"jvb1".into()).unwrap();
    assert_eq!(bridge.region, "eu");
    assert_eq!(bridge.version, "2.3");
    assert_eq!(bridge.stress, 0.2);
    assert!(bridge.operational);
  }

  #[tokio::test]
  async fn unavailable_presence_withdraws_the_bridge() {
    let registry = Arc::new(BridgeRegistry::new());
    let brewery: BareJid = "jvbbrewery.example.com".parse().unwrap();
    let watcher = BridgePresenceWatcher::new(brewery, registry.clone());
    let from: FullJid = "jvbbrewery.example.com/jvb1".parse().unwrap();

    let joined = announce(&from, &[("region", "eu"), ("version", "2.3")]);
    watcher.take(joined).await.unwrap();
    assert!(registry.get(&"jvb1".into()).is_some());

    let left: Element = Presence::new(PresenceType::Unavailable).with_from(from).into();
    watcher.take(left).await.unwrap();
    assert!(registry.get(&"jvb1".into()).is_none());
  }
}
