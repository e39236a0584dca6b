//! Correlates outgoing IQs with their response, so any component can do a
//! request/response round-trip over the shared XMPP connection without
//! threading a response channel through the stanza dispatch loop by hand.
//! Registered once as a [`StanzaFilter`] alongside the other filters.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use xmpp_parsers::{iq::Iq, Element};

use crate::stanza_filter::StanzaFilter;

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum IqWaitError {
  #[error("no response within the request timeout")]
  Timeout,
  #[error("connection closed while awaiting a response")]
  Closed,
}

#[derive(Debug, Default)]
pub struct IqTracker {
  pending: DashMap<String, oneshot::Sender<Element>>,
}

impl IqTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sends `iq` on `tx` and waits up to `timeout` for a same-id `iq`
  /// response (result or error) to arrive through [`StanzaFilter::take`].
  pub async fn send_and_wait(
    &self,
    tx: &mpsc::Sender<Element>,
    iq: Iq,
    timeout: Duration,
  ) -> Result<Element, IqWaitError> {
    let id = iq.id.clone();
    let (response_tx, response_rx) = oneshot::channel();
    self.pending.insert(id.clone(), response_tx);

    if tx.send(iq.into()).await.is_err() {
      self.pending.remove(&id);
      return Err(IqWaitError::Closed);
    }

    let result = tokio::time::timeout(timeout, response_rx).await;
    self.pending.remove(&id);
    match result {
      Ok(Ok(element)) => Ok(element),
      Ok(Err(_)) => Err(IqWaitError::Closed),
      Err(_) => Err(IqWaitError::Timeout),
    }
  }
}

#[async_trait]
impl StanzaFilter for IqTracker {
  fn filter(&self, element: &Element) -> bool {
    (element.is("iq", "jabber:client") || element.name() == "iq")
      && element
        .attr("id")
        .map(|id| self.pending.contains_key(id))
        .unwrap_or(false)
  }

  async fn take(&self, element: Element) -> Result<()> {
    if let Some(id) = element.attr("id").map(str::to_owned) {
      if let Some((_, sender)) = self.pending.remove(&id) {
        let _ = sender.send(element);
      }
    }
    Ok(())
  }
}

#[async_trait]
impl StanzaFilter for std::sync::Arc<IqTracker> {
  fn filter(&self, element: &Element) -> bool {
    (**self).filter(element)
  }

  async fn take(&self, element: Element) -> Result<()> {
    (**self).take(element).await
  }
}
