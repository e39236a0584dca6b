use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use jicofo_core::{
  bridge::{health_check, selection::RegionGroups, BridgePresenceWatcher, BridgeRegistry, RegionBasedStrategy},
  clock::SystemClock,
  config::Config,
  conference_registry::{ConferenceRegistry, ConferenceRegistryDeps},
  focus_iq::FocusIqHandler,
  init_tracing,
  participant::OfferOptions,
  source_graph::SourceGraphLimits,
  xmpp::connection::{Connection, Credentials},
};
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

mod http;

/// `--host`/`--port` address the XMPP server's WebSocket endpoint directly
/// (this codebase speaks the WebSocket binding, not the legacy XMPP
/// component protocol); `--secret` is accepted as a synonym for
/// `--user_password` for compatibility with that protocol's naming.
#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "jicofo", about = "Conference focus for a Jitsi Meet deployment.")]
struct Opt {
  #[structopt(long, env = "JICOFO_CONFIG", help = "Path to a TOML config file")]
  config: Option<String>,

  #[structopt(long, env = "JICOFO_HOST", help = "XMPP server host")]
  host: Option<String>,

  #[structopt(long, env = "JICOFO_PORT", help = "XMPP server WebSocket port")]
  port: Option<u16>,

  #[structopt(long, env = "JICOFO_DOMAIN")]
  domain: Option<String>,

  #[structopt(long, env = "JICOFO_SUBDOMAIN", help = "The brewery MUC subdomain bridges announce themselves in")]
  subdomain: Option<String>,

  #[structopt(long, env = "JICOFO_USER_DOMAIN")]
  user_domain: Option<String>,

  #[structopt(long, env = "JICOFO_USER_NAME")]
  user_name: Option<String>,

  #[structopt(long, env = "JICOFO_USER_PASSWORD", hide_env_values = true)]
  user_password: Option<String>,

  #[structopt(long, env = "JICOFO_SECRET", hide_env_values = true)]
  secret: Option<String>,

  #[cfg(feature = "tls-insecure")]
  #[structopt(long, help = "Disable TLS certificate verification (use with extreme caution)")]
  tls_insecure: bool,

  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,
}

#[actix_web::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let mut config = Config::load(opt.config.as_deref()).context("failed to load configuration")?;

  if let (Some(host), Some(port)) = (opt.host.as_deref(), opt.port) {
    config.xmpp.websocket_url = format!("wss://{host}:{port}/xmpp-websocket");
  }
  if let Some(domain) = opt.domain {
    config.xmpp.domain = domain;
  }
  if let Some(subdomain) = opt.subdomain {
    config.bridge.brewery_muc = format!("jvbbrewery@internal.{subdomain}.{}", config.xmpp.domain);
  }
  if let Some(user_domain) = opt.user_domain {
    config.xmpp.user_domain = user_domain;
  }
  if let Some(user_name) = opt.user_name {
    config.xmpp.user_name = user_name;
  }
  if let Some(user_password) = opt.user_password.or(opt.secret) {
    config.xmpp.user_password = user_password;
  }
  #[cfg(feature = "tls-insecure")]
  if opt.tls_insecure {
    config.xmpp.tls_insecure = true;
  }

  let (connection, background) = Connection::new(
    &config.xmpp.websocket_url,
    &config.xmpp.user_domain,
    Credentials {
      username: config.xmpp.user_name.clone(),
      password: config.xmpp.user_password.clone(),
    },
    config.xmpp.tls_insecure,
  )
  .await
  .context("failed to build XMPP connection")?;

  tokio::spawn(background);

  let brewery: xmpp_parsers::BareJid = config
    .bridge
    .brewery_muc
    .parse()
    .context("invalid brewery MUC JID")?;

  let bridge_registry = Arc::new(BridgeRegistry::new());

  connection
    .add_stanza_filter(BridgePresenceWatcher::new(brewery.clone(), bridge_registry.clone()))
    .await;

  connection.connect().await.context("failed to connect to XMPP server")?;

  let focus_jid = connection.jid().await.context("connection did not yield a bound JID")?;
  info!("focus bound as {}", focus_jid);

  let region_groups = RegionGroups::new(config.bridge.region_groups.iter().cloned().collect());
  let strategy = Arc::new(RegionBasedStrategy::new(region_groups, config.bridge.max_bridge_participants));
  let clock = Arc::new(SystemClock);

  let registry_deps = ConferenceRegistryDeps {
    connection: connection.clone(),
    brewery: brewery.clone(),
    bridge_registry: bridge_registry.clone(),
    strategy,
    clock,
    offer_options: OfferOptions {
      audio: config.conference.audio,
      video: config.conference.video,
      ..OfferOptions::default()
    },
    ownership_policy: config.conference.ownership_policy,
    iq_timeout: config.conference.iq_timeout(),
    grace_period: config.conference.empty_grace_period(),
    max_restarts_per_window: config.conference.max_restarts_per_window,
    restart_window: config.conference.restart_window(),
    source_graph_limits: SourceGraphLimits {
      max_ssrcs_per_user: config.conference.max_ssrcs_per_user,
      max_ssrc_groups_per_user: config.conference.max_ssrc_groups_per_user,
    },
  };
  let conference_registry = ConferenceRegistry::new(registry_deps, Duration::from_secs(60));

  connection
    .add_stanza_filter(FocusIqHandler::new(focus_jid.clone(), connection.clone(), conference_registry.clone()))
    .await;

  tokio::spawn(health_check::run(
    connection.clone(),
    brewery,
    bridge_registry.clone(),
    Duration::from_secs(config.bridge.health_interval_secs),
    config.conference.iq_timeout(),
  ));

  if config.http.enabled {
    let state = actix_web::web::Data::new(http::AppState {
      bridges: bridge_registry.clone(),
      conferences: conference_registry.clone(),
      focus_iq: FocusIqHandler::new(focus_jid, connection, conference_registry),
      xmpp_alive: Arc::new(std::sync::atomic::AtomicBool::new(true)),
    });
    let host = config.http.host.clone();
    let port = config.http.port;
    tokio::spawn(async move {
      if let Err(e) = http::serve(&host, port, state).await {
        warn!("HTTP server exited: {:?}", e);
      }
    });
  }

  ctrl_c().await.context("failed to listen for ctrl-c")?;
  info!("shutting down");

  Ok(())
}
