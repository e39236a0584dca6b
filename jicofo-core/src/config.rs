//! Layered startup configuration (§6): defaults, then an optional config
//! file, then environment variables (`JICOFO_*`), loaded once into an
//! immutable [`Config`]. No live reconfiguration.

use std::time::Duration;

use serde::Deserialize;

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
  pub websocket_url: String,
  pub domain: String,
  pub user_domain: String,
  pub user_name: String,
  pub user_password: String,
  pub tls_insecure: bool,
}

impl Default for XmppConfig {
  fn default() -> Self {
    Self {
      websocket_url: "wss://localhost:5280/xmpp-websocket".to_owned(),
      domain: "meet.jitsi".to_owned(),
      user_domain: "auth.meet.jitsi".to_owned(),
      user_name: "focus".to_owned(),
      user_password: String::new(),
      tls_insecure: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
  pub brewery_muc: String,
  pub health_interval_secs: u64,
  pub max_bridge_participants: u32,
  pub region_groups: Vec<(String, String)>,
}

impl Default for BridgeConfig {
  fn default() -> Self {
    Self {
      brewery_muc: "jvbbrewery@internal.meet.jitsi".to_owned(),
      health_interval_secs: 10,
      max_bridge_participants: 100,
      region_groups: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipPolicy {
  FirstMemberOwner,
  AllAuthenticatedUsers,
}

impl Default for OwnershipPolicy {
  fn default() -> Self {
    OwnershipPolicy::FirstMemberOwner
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
  pub ownership_policy: OwnershipPolicy,
  pub empty_grace_period_secs: u64,
  pub iq_timeout_secs: u64,
  pub max_restarts_per_window: usize,
  pub restart_window_secs: u64,
  pub max_ssrcs_per_user: usize,
  pub max_ssrc_groups_per_user: usize,
  #[serde(default = "default_true")]
  pub audio: bool,
  #[serde(default = "default_true")]
  pub video: bool,
}

impl Default for ConferenceConfig {
  fn default() -> Self {
    Self {
      ownership_policy: OwnershipPolicy::default(),
      empty_grace_period_secs: 20,
      iq_timeout_secs: 10,
      max_restarts_per_window: 3,
      restart_window_secs: 60,
      max_ssrcs_per_user: 20,
      max_ssrc_groups_per_user: 10,
      audio: true,
      video: true,
    }
  }
}

impl ConferenceConfig {
  pub fn empty_grace_period(&self) -> Duration {
    Duration::from_secs(self.empty_grace_period_secs)
  }

  pub fn iq_timeout(&self) -> Duration {
    Duration::from_secs(self.iq_timeout_secs)
  }

  pub fn restart_window(&self) -> Duration {
    Duration::from_secs(self.restart_window_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub enabled: bool,
  pub host: String,
  pub port: u16,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self { enabled: false, host: "127.0.0.1".to_owned(), port: 8888 }
  }
}

/// Top-level configuration assembled once at startup and never mutated
/// afterwards; a fresh `Config` is the only way to pick up a changed
/// setting (restart required).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub xmpp: XmppConfig,
  pub bridge: BridgeConfig,
  pub conference: ConferenceConfig,
  pub http: HttpConfig,
}

impl Config {
  /// Loads defaults, then `path` if given, then `JICOFO_*` environment
  /// variables (double-underscore-separated, e.g. `JICOFO_XMPP__DOMAIN`),
  /// in ascending precedence.
  pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
    if let Some(path) = path {
      builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(config::Environment::with_prefix("JICOFO").separator("__"));
    builder.build()?.try_deserialize()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_load_without_a_file_or_environment() {
    let config = Config::load(None).expect("defaults alone must be a valid config");
    assert_eq!(config.xmpp.user_name, "focus");
    assert_eq!(config.conference.max_restarts_per_window, 3);
  }

  #[test]
  fn environment_overrides_defaults() {
    std::env::set_var("JICOFO_XMPP__USER_NAME", "env-focus");
    let config = Config::load(None).expect("env override must still be valid");
    std::env::remove_var("JICOFO_XMPP__USER_NAME");
    assert_eq!(config.xmpp.user_name, "env-focus");
  }
}
