/// Jitsi Meet-specific elements embedded in standard Jingle/SSRC elements
/// (e.g. `ssrc-info/@owner`, muted-state presence extensions).
pub const JITSI_MEET: &str = "http://jitsi.org/jitmeet";

/// The Colibri WebSocket transport extension carried inside a Jingle
/// ICE-UDP transport, and the namespace of Colibri v2 itself.
pub const JITSI_COLIBRI: &str = "http://jitsi.org/protocol/colibri";

/// Colibri v2: the conference-modify IQ payload sent to bridges.
pub const COLIBRI2: &str = "jitsi:colibri2";

/// The focus's own conference-request IQ, used by participants to request
/// that a conference be created/looked up.
pub const JITSI_FOCUS: &str = "http://jitsi.org/protocol/focus";

/// XEP-0215: External Service Discovery (STUN/TURN discovery).
pub const EXTDISCO: &str = "urn:xmpp:extdisco:2";

/// XEP-0327-ish rayo dial, used by Jicofo to dispatch SIP gateway jobs.
pub const RAYO: &str = "urn:xmpp:rayo:1";

/// Jitsi Meet recorder (Jibri) control IQ namespace.
pub const JITSI_RECORDING: &str = "http://jitsi.org/protocol/recording";
