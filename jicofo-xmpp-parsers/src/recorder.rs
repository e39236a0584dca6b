//! Recorder (Jibri) control IQ: dispatches a start/stop recording request
//! to a selected member of the recorder pool.

use xmpp_parsers::iq::IqSetPayload;

use crate::ns::JITSI_RECORDING;

generate_attribute!(
  /// The recording action requested.
  Action, "action", {
    /// Start recording (or live streaming, depending on `stream_id`).
    Start => "start",

    /// Stop a previously-started session.
    Stop => "stop",
  }
);

generate_attribute!(
  /// The current/reported status of a recording session.
  Status, "status", {
    Pending => "pending",
    Started => "started",
    Off => "off",
    Failed => "failed",
  }
);

generate_element!(
  /// Control message sent to (and echoed back by) the selected recorder.
  JibriIq, "jibri", JITSI_RECORDING,
  attributes: [
    /// The requested action, present on requests.
    action: Option<Action> = "action",

    /// The session's current status, present on responses/notifications.
    status: Option<Status> = "status",

    /// Opaque id correlating start/stop pairs and status updates.
    session_id: Option<String> = "session-id",

    /// The room being recorded.
    room: Option<String> = "room",

    /// Set when this is a live-stream request rather than a file recording.
    stream_id: Option<String> = "stream-id",
  ]
);

impl IqSetPayload for JibriIq {}
