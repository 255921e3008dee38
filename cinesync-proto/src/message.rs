use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Metadata key under which a `load` command carries the stream URL.
pub const STREAM_URL_KEY: &str = "streamUrl";

/// Current wall clock in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Playback control action carried by a [`CommandEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Load,
    Start,
    Play,
    Pause,
    Seek,
    SyncCheck,
}

impl CommandAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Start => "start",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
            Self::SyncCheck => "sync_check",
        }
    }
}

/// A master-to-client playback command.
///
/// `target_start_time` is populated for `start` and `play` (predictive
/// start), `seek_position` only for `seek`. Unknown fields are ignored
/// on decode; a missing `action` or `sender_id` is a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub action: CommandAction,
    /// Sender wall clock at emission, ms since epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movie_id: Option<String>,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl CommandEnvelope {
    fn base(action: CommandAction, sender_id: &str) -> Self {
        Self {
            action,
            timestamp: now_ms(),
            target_start_time: None,
            video_position: None,
            seek_position: None,
            movie_id: None,
            sender_id: sender_id.to_string(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn load(sender_id: &str, movie_id: &str, stream_url: &str) -> Self {
        let mut envelope = Self::base(CommandAction::Load, sender_id);
        envelope.movie_id = Some(movie_id.to_string());
        envelope.metadata = Some(HashMap::from([(
            STREAM_URL_KEY.to_string(),
            stream_url.to_string(),
        )]));
        envelope
    }

    #[must_use]
    pub fn start(sender_id: &str, video_position: i64, target_start_time: i64) -> Self {
        let mut envelope = Self::base(CommandAction::Start, sender_id);
        envelope.video_position = Some(video_position);
        envelope.target_start_time = Some(target_start_time);
        envelope
    }

    #[must_use]
    pub fn play(sender_id: &str, video_position: i64, target_start_time: i64) -> Self {
        let mut envelope = Self::base(CommandAction::Play, sender_id);
        envelope.video_position = Some(video_position);
        envelope.target_start_time = Some(target_start_time);
        envelope
    }

    #[must_use]
    pub fn pause(sender_id: &str, video_position: i64) -> Self {
        let mut envelope = Self::base(CommandAction::Pause, sender_id);
        envelope.video_position = Some(video_position);
        envelope
    }

    #[must_use]
    pub fn seek(sender_id: &str, seek_position: i64) -> Self {
        let mut envelope = Self::base(CommandAction::Seek, sender_id);
        envelope.seek_position = Some(seek_position);
        envelope
    }

    #[must_use]
    pub fn sync_check(sender_id: &str, video_position: i64) -> Self {
        let mut envelope = Self::base(CommandAction::SyncCheck, sender_id);
        envelope.video_position = Some(video_position);
        envelope
    }

    /// Stream URL carried in a `load` command's metadata, if any.
    #[must_use]
    pub fn stream_url(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(STREAM_URL_KEY))
            .map(String::as_str)
    }
}

/// A client-to-master playback status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub client_id: String,
    pub video_position: i64,
    pub is_playing: bool,
    /// Signed, ms; positive means the client is ahead of expected.
    pub drift: i64,
    pub buffer_percentage: u8,
    pub is_ready: bool,
    pub timestamp: i64,
}

/// A device as published in the session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub display_name: String,
    pub ip: String,
    pub connected_at: i64,
    pub is_ready: bool,
}

/// Session state sent to a client that joins successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movie_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    pub command_url: String,
    pub master: DeviceInfo,
    pub clients: Vec<DeviceInfo>,
    pub created_at: i64,
}

/// First frame of the join handshake, master to client.
///
/// A rejection deliberately carries no reason; whether the PIN was
/// wrong or the session is gone is not observable on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "join", rename_all = "snake_case")]
pub enum JoinReply {
    Accepted { session: SessionSnapshot },
    Rejected,
}

/// A frame received over the command channel.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Command(CommandEnvelope),
    Status(StatusReport),
}

/// Decode one inbound text frame.
///
/// Frames carrying an `action` field are command envelopes, everything
/// else is parsed as a status report. Callers log-and-drop on error.
pub fn decode_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("action").is_some() {
        serde_json::from_value(value).map(InboundFrame::Command)
    } else {
        serde_json::from_value(value).map(InboundFrame::Status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_field_names() {
        let envelope = CommandEnvelope::start("master-1", 1500, 1_000_000);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["action"], "start");
        assert_eq!(json["senderId"], "master-1");
        assert_eq!(json["videoPosition"], 1500);
        assert_eq!(json["targetStartTime"], 1_000_000);
        // Absent optionals are omitted entirely, not serialized as null.
        assert!(json.get("seekPosition").is_none());
        assert!(json.get("movieId").is_none());
    }

    #[test]
    fn sync_check_round_trips() {
        let envelope = CommandEnvelope::sync_check("master-1", 42_000);
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded = match decode_frame(&text).unwrap() {
            InboundFrame::Command(c) => c,
            InboundFrame::Status(_) => panic!("expected command"),
        };
        assert_eq!(decoded.action, CommandAction::SyncCheck);
        assert_eq!(decoded.video_position, Some(42_000));
    }

    #[test]
    fn action_field_selects_frame_kind() {
        let status = r#"{"clientId":"c1","videoPosition":100,"isPlaying":true,"drift":-40,"bufferPercentage":97,"isReady":true,"timestamp":123}"#;
        match decode_frame(status).unwrap() {
            InboundFrame::Status(report) => {
                assert_eq!(report.client_id, "c1");
                assert_eq!(report.drift, -40);
                assert_eq!(report.buffer_percentage, 97);
            }
            InboundFrame::Command(_) => panic!("expected status"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{"action":"pause","timestamp":5,"senderId":"m","videoPosition":9,"futureField":{"a":1}}"#;
        let decoded = decode_frame(text).unwrap();
        assert!(matches!(decoded, InboundFrame::Command(_)));
    }

    #[test]
    fn missing_required_fields_fail_to_parse() {
        // No senderId on a command.
        assert!(decode_frame(r#"{"action":"play","timestamp":5}"#).is_err());
        // No clientId on a status report.
        assert!(decode_frame(r#"{"videoPosition":100,"isPlaying":true}"#).is_err());
        // Not JSON at all.
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn load_carries_stream_url_in_metadata() {
        let envelope = CommandEnvelope::load("m", "m1", "http://10.0.0.2:8080/video/m1");
        assert_eq!(envelope.stream_url(), Some("http://10.0.0.2:8080/video/m1"));
        assert_eq!(envelope.movie_id.as_deref(), Some("m1"));

        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("\"streamUrl\""));
    }

    #[test]
    fn join_reply_rejection_carries_no_detail() {
        let json = serde_json::to_value(&JoinReply::Rejected).unwrap();
        assert_eq!(json, serde_json::json!({"join": "rejected"}));
    }
}
