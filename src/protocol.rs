//! Line protocol between the supervisor and a worker process.
//!
//! Commands go to the worker's stdin as one JSON object per line, tagged by
//! `action`. Events come back on stdout as `{type, sessionId, data}` and are
//! decoded once here into [`WorkerEvent`].

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerCommand {
    SendMessage {
        chat_id: String,
        text: String,
    },
    ClickButton {
        chat_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
        callback_data: String,
    },
    ClickReplyButton {
        chat_id: String,
        button_text: String,
    },
    Like {
        chat_id: String,
    },
    Dislike {
        chat_id: String,
    },
    NextProfile {
        chat_id: String,
    },
    SyncDialogs,
    Stop,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::SendMessage { .. } => "send_message",
            WorkerCommand::ClickButton { .. } => "click_button",
            WorkerCommand::ClickReplyButton { .. } => "click_reply_button",
            WorkerCommand::Like { .. } => "like",
            WorkerCommand::Dislike { .. } => "dislike",
            WorkerCommand::NextProfile { .. } => "next_profile",
            WorkerCommand::SyncDialogs => "sync_dialogs",
            WorkerCommand::Stop => "stop",
        }
    }

    /// Serialized form including the trailing newline.
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Platform ids arrive as JSON numbers or strings; both become strings.
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(deserialize_with = "de_id")]
    pub chat_id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub is_dating_bot: bool,
    #[serde(default)]
    pub has_buttons: bool,
    #[serde(default)]
    pub buttons: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackData {
    #[serde(default)]
    pub callback_data: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonClickData {
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub callback_data: Option<String>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photos: Option<Vec<String>>,
}

impl ProfileData {
    /// Key for the stored profile; falls back to the chat the profile came from.
    pub fn target_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.chat_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchData {
    #[serde(deserialize_with = "de_id")]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogSyncedData {
    #[serde(deserialize_with = "de_id")]
    pub chat_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedData {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Message(MessageData),
    Callback(CallbackData),
    ButtonClick(ButtonClickData),
    Profile(ProfileData),
    Match(MatchData),
    Error(ErrorData),
    DialogSynced(DialogSyncedData),
    Connected(ConnectedData),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Message(_) => "message",
            EventPayload::Callback(_) => "callback",
            EventPayload::ButtonClick(_) => "button_click",
            EventPayload::Profile(_) => "profile",
            EventPayload::Match(_) => "match",
            EventPayload::Error(_) => "error",
            EventPayload::DialogSynced(_) => "dialog_synced",
            EventPayload::Connected(_) => "connected",
        }
    }
}

/// A decoded worker event. Serializes back to the wire shape for feed subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerEvent {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default)]
    data: Value,
}

/// Decode one stdout line. Errors mean the line is a diagnostic, not an event.
pub fn decode_line(line: &str) -> Result<WorkerEvent, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(line.trim())?;
    let data = match envelope.data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let payload: EventPayload =
        serde_json::from_value(serde_json::json!({ "type": envelope.kind, "data": data }))?;
    Ok(WorkerEvent {
        session_id: envelope.session_id,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = WorkerCommand::SendMessage {
            chat_id: "42".into(),
            text: "hi".into(),
        };
        let line = cmd.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        let json: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(json["action"], "send_message");
        assert_eq!(json["chat_id"], "42");
        assert_eq!(json["text"], "hi");

        let json = serde_json::to_value(WorkerCommand::ClickButton {
            chat_id: "1".into(),
            message_id: None,
            callback_data: "yes".into(),
        })
        .unwrap();
        assert!(json.get("message_id").is_none());

        let json = serde_json::to_value(WorkerCommand::SyncDialogs).unwrap();
        assert_eq!(json, serde_json::json!({"action": "sync_dialogs"}));
        assert_eq!(WorkerCommand::Stop.name(), "stop");
    }

    #[test]
    fn test_decode_message_with_numeric_ids() {
        let line = r#"{"type":"message","sessionId":"acc1","data":{"message_id":9,"chat_id":-100123,"sender_id":77,"sender_username":"bob","sender_name":"Bob","text":"hey","is_bot":false,"has_buttons":true,"buttons":[[{"text":"Yes","callback_data":"y"}]]}}"#;
        let event = decode_line(line).unwrap();
        assert_eq!(event.session_id, "acc1");
        let EventPayload::Message(msg) = event.payload else {
            panic!("expected message");
        };
        assert_eq!(msg.chat_id, "-100123");
        assert_eq!(msg.sender_id.as_deref(), Some("77"));
        assert_eq!(msg.buttons[0][0].callback_data.as_deref(), Some("y"));
    }

    #[test]
    fn test_decode_string_chat_id_and_defaults() {
        let line = r#"{"type":"message","sessionId":"s","data":{"chat_id":"55","sender_id":null}}"#;
        let event = decode_line(line).unwrap();
        let EventPayload::Message(msg) = event.payload else {
            panic!("expected message");
        };
        assert_eq!(msg.chat_id, "55");
        assert!(msg.sender_id.is_none());
        assert_eq!(msg.text, "");
        assert!(msg.buttons.is_empty());
    }

    #[test]
    fn test_decode_every_kind() {
        let cases = [
            (r#"{"type":"callback","sessionId":"s","data":{"callback_data":"go","chat_id":1}}"#, "callback"),
            (r#"{"type":"button_click","sessionId":"s","data":{"button_text":"Next","chat_id":1}}"#, "button_click"),
            (r#"{"type":"profile","sessionId":"s","data":{"name":"Ann","age":22}}"#, "profile"),
            (r#"{"type":"match","sessionId":"s","data":{"user_id":5,"name":"Ann"}}"#, "match"),
            (r#"{"type":"error","sessionId":"s","data":{"message":"flood wait","action":"like"}}"#, "error"),
            (r#"{"type":"dialog_synced","sessionId":"s","data":{"chat_id":3,"name":"Chat"}}"#, "dialog_synced"),
            (r#"{"type":"connected","sessionId":"s","data":{"user_id":1,"username":"me","phone":"79990000000"}}"#, "connected"),
        ];
        for (line, kind) in cases {
            let event = decode_line(line).unwrap();
            assert_eq!(event.payload.kind(), kind);
        }
    }

    #[test]
    fn test_decode_rejects_non_events() {
        assert!(decode_line("Logged in as Bob").is_err());
        assert!(decode_line(r#"{"type":"unknown","sessionId":"s","data":{}}"#).is_err());
        assert!(decode_line(r#"{"type":"message","data":{"chat_id":1}}"#).is_err());
        assert!(decode_line(r#"{"type":"message","sessionId":"s","data":{"chat_id":[1]}}"#).is_err());
    }

    #[test]
    fn test_profile_target_falls_back_to_chat() {
        let event =
            decode_line(r#"{"type":"profile","sessionId":"s","data":{"chat_id":900,"name":"Ann"}}"#)
                .unwrap();
        let EventPayload::Profile(profile) = event.payload else {
            panic!("expected profile");
        };
        assert_eq!(profile.target_id(), Some("900"));
    }

    #[test]
    fn test_event_serializes_to_wire_shape() {
        let event = WorkerEvent {
            session_id: "acc1".into(),
            payload: EventPayload::Error(ErrorData {
                message: "boom".into(),
                action: None,
            }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["sessionId"], "acc1");
        assert_eq!(json["data"]["message"], "boom");
    }
}
