//! Realtime wire protocol.
//!
//! Every WebSocket text frame is a JSON envelope `{ "event": <name>, "data": <payload> }`.
//! Event names and payload field names are part of the client contract.

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::message::StoredMessage;
use crate::session::RosterEntry;

pub const EVENT_SESSION: &str = "session";
pub const EVENT_CONNECTED_USERS: &str = "connectedUsers";
pub const EVENT_NEW_MESSAGE: &str = "newMessage";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid payload for {event}: {detail}")]
    InvalidPayload { event: &'static str, detail: String },
}

/// Negotiation payload presented when the connection is established.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Handshake {
    /// The presented session token, if it is non-blank.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SessionId::from_raw)
    }

    /// The presented display name, if it is non-blank.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Events pushed from the server to connected clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Sent once, to the connecting client only.
    #[serde(rename = "session")]
    Session {
        #[serde(rename = "sessionID")]
        session_id: SessionId,
        #[serde(rename = "userID")]
        user_id: UserId,
    },

    /// Full roster, broadcast to every connection on each join.
    #[serde(rename = "connectedUsers")]
    ConnectedUsers(Vec<RosterEntry>),

    /// The whole conversation between the two parties of the latest message.
    #[serde(rename = "newMessage")]
    NewMessage {
        #[serde(rename = "newMessage")]
        messages: Vec<StoredMessage>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => EVENT_SESSION,
            Self::ConnectedUsers(_) => EVENT_CONNECTED_USERS,
            Self::NewMessage { .. } => EVENT_NEW_MESSAGE,
        }
    }

    /// Serialize into a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Body of an inbound `newMessage` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessageRequest {
    #[serde(rename = "newMessage")]
    pub payload: serde_json::Value,
    #[serde(rename = "receiverID")]
    pub receiver_id: UserId,
    /// Receiver display name, trusted as supplied.
    pub receiver: String,
    /// Sender display name, trusted as supplied.
    pub sender: String,
}

/// Events sent by clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "newMessage")]
    NewMessage(NewMessageRequest),
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match frame.event.as_str() {
            EVENT_NEW_MESSAGE => {
                let request: NewMessageRequest =
                    serde_json::from_value(frame.data).map_err(|e| ProtocolError::InvalidPayload {
                        event: EVENT_NEW_MESSAGE,
                        detail: e.to_string(),
                    })?;
                if request.payload.is_null() {
                    return Err(ProtocolError::InvalidPayload {
                        event: EVENT_NEW_MESSAGE,
                        detail: "missing newMessage payload".into(),
                    });
                }
                if request.receiver_id.is_empty() {
                    return Err(ProtocolError::InvalidPayload {
                        event: EVENT_NEW_MESSAGE,
                        detail: "empty receiverID".into(),
                    });
                }
                Ok(Self::NewMessage(request))
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_event_wire_format() {
        let event = ServerEvent::Session {
            session_id: SessionId::from_raw("s1"),
            user_id: UserId::from_raw("u1"),
        };
        let wire: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(wire, json!({"event": "session", "data": {"sessionID": "s1", "userID": "u1"}}));
    }

    #[test]
    fn connected_users_wire_format() {
        let event = ServerEvent::ConnectedUsers(vec![RosterEntry {
            user_id: UserId::from_raw("u1"),
            username: "alice".into(),
        }]);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "connectedUsers");
        assert_eq!(wire["data"][0]["userID"], "u1");
        assert_eq!(wire["data"][0]["username"], "alice");
    }

    #[test]
    fn new_message_wire_format() {
        let msg = StoredMessage::compose(
            json!({"text": "hi"}),
            UserId::from_raw("a"),
            "alice",
            UserId::from_raw("b"),
            "bob",
        );
        let event = ServerEvent::NewMessage { messages: vec![msg] };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "newMessage");
        assert_eq!(wire["data"]["newMessage"][0]["text"], "hi");

        let back: ServerEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back.name(), EVENT_NEW_MESSAGE);
    }

    #[test]
    fn parse_new_message() {
        let frame = r#"{"event":"newMessage","data":{"newMessage":{"text":"hi"},"receiverID":"b","receiver":"bob","sender":"alice"}}"#;
        let ClientEvent::NewMessage(req) = ClientEvent::parse(frame).unwrap();
        assert_eq!(req.receiver_id.as_str(), "b");
        assert_eq!(req.receiver, "bob");
        assert_eq!(req.sender, "alice");
        assert_eq!(req.payload["text"], "hi");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let frame = r#"{"event":"newMessage","data":{"newMessage":{"text":"hi"},"receiver":"bob"}}"#;
        assert!(matches!(
            ClientEvent::parse(frame),
            Err(ProtocolError::InvalidPayload { event: "newMessage", .. })
        ));

        let no_payload = r#"{"event":"newMessage","data":{"receiverID":"b","receiver":"bob","sender":"alice"}}"#;
        assert!(ClientEvent::parse(no_payload).is_err());
    }

    #[test]
    fn parse_rejects_garbage_and_unknown_events() {
        assert!(matches!(ClientEvent::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"typing","data":{}}"#),
            Err(ProtocolError::UnknownEvent(name)) if name == "typing"
        ));
    }

    #[test]
    fn client_event_roundtrips_through_parse() {
        let event = ClientEvent::NewMessage(NewMessageRequest {
            payload: json!({"text": "yo"}),
            receiver_id: UserId::from_raw("b"),
            receiver: "bob".into(),
            sender: "alice".into(),
        });
        let parsed = ClientEvent::parse(&event.to_frame().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn handshake_ignores_blank_values() {
        let hs: Handshake = serde_json::from_value(json!({"sessionID": "  ", "username": ""})).unwrap();
        assert!(hs.session_id().is_none());
        assert!(hs.username().is_none());

        let hs: Handshake = serde_json::from_value(json!({"sessionID": "abc", "username": "alice"})).unwrap();
        assert_eq!(hs.session_id().unwrap().as_str(), "abc");
        assert_eq!(hs.username(), Some("alice"));

        let empty: Handshake = serde_json::from_value(json!({})).unwrap();
        assert!(empty.session_id().is_none());
    }
}
