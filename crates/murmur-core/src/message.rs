use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ids::UserId;

/// Keys the server assigns on every stored record. Client payload fields with
/// these names are overwritten.
pub const RESERVED_KEYS: [&str; 6] = ["id", "from", "to", "fromID", "toID", "timestamp"];

/// An immutable chat record as persisted in the message log and delivered to
/// clients. The client payload is flattened alongside the routing fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// Sender display name, as supplied by the client.
    pub from: String,
    /// Receiver display name, as supplied by the client.
    pub to: String,
    #[serde(rename = "fromID")]
    pub from_id: UserId,
    #[serde(rename = "toID")]
    pub to_id: UserId,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl StoredMessage {
    /// Build a record from a client payload.
    ///
    /// Object payloads are spread into the record. Any other non-null payload
    /// is kept under a `body` key.
    pub fn compose(
        payload: Value,
        from_id: UserId,
        from: impl Into<String>,
        to_id: UserId,
        to: impl Into<String>,
    ) -> Self {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("body".into(), other);
                map
            }
        };
        for key in RESERVED_KEYS {
            body.remove(key);
        }

        Self {
            id: Uuid::now_v7().to_string(),
            from: from.into(),
            to: to.into(),
            from_id,
            to_id,
            timestamp: Utc::now().to_rfc3339(),
            body,
        }
    }

    /// Order-independent key of the pair this record belongs to.
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.from_id, &self.to_id)
    }

    /// Whether this record is part of the conversation between `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.from_id == a && &self.to_id == b) || (&self.from_id == b && &self.to_id == a)
    }
}

/// Key identifying the unordered pair `{a, b}`.
pub fn conversation_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> UserId {
        UserId::from_raw("aaaa")
    }

    fn bob() -> UserId {
        UserId::from_raw("bbbb")
    }

    #[test]
    fn compose_spreads_object_payload() {
        let msg = StoredMessage::compose(json!({"text": "hi"}), alice(), "alice", bob(), "bob");
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["text"], "hi");
        assert_eq!(wire["from"], "alice");
        assert_eq!(wire["to"], "bob");
        assert_eq!(wire["fromID"], "aaaa");
        assert_eq!(wire["toID"], "bbbb");
        assert!(wire["timestamp"].is_string());
    }

    #[test]
    fn compose_overrides_reserved_payload_keys() {
        let msg = StoredMessage::compose(
            json!({"from": "mallory", "to": "eve", "text": "x"}),
            alice(),
            "alice",
            bob(),
            "bob",
        );
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.to, "bob");
        assert!(!msg.body.contains_key("from"));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text.matches("\"from\"").count(), 1);
    }

    #[test]
    fn compose_wraps_scalar_payload() {
        let msg = StoredMessage::compose(json!("hello"), alice(), "alice", bob(), "bob");
        assert_eq!(msg.body["body"], "hello");

        let empty = StoredMessage::compose(Value::Null, alice(), "alice", bob(), "bob");
        assert!(empty.body.is_empty());
    }

    #[test]
    fn conversation_key_is_symmetric() {
        assert_eq!(conversation_key(&alice(), &bob()), conversation_key(&bob(), &alice()));
        assert_eq!(conversation_key(&alice(), &bob()), "aaaa|bbbb");
    }

    #[test]
    fn is_between_matches_either_direction() {
        let msg = StoredMessage::compose(json!({}), bob(), "bob", alice(), "alice");
        assert!(msg.is_between(&alice(), &bob()));
        assert!(msg.is_between(&bob(), &alice()));
        assert!(!msg.is_between(&alice(), &UserId::from_raw("cccc")));
    }

    #[test]
    fn deserializes_extra_fields_into_body() {
        let raw = json!({
            "id": "m1", "from": "alice", "to": "bob", "fromID": "aaaa", "toID": "bbbb",
            "timestamp": "2026-01-01T00:00:00Z", "text": "hi"
        });
        let msg: StoredMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.body.len(), 1);
        assert_eq!(msg.body["text"], "hi");
    }
}
