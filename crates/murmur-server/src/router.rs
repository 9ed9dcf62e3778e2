//! Direct-message routing.

use murmur_core::{NewMessageRequest, ServerEvent, StoredMessage};
use tracing::debug;

use crate::bus::{Envelope, Target};
use crate::error::ServerError;
use crate::negotiate::Identity;
use crate::services::Services;

/// Persist a direct message and push the full conversation to both parties.
///
/// The sender's userID comes from the connection, never from the payload.
/// The conversation is read back after the append, so it always contains the
/// new record. Returns the conversation length.
pub async fn route_message(
    services: &Services,
    sender: &Identity,
    request: NewMessageRequest,
) -> Result<usize, ServerError> {
    let NewMessageRequest {
        payload,
        receiver_id,
        receiver,
        sender: sender_name,
    } = request;

    let record = StoredMessage::compose(payload, sender.user_id.clone(), sender_name, receiver_id.clone(), receiver);
    let message_id = record.id.clone();
    services.messages.save(record).await?;

    let conversation = services.messages.conversation(&sender.user_id, &receiver_id).await?;
    let len = conversation.len();
    debug!(message_id = %message_id, receiver_id = %receiver_id, conversation_len = len, "Message stored");

    let event = ServerEvent::NewMessage { messages: conversation };
    let to_receiver = Envelope::new(Target::User(receiver_id.clone()), &event)?;
    services.bus.publish(to_receiver).await?;

    if receiver_id != sender.user_id {
        let to_sender = Envelope::new(Target::User(sender.user_id.clone()), &event)?;
        services.bus.publish(to_sender).await?;
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_core::{SessionId, UserId};
    use murmur_store::{MemoryMessageLog, MessageLog, StoreError};
    use serde_json::json;
    use std::sync::Arc;

    /// Delegates to a memory log, failing either every save or every read.
    struct BrokenLog {
        inner: MemoryMessageLog,
        fail_save: bool,
        fail_read: bool,
    }

    #[async_trait]
    impl MessageLog for BrokenLog {
        async fn save(&self, message: StoredMessage) -> Result<(), StoreError> {
            if self.fail_save {
                return Err(StoreError::Database("disk I/O error".into()));
            }
            self.inner.save(message).await
        }

        async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
            self.inner.get_all().await
        }

        async fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<StoredMessage>, StoreError> {
            if self.fail_read {
                return Err(StoreError::Database("database is locked".into()));
            }
            self.inner.conversation(a, b).await
        }
    }

    fn with_log(fail_save: bool, fail_read: bool) -> Services {
        Services {
            messages: Arc::new(BrokenLog {
                inner: MemoryMessageLog::new(),
                fail_save,
                fail_read,
            }),
            ..Services::in_memory()
        }
    }

    fn identity(uid: &str, name: &str) -> Identity {
        Identity {
            session_id: SessionId::from_raw(format!("s-{uid}")),
            user_id: UserId::from_raw(uid),
            username: name.into(),
            resumed: false,
        }
    }

    fn request(text: &str, to: &str, to_name: &str, from_name: &str) -> NewMessageRequest {
        NewMessageRequest {
            payload: json!({ "text": text }),
            receiver_id: UserId::from_raw(to),
            receiver: to_name.into(),
            sender: from_name.into(),
        }
    }

    #[tokio::test]
    async fn publishes_conversation_to_both_parties() {
        let services = Services::in_memory();
        let mut rx = services.bus.subscribe();
        let alice = identity("u-alice", "alice");

        let len = route_message(&services, &alice, request("hi", "u-bob", "bob", "alice"))
            .await
            .unwrap();
        assert_eq!(len, 1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.target, Target::User(UserId::from_raw("u-bob")));
        assert_eq!(second.target, Target::User(UserId::from_raw("u-alice")));
        assert_eq!(first.frame, second.frame);

        let frame: serde_json::Value = serde_json::from_str(&first.frame).unwrap();
        assert_eq!(frame["event"], "newMessage");
        let record = &frame["data"]["newMessage"][0];
        assert_eq!(record["text"], "hi");
        assert_eq!(record["from"], "alice");
        assert_eq!(record["to"], "bob");
        assert_eq!(record["fromID"], "u-alice");
        assert_eq!(record["toID"], "u-bob");
    }

    #[tokio::test]
    async fn conversation_grows_in_both_directions() {
        let services = Services::in_memory();
        let alice = identity("u-alice", "alice");
        let bob = identity("u-bob", "bob");

        route_message(&services, &alice, request("hi", "u-bob", "bob", "alice")).await.unwrap();
        let len = route_message(&services, &bob, request("hey", "u-alice", "alice", "bob"))
            .await
            .unwrap();
        assert_eq!(len, 2);

        // A third party's conversation is separate.
        let carol = identity("u-carol", "carol");
        let len = route_message(&services, &carol, request("yo", "u-bob", "bob", "carol"))
            .await
            .unwrap();
        assert_eq!(len, 1);
        assert_eq!(services.messages.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn spoofed_sender_id_in_payload_is_ignored() {
        let services = Services::in_memory();
        let mut rx = services.bus.subscribe();
        let alice = identity("u-alice", "alice");

        let mut req = request("hi", "u-bob", "bob", "alice");
        req.payload = json!({ "text": "hi", "fromID": "u-mallory" });
        route_message(&services, &alice, req).await.unwrap();

        let envelope = rx.recv().await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&envelope.frame).unwrap();
        assert_eq!(frame["data"]["newMessage"][0]["fromID"], "u-alice");
    }

    #[tokio::test]
    async fn message_to_self_is_published_once() {
        let services = Services::in_memory();
        let mut rx = services.bus.subscribe();
        let alice = identity("u-alice", "alice");

        route_message(&services, &alice, request("note", "u-alice", "alice", "alice"))
            .await
            .unwrap();

        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_save_publishes_nothing() {
        let services = with_log(true, false);
        let mut rx = services.bus.subscribe();
        let alice = identity("u-alice", "alice");

        let result = route_message(&services, &alice, request("hi", "u-bob", "bob", "alice")).await;
        assert!(matches!(result, Err(ServerError::Store(StoreError::Database(_)))));
        assert!(rx.try_recv().is_err());
        assert!(services.messages.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_conversation_read_publishes_nothing() {
        let services = with_log(false, true);
        let mut rx = services.bus.subscribe();
        let alice = identity("u-alice", "alice");

        let result = route_message(&services, &alice, request("hi", "u-bob", "bob", "alice")).await;
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
        // The append itself went through.
        assert_eq!(services.messages.get_all().await.unwrap().len(), 1);
    }
}
