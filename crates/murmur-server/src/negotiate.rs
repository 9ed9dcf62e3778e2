//! Per-connection identity handshake.

use murmur_core::{Handshake, Session, SessionId, UserId, DEFAULT_USERNAME};
use murmur_store::SessionStore;
use tracing::debug;

/// The identity a connection carries for its whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    /// Whether an existing session was adopted.
    pub resumed: bool,
}

impl Identity {
    pub fn session(&self) -> Session {
        Session::new(self.session_id.clone(), self.user_id.clone(), self.username.clone())
    }
}

/// Resolve the identity of a new connection.
///
/// A presented session token that resolves is adopted verbatim. Anything else
/// (absent, blank, unknown) mints a fresh session and user; this never fails.
pub async fn negotiate(store: &dyn SessionStore, handshake: &Handshake) -> Identity {
    if let Some(session_id) = handshake.session_id() {
        if let Some(existing) = store.find_session(&session_id).await {
            debug!(session_id = %existing.session_id, user_id = %existing.user_id, "Resuming session");
            return Identity {
                session_id: existing.session_id,
                user_id: existing.user_id,
                username: existing.username,
                resumed: true,
            };
        }
        debug!(session_id = %session_id, "Presented session not found, minting a new one");
    }

    Identity {
        session_id: SessionId::new(),
        user_id: UserId::new(),
        username: handshake.username().unwrap_or(DEFAULT_USERNAME).to_string(),
        resumed: false,
    }
}
