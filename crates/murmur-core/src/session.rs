use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// Display name adopted when a fresh identity is minted without one.
pub const DEFAULT_USERNAME: &str = "anonymous";

/// A resumable chat identity: the durable user behind an ephemeral session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    pub username: String,
}

impl Session {
    pub fn new(session_id: SessionId, user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id,
            username: username.into(),
        }
    }
}

/// One row of the `connectedUsers` roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "userID")]
    pub user_id: UserId,
    pub username: String,
}

impl From<&Session> for RosterEntry {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id.clone(),
            username: session.username.clone(),
        }
    }
}

/// Project a session snapshot onto roster rows, one per session.
pub fn roster(sessions: &[Session]) -> Vec<RosterEntry> {
    sessions.iter().map(RosterEntry::from).collect()
}
