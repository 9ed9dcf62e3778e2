//! Session Store: ephemeral session tokens mapped to durable user identities.
//!
//! Sessions are upserted on every (re)connection and never deleted. The
//! memory store is process-local; the SQLite store lets several processes
//! share one logical store through a common database file.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use murmur_core::{Session, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Exact-match lookup. Blank or unknown ids resolve to `None`.
    async fn find_session(&self, session_id: &SessionId) -> Option<Session>;

    /// Create or wholesale overwrite the entry for `session.session_id`.
    async fn save_session(&self, session: Session) -> Result<(), StoreError>;

    /// Snapshot of every session, in no particular order.
    async fn find_all_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Process-local session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_session(&self, session_id: &SessionId) -> Option<Session> {
        if session_id.is_empty() {
            return None;
        }
        self.sessions.read().get(session_id).cloned()
    }

    async fn save_session(&self, session: Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn find_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().len())
    }
}

/// Session store backed by the shared `chat_sessions` table.
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn find_session(&self, session_id: &SessionId) -> Option<Session> {
        if session_id.is_empty() {
            return None;
        }
        let id = session_id.as_str().to_string();
        let result = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, user_id, username FROM chat_sessions WHERE session_id = ?1",
                )?;
                let mut rows = stmt.query([id.as_str()])?;
                match rows.next()? {
                    Some(row) => row_to_session(row).map(Some),
                    None => Ok(None),
                }
            })
            .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "session lookup failed, treating as unknown");
                None
            }
        }
    }

    #[instrument(skip(self, session), fields(session_id = %session.session_id, user_id = %session.user_id))]
    async fn save_session(&self, session: Session) -> Result<(), StoreError> {
        self.db
            .run(move |conn| {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO chat_sessions (session_id, user_id, username, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(session_id) DO UPDATE SET
                        user_id = excluded.user_id,
                        username = excluded.username,
                        updated_at = excluded.updated_at",
                    rusqlite::params![
                        session.session_id.as_str(),
                        session.user_id.as_str(),
                        session.username,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn find_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.db
            .run(|conn| {
                let mut stmt =
                    conn.prepare("SELECT session_id, user_id, username FROM chat_sessions")?;
                let mut rows = stmt.query([])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    results.push(row_to_session(row)?);
                }
                Ok(results)
            })
            .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.db
            .run(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM chat_sessions", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    Ok(Session {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "chat_sessions", "session_id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "chat_sessions", "user_id")?),
        username: row_helpers::get(row, 2, "chat_sessions", "username")?,
    })
}
