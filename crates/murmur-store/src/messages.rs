//! Message Log: append-only chat records, queried by conversation pair.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::instrument;

use murmur_core::{conversation_key, StoredMessage, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Append one record. Atomic per call.
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError>;

    /// Every record, oldest first.
    async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError>;

    /// Records exchanged between `a` and `b` in either direction, oldest first.
    async fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<StoredMessage>, StoreError>;
}

/// In-process log for single-process deployments without a database file.
#[derive(Default)]
pub struct MemoryMessageLog {
    records: Mutex<Vec<StoredMessage>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.records.lock().push(message);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.records.lock().clone())
    }

    async fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }
}

/// Log backed by the `messages` table, indexed by conversation key.
pub struct SqliteMessageLog {
    db: Database,
}

impl SqliteMessageLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, from_id, to_id, from_name, to_name, timestamp, body FROM messages";

#[async_trait]
impl MessageLog for SqliteMessageLog {
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError> {
        let body = serde_json::to_string(&message.body)?;
        let key = message.conversation_key();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, conversation_key, from_id, to_id, from_name, to_name, timestamp, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        message.id,
                        key,
                        message.from_id.as_str(),
                        message.to_id.as_str(),
                        message.from,
                        message.to,
                        message.timestamp,
                        body,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_all(&self) -> Result<Vec<StoredMessage>, StoreError> {
        self.db
            .run(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
                let mut rows = stmt.query([])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    results.push(row_to_message(row)?);
                }
                Ok(results)
            })
            .await
    }

    #[instrument(skip(self), fields(a = %a, b = %b))]
    async fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<StoredMessage>, StoreError> {
        let key = conversation_key(a, b);
        let (a, b) = (a.as_str().to_string(), b.as_str().to_string());
        self.db
            .run(move |conn| {
                // The key narrows the scan; ids may contain the separator, so
                // the pair itself is matched exactly.
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE conversation_key = ?1
                       AND ((from_id = ?2 AND to_id = ?3) OR (from_id = ?3 AND to_id = ?2))
                     ORDER BY seq ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![key, a, b])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    results.push(row_to_message(row)?);
                }
                Ok(results)
            })
            .await
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let body: String = row_helpers::get(row, 6, "messages", "body")?;
    Ok(StoredMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        from_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "messages", "from_id")?),
        to_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "to_id")?),
        from: row_helpers::get(row, 3, "messages", "from_name")?,
        to: row_helpers::get(row, 4, "messages", "to_name")?,
        timestamp: row_helpers::get(row, 5, "messages", "timestamp")?,
        body: row_helpers::parse_object(&body, "messages", "body")?,
    })
}
