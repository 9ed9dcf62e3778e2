//! Shared-database event queue backing cross-process fan-out.
//!
//! Publishers append rows; every process tails the table past its own cursor.

use chrono::Utc;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusRow {
    pub seq: i64,
    pub target: String,
    pub payload: String,
    pub origin: String,
}

pub struct BusRepo {
    db: Database,
}

impl BusRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event, returning its sequence number.
    pub async fn append(&self, target: String, payload: String, origin: String) -> Result<i64, StoreError> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO bus_events (target, payload, origin, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![target, payload, origin, Utc::now().timestamp_millis()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Highest sequence number currently stored, or 0 when empty.
    pub async fn tail(&self) -> Result<i64, StoreError> {
        self.db
            .run(|conn| Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM bus_events", [], |row| row.get(0))?))
            .await
    }

    /// Events with `seq > after`, oldest first.
    pub async fn read_after(&self, after: i64, limit: u32) -> Result<Vec<BusRow>, StoreError> {
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, target, payload, origin FROM bus_events
                     WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![after, limit])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    results.push(BusRow {
                        seq: row_helpers::get(row, 0, "bus_events", "seq")?,
                        target: row_helpers::get(row, 1, "bus_events", "target")?,
                        payload: row_helpers::get(row, 2, "bus_events", "payload")?,
                        origin: row_helpers::get(row, 3, "bus_events", "origin")?,
                    });
                }
                Ok(results)
            })
            .await
    }

    /// Delete events created more than `retention_ms` ago.
    pub async fn prune(&self, retention_ms: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now().timestamp_millis() - retention_ms;
        self.db
            .run(move |conn| Ok(conn.execute("DELETE FROM bus_events WHERE created_at_ms < ?1", [cutoff])?))
            .await
    }
}
