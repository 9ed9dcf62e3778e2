use std::sync::Arc;

use murmur_store::{
    Database, MemoryMessageLog, MemorySessionStore, MessageLog, SessionStore, SqliteMessageLog,
    SqliteSessionStore,
};

use crate::bus::{DeliveryBus, LocalBus, SqliteBus};
use crate::config::ServerConfig;

/// The stores and bus a server process runs against.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageLog>,
    pub bus: Arc<dyn DeliveryBus>,
}

impl Services {
    /// Process-local state. Only correct for a single process.
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            messages: Arc::new(MemoryMessageLog::new()),
            bus: Arc::new(LocalBus::new()),
        }
    }

    /// State shared by every process that opens the same database file.
    pub fn shared(db: Database, config: &ServerConfig) -> Self {
        Self {
            sessions: Arc::new(SqliteSessionStore::new(db.clone())),
            messages: Arc::new(SqliteMessageLog::new(db.clone())),
            bus: Arc::new(SqliteBus::new(
                db,
                config.bus_poll_interval(),
                config.bus_retention(),
            )),
        }
    }
}
