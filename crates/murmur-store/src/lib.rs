pub mod bus;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use bus::{BusRepo, BusRow};
pub use database::Database;
pub use error::StoreError;
pub use messages::{MemoryMessageLog, MessageLog, SqliteMessageLog};
pub use sessions::{MemorySessionStore, SessionStore, SqliteSessionStore};
