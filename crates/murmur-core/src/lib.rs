pub mod ids;
pub mod message;
pub mod protocol;
pub mod session;

pub use ids::{SessionId, UserId};
pub use message::{conversation_key, StoredMessage};
pub use protocol::{ClientEvent, Handshake, NewMessageRequest, ProtocolError, ServerEvent};
pub use session::{RosterEntry, Session, DEFAULT_USERNAME};
