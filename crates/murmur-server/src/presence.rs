//! Announcing a connection: tell it who it is, persist its session, and
//! rebroadcast the roster to everyone.

use murmur_core::{session, ServerEvent};
use tracing::{debug, error};

use crate::bus::{Envelope, Target};
use crate::client::{ClientId, ClientRegistry};
use crate::error::ServerError;
use crate::negotiate::Identity;
use crate::services::Services;

/// The `session` frame a connection receives before anything else. Pass it
/// to [`ClientRegistry::register_with`].
pub fn greeting(identity: &Identity) -> Result<String, ServerError> {
    let hello = ServerEvent::Session {
        session_id: identity.session_id.clone(),
        user_id: identity.user_id.clone(),
    };
    Ok(hello.to_frame()?)
}

/// Run the on-connect sequence for a client registered with its greeting.
///
/// A failed session write is logged and the connection continues; a failed
/// roster read skips the broadcast.
pub async fn announce(
    services: &Services,
    registry: &ClientRegistry,
    client_id: &ClientId,
    identity: &Identity,
) -> Result<(), ServerError> {
    if let Err(e) = services.sessions.save_session(identity.session()).await {
        error!(error = %e, "Failed to persist session");
    }

    registry.join_group(client_id, &identity.user_id);

    let sessions = match services.sessions.find_all_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            error!(error = %e, "Failed to read roster");
            return Ok(());
        }
    };
    debug!(users = sessions.len(), "Broadcasting roster");

    let roster = ServerEvent::ConnectedUsers(session::roster(&sessions));
    services.bus.publish(Envelope::new(Target::All, &roster)?).await
}
