use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{Envelope, Target};
use crate::client::ClientRegistry;

/// Drains the delivery bus and hands each envelope to the matching local
/// connections: a user's delivery group, or everyone.
pub struct DeliveryBridge {
    registry: Arc<ClientRegistry>,
}

impl DeliveryBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver one envelope. Returns how many local connections accepted it.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        match &envelope.target {
            Target::User(user_id) => self.registry.send_to_user(user_id, &envelope.frame),
            Target::All => self.registry.broadcast_all(&envelope.frame),
        }
    }

    /// Spawn the delivery loop.
    pub fn start(
        self,
        mut rx: broadcast::Receiver<Envelope>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(envelope) => {
                        let recipients = self.deliver(&envelope);
                        tracing::trace!(audience = %envelope.target.encode(), recipients, "Delivered envelope");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Delivery bridge lagged, dropped envelopes");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Delivery bus closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create a delivery bridge wired to a bus subscription.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<Envelope>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    DeliveryBridge::new(registry).start(rx, shutdown)
}
