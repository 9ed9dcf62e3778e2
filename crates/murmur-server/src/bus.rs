//! Pub/sub adapters that carry server events to connections, wherever they live.
//!
//! [`LocalBus`] delivers within one process. [`SqliteBus`] routes every event
//! through a table in a database file shared by all processes, so a user's
//! connections receive deliveries regardless of which process holds them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::{ServerEvent, UserId};
use murmur_store::{BusRepo, Database};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::ServerError;

const LOCAL_CAPACITY: usize = 1024;
const POLL_BATCH: u32 = 500;
const PRUNE_EVERY_TICKS: u64 = 100;

/// Who an event is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// The delivery group of one user.
    User(UserId),
    /// Every connection.
    All,
}

impl Target {
    pub fn encode(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::All => "all".into(),
        }
    }

    pub fn decode(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            other => other
                .strip_prefix("user:")
                .filter(|id| !id.is_empty())
                .map(|id| Self::User(UserId::from_raw(id))),
        }
    }
}

/// A serialized server event and its audience.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub target: Target,
    pub frame: String,
}

impl Envelope {
    pub fn new(target: Target, event: &ServerEvent) -> Result<Self, ServerError> {
        Ok(Self {
            target,
            frame: event.to_frame()?,
        })
    }
}

#[async_trait]
pub trait DeliveryBus: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), ServerError>;

    /// Envelopes addressed to this process's connections.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Start any background work the adapter needs.
    async fn start(self: Arc<Self>, _shutdown: CancellationToken) -> Result<Option<JoinHandle<()>>, ServerError> {
        Ok(None)
    }
}

/// In-process bus. Delivery is only correct within a single process.
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryBus for LocalBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), ServerError> {
        // No receivers just means no bridge is running yet.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

/// Bus backed by the shared `bus_events` table.
pub struct SqliteBus {
    repo: BusRepo,
    origin: String,
    local: broadcast::Sender<Envelope>,
    poll_interval: Duration,
    retention: Duration,
}

impl SqliteBus {
    pub fn new(db: Database, poll_interval: Duration, retention: Duration) -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            repo: BusRepo::new(db),
            origin: format!("proc_{}_{}", std::process::id(), Uuid::now_v7()),
            local,
            poll_interval,
            retention,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Forward every event past `cursor` to local subscribers and advance it.
    pub async fn pump_once(&self, cursor: &mut i64) -> Result<Pumped, ServerError> {
        let rows = self.repo.read_after(*cursor, POLL_BATCH).await?;
        let mut pumped = Pumped::default();
        for row in rows {
            *cursor = row.seq;
            let Some(target) = Target::decode(&row.target) else {
                warn!(seq = row.seq, origin = %row.origin, audience = %row.target, "Skipping bus event with unknown target");
                continue;
            };
            if row.origin != self.origin {
                pumped.from_peers += 1;
            }
            let _ = self.local.send(Envelope {
                target,
                frame: row.payload,
            });
            pumped.forwarded += 1;
        }
        Ok(pumped)
    }
}

/// What one [`SqliteBus::pump_once`] pass forwarded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pumped {
    pub forwarded: usize,
    /// Of those, how many were published by another process.
    pub from_peers: usize,
}

#[async_trait]
impl DeliveryBus for SqliteBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), ServerError> {
        let seq = self
            .repo
            .append(envelope.target.encode(), envelope.frame, self.origin.clone())
            .await?;
        debug!(seq, "Published bus event");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.local.subscribe()
    }

    async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<Option<JoinHandle<()>>, ServerError> {
        // Only events published from now on are relevant to this process.
        let mut cursor = self.repo.tail().await?;
        info!(cursor, origin = %self.origin, "Shared bus attached");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.pump_once(&mut cursor).await {
                    Ok(Pumped { forwarded: 0, .. }) => {}
                    Ok(Pumped { forwarded, from_peers }) => {
                        trace!(forwarded, from_peers, cursor, "Forwarded bus events");
                    }
                    Err(e) => warn!(error = %e, cursor, "Bus poll failed"),
                }

                ticks += 1;
                if ticks % PRUNE_EVERY_TICKS == 0 {
                    match self.repo.prune(self.retention.as_millis() as i64).await {
                        Ok(0) => {}
                        Ok(n) => debug!(pruned = n, "Pruned bus events"),
                        Err(e) => warn!(error = %e, "Bus prune failed"),
                    }
                }
            }
            info!("Shared bus detached");
        });

        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::SessionId;

    fn session_event() -> ServerEvent {
        ServerEvent::Session {
            session_id: SessionId::from_raw("s1"),
            user_id: UserId::from_raw("u1"),
        }
    }

    #[test]
    fn target_encoding() {
        let user = Target::User(UserId::from_raw("abc"));
        assert_eq!(user.encode(), "user:abc");
        assert_eq!(Target::decode("user:abc"), Some(user));
        assert_eq!(Target::decode("all"), Some(Target::All));
        assert_eq!(Target::decode("user:"), None);
        assert_eq!(Target::decode("room:x"), None);
    }

    #[tokio::test]
    async fn local_bus_delivers_to_subscribers() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Envelope::new(Target::All, &session_event()).unwrap())
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.target, Target::All);
        assert!(got.frame.contains("\"session\""));
    }

    #[tokio::test]
    async fn local_bus_publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        assert!(bus
            .publish(Envelope::new(Target::All, &session_event()).unwrap())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn sqlite_bus_crosses_instances_sharing_a_database() {
        let db = Database::in_memory().unwrap();
        let publisher = SqliteBus::new(db.clone(), Duration::from_millis(10), Duration::from_secs(60));
        let consumer = SqliteBus::new(db, Duration::from_millis(10), Duration::from_secs(60));
        assert_ne!(publisher.origin(), consumer.origin());

        let mut rx = consumer.subscribe();
        let mut cursor = 0;

        let target = Target::User(UserId::from_raw("bob"));
        publisher
            .publish(Envelope::new(target.clone(), &session_event()).unwrap())
            .await
            .unwrap();

        let pumped = consumer.pump_once(&mut cursor).await.unwrap();
        assert_eq!(pumped, Pumped { forwarded: 1, from_peers: 1 });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.target, target);

        // Cursor advanced: nothing is forwarded twice.
        assert_eq!(consumer.pump_once(&mut cursor).await.unwrap().forwarded, 0);
    }

    #[tokio::test]
    async fn own_events_are_forwarded_but_not_counted_as_peer_traffic() {
        let db = Database::in_memory().unwrap();
        let bus = SqliteBus::new(db.clone(), Duration::from_millis(10), Duration::from_secs(60));
        let peer = SqliteBus::new(db, Duration::from_millis(10), Duration::from_secs(60));
        let mut rx = bus.subscribe();
        let mut cursor = 0;

        bus.publish(Envelope::new(Target::All, &session_event()).unwrap())
            .await
            .unwrap();
        peer.publish(Envelope::new(Target::All, &session_event()).unwrap())
            .await
            .unwrap();

        let pumped = bus.pump_once(&mut cursor).await.unwrap();
        assert_eq!(pumped, Pumped { forwarded: 2, from_peers: 1 });
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn sqlite_bus_background_pump_forwards_new_events() {
        let db = Database::in_memory().unwrap();
        let bus = Arc::new(SqliteBus::new(db, Duration::from_millis(10), Duration::from_secs(60)));
        let mut rx = bus.subscribe();
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&bus).start(shutdown.clone()).await.unwrap().unwrap();

        bus.publish(Envelope::new(Target::All, &session_event()).unwrap())
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.target, Target::All);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
